use std::sync::Arc;

use tracing::debug;

use crate::{
    ClientOptions, Endpoints, ReaderConfig, Role, SubClient,
    conn::Session,
    event::{EventStream, Events},
    message::Message,
    pool::Pool,
};

/// Consumes one topic/channel from every nsqd it finds.
#[derive(Debug)]
pub struct Reader {
    pool: Arc<Pool>,
    config: Arc<ReaderConfig>,
}

impl Reader {
    /// Start connecting and subscribe to `config.topic`/`config.channel`.
    pub fn connect(
        endpoints: Endpoints,
        config: ReaderConfig,
        options: Arc<ClientOptions>,
    ) -> (Self, EventStream) {
        let config = Arc::new(config);
        let (pool, events) = Pool::start(
            endpoints,
            Session::Reader(config.clone()),
            options,
            config.max_connection_attempts,
            config.poll_interval,
        );
        (Self { pool, config }, events)
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }
}

impl SubClient for Reader {
    fn role(&self) -> Role {
        Role::Reader
    }

    fn close(&self) {
        self.pool.close();
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.pool.close();
    }
}

/// Hand a delivery to the owner, as a discard once it has been tried more
/// than `max_attempts` times (`0` never discards).
pub(crate) fn dispatch(events: &Events, max_attempts: u16, msg: Message) {
    if max_attempts > 0 && msg.attempts() > max_attempts {
        debug!(id = %msg.id(), attempts = msg.attempts(), max_attempts, "discarding message");
        events.discard(msg);
    } else {
        events.message(msg);
    }
}
