use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::{
    ClientOptions, Endpoints, Publisher, Role, SubClient,
    conn::Session,
    error::{ClientError, ClientResult},
    event::EventStream,
    pool::Pool,
    protocol::{Command, OK},
};

/// Publishes to nsqd. Connections are used round-robin.
#[derive(Debug)]
pub struct Writer {
    pool: Arc<Pool>,
}

impl Writer {
    /// Start connecting. Writers reconnect forever; lookupd endpoints are
    /// polled at `options.poll_interval`.
    pub fn connect(endpoints: Endpoints, options: Arc<ClientOptions>) -> (Self, EventStream) {
        let poll_interval = options.poll_interval;
        let (pool, events) = Pool::start(endpoints, Session::Writer, options, None, poll_interval);
        (Self { pool }, events)
    }
}

impl SubClient for Writer {
    fn role(&self) -> Role {
        Role::Writer
    }

    fn close(&self) {
        self.pool.close();
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

#[async_trait]
impl Publisher for Writer {
    async fn publish(&self, topic: &str, body: Bytes) -> ClientResult<()> {
        if self.pool.is_closed() {
            return Err(ClientError::Closed);
        }
        let conn = self
            .pool
            .next_live()
            .ok_or_else(|| ClientError::NotConnected("no live nsqd connection".into()))?;
        trace!(addr = conn.addr(), topic, len = body.len(), "PUB");
        let resp = conn
            .request(Command::Pub {
                topic: topic.to_owned(),
                body,
            })
            .await?;
        if resp == OK {
            Ok(())
        } else {
            Err(ClientError::Protocol(format!(
                "unexpected PUB response: {}",
                String::from_utf8_lossy(&resp)
            )))
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.pool.close();
    }
}
