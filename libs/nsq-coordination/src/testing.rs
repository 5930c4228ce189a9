//! Test doubles: a connector whose sub-clients do nothing on their own, so
//! tests decide which events arrive and in what order.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use nsq_client::{
    ClientEvent, ClientResult, Connector, Endpoints, EventStream, Message, MessageId, Publisher,
    RawMessage, ReaderConfig, Responder, Role, SubClient,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Records FIN/REQ/TOUCH as text.
#[derive(Debug, Default)]
pub(crate) struct Acks(Mutex<Vec<String>>);

impl Acks {
    pub(crate) fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl Responder for Acks {
    fn finish(&self, id: MessageId) {
        self.0.lock().push(format!("FIN {id}"));
    }

    fn requeue(&self, id: MessageId, delay: Duration) {
        self.0.lock().push(format!("REQ {id} {}", delay.as_millis()));
    }

    fn touch(&self, id: MessageId) {
        self.0.lock().push(format!("TOUCH {id}"));
    }
}

pub(crate) fn message(id: u64, attempts: u16, body: &'static [u8], acks: &Arc<Acks>) -> Message {
    Message::new(
        RawMessage {
            timestamp: 0,
            attempts,
            id: MessageId::from(id),
            body: Bytes::from_static(body),
        },
        acks.clone(),
    )
}

#[derive(Debug, Default)]
pub(crate) struct Script {
    pub(crate) writer_endpoints: Option<Endpoints>,
    pub(crate) reader_endpoints: Option<Endpoints>,
    pub(crate) reader_config: Option<ReaderConfig>,
    pub(crate) closes: Vec<Role>,
    pub(crate) published: Vec<(String, Bytes)>,
    writer_tx: Option<mpsc::UnboundedSender<ClientEvent>>,
    reader_tx: Option<mpsc::UnboundedSender<ClientEvent>>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    pub(crate) fn script(&self) -> parking_lot::MutexGuard<'_, Script> {
        self.script.lock()
    }

    /// Push `event` as if `role`'s sub-client produced it.
    pub(crate) fn emit(&self, role: Role, event: ClientEvent) {
        let script = self.script.lock();
        let tx = match role {
            Role::Writer => script.writer_tx.as_ref(),
            Role::Reader => script.reader_tx.as_ref(),
        };
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }

    pub(crate) fn closes(&self) -> Vec<Role> {
        self.script.lock().closes.clone()
    }

    fn client(&self, role: Role) -> (ScriptedClient, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut script = self.script.lock();
        match role {
            Role::Writer => script.writer_tx = Some(tx),
            Role::Reader => script.reader_tx = Some(tx),
        }
        let client = ScriptedClient {
            role,
            script: self.script.clone(),
            closed: AtomicBool::new(false),
        };
        (client, rx)
    }
}

#[derive(Debug)]
pub(crate) struct ScriptedClient {
    role: Role,
    script: Arc<Mutex<Script>>,
    closed: AtomicBool,
}

impl SubClient for ScriptedClient {
    fn role(&self) -> Role {
        self.role
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut script = self.script.lock();
        script.closes.push(self.role);
        let tx = match self.role {
            Role::Writer => script.writer_tx.as_ref(),
            Role::Reader => script.reader_tx.as_ref(),
        };
        if let Some(tx) = tx {
            let _ = tx.send(ClientEvent::Closed);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Publisher for ScriptedClient {
    async fn publish(&self, topic: &str, body: Bytes) -> ClientResult<()> {
        self.script.lock().published.push((topic.to_owned(), body));
        Ok(())
    }
}

impl Connector for ScriptedConnector {
    type Writer = ScriptedClient;
    type Reader = ScriptedClient;

    fn writer(&self, endpoints: Endpoints) -> (ScriptedClient, EventStream) {
        self.script.lock().writer_endpoints = Some(endpoints);
        self.client(Role::Writer)
    }

    fn reader(&self, endpoints: Endpoints, config: ReaderConfig) -> (ScriptedClient, EventStream) {
        {
            let mut script = self.script.lock();
            script.reader_endpoints = Some(endpoints);
            script.reader_config = Some(config);
        }
        self.client(Role::Reader)
    }
}
