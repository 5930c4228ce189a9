//! The broker end of nsqd connections, shared by the socket tests.
#![allow(dead_code)]
use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use nsq_client::{
    ClientEvent, ClientOptions, EventStream, ReaderConfig,
    protocol::{Frame, OK},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpListener,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn options() -> Arc<ClientOptions> {
    Arc::new(ClientOptions {
        client_id: "test-client".into(),
        connect_timeout: Duration::from_secs(2),
        ..ClientOptions::default()
    })
}

pub fn reader_config(max_attempts: u16) -> ReaderConfig {
    ReaderConfig {
        topic: "events".into(),
        channel: "workers".into(),
        max_in_flight: 25,
        max_attempts,
        max_connection_attempts: None,
        poll_interval: Duration::from_secs(10),
    }
}

/// the broker end of one connection
pub struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    /// accept a client and complete magic + IDENTIFY
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let (read, writer) = stream.into_split();
        let mut peer = Self {
            reader: BufReader::new(read),
            writer,
        };
        let mut magic = [0u8; 4];
        peer.reader.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, b"  V2");
        assert_eq!(peer.line().await, "IDENTIFY");
        let identify: serde_json::Value = serde_json::from_slice(&peer.sized().await).unwrap();
        assert_eq!(identify["client_id"], "test-client");
        assert_eq!(identify["feature_negotiation"], false);
        peer.send(Frame::Response(Bytes::from_static(OK))).await;
        peer
    }

    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        line.trim_end().to_owned()
    }

    pub async fn sized(&mut self) -> Vec<u8> {
        let len = self.reader.read_u32().await.unwrap();
        let mut body = vec![0; len as usize];
        self.reader.read_exact(&mut body).await.unwrap();
        body
    }

    pub async fn send(&mut self, frame: Frame) {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        self.writer.write_all(&buf).await.unwrap();
    }
}

pub async fn next_event(events: &mut EventStream) -> ClientEvent {
    timeout(WAIT, events.recv()).await.unwrap().unwrap()
}

pub async fn wait_closed(events: &mut EventStream) {
    loop {
        if let ClientEvent::Closed = next_event(events).await {
            return;
        }
    }
}
