//! Writer and Reader against a scripted nsqd on a local socket.
mod common;

use std::time::Duration;

use bytes::Bytes;
use nsq_client::{
    ClientError, ClientEvent, Endpoints, MessageId, Publisher, RawMessage, Reader, ReaderConfig,
    SubClient, Writer,
    protocol::{CLOSE_WAIT, Frame, HEARTBEAT, OK},
};
use tokio::net::TcpListener;

use crate::common::{Peer, next_event, options, reader_config, wait_closed};

#[tokio::test]
async fn test_writer_publish_waits_for_ok() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (writer, mut events) = Writer::connect(Endpoints::Nsqd(vec![addr]), options());

    let mut peer = Peer::accept(&listener).await;
    assert!(matches!(next_event(&mut events).await, ClientEvent::Ready));

    let (res, ()) = tokio::join!(writer.publish("events", Bytes::from_static(b"foo")), async {
        assert_eq!(peer.line().await, "PUB events");
        assert_eq!(peer.sized().await, b"foo");
        peer.send(Frame::Response(Bytes::from_static(OK))).await;
    });
    res.unwrap();

    let (res, ()) = tokio::join!(writer.publish("events", Bytes::from_static(b"bar")), async {
        assert_eq!(peer.line().await, "PUB events");
        assert_eq!(peer.sized().await, b"bar");
        peer.send(Frame::Error(Bytes::from_static(b"E_PUB_FAILED"))).await;
    });
    assert!(matches!(res, Err(ClientError::Broker(msg)) if msg == "E_PUB_FAILED"));

    writer.close();
    writer.close();
    assert!(writer.is_closed());
    wait_closed(&mut events).await;
    assert!(matches!(
        writer.publish("events", Bytes::new()).await,
        Err(ClientError::Closed)
    ));
}

#[tokio::test]
async fn test_publish_without_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (writer, _events) = Writer::connect(Endpoints::Nsqd(vec![addr]), options());
    // handshake never completes, so nothing is live yet
    assert!(matches!(
        writer.publish("events", Bytes::from_static(b"foo")).await,
        Err(ClientError::NotConnected(_))
    ));
}

#[tokio::test]
async fn test_reader_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (reader, mut events) =
        Reader::connect(Endpoints::Nsqd(vec![addr]), reader_config(3), options());

    let mut peer = Peer::accept(&listener).await;
    assert_eq!(peer.line().await, "SUB events workers");
    peer.send(Frame::Response(Bytes::from_static(OK))).await;
    assert_eq!(peer.line().await, "RDY 25");
    assert!(matches!(next_event(&mut events).await, ClientEvent::Ready));

    peer.send(Frame::Response(Bytes::from_static(HEARTBEAT))).await;
    assert_eq!(peer.line().await, "NOP");

    peer.send(Frame::Message(RawMessage {
        timestamp: 1,
        attempts: 1,
        id: MessageId::from(7),
        body: Bytes::from_static(b"foo"),
    }))
    .await;
    match next_event(&mut events).await {
        ClientEvent::Message(msg) => {
            assert_eq!(msg.body().as_ref(), b"foo");
            assert!(msg.finish());
        }
        other => panic!("expected message, got {other:?}"),
    }
    assert_eq!(peer.line().await, "FIN 0000000000000007");

    peer.send(Frame::Message(RawMessage {
        timestamp: 2,
        attempts: 4,
        id: MessageId::from(8),
        body: Bytes::from_static(b"bar"),
    }))
    .await;
    match next_event(&mut events).await {
        ClientEvent::Discard(msg) => {
            assert_eq!(msg.attempts(), 4);
            msg.requeue(Duration::from_millis(1500));
        }
        other => panic!("expected discard, got {other:?}"),
    }
    assert_eq!(peer.line().await, "REQ 0000000000000008 1500");

    reader.close();
    assert_eq!(peer.line().await, "CLS");
    peer.send(Frame::Response(Bytes::from_static(CLOSE_WAIT))).await;
    wait_closed(&mut events).await;
}

#[tokio::test]
async fn test_reader_gives_up_after_max_connection_attempts() {
    // grab a free port, then make sure nothing listens on it
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let config = ReaderConfig {
        max_connection_attempts: Some(2),
        ..reader_config(3)
    };
    let (_reader, mut events) = Reader::connect(Endpoints::Nsqd(vec![addr]), config, options());

    let mut connect_failures = 0;
    loop {
        match next_event(&mut events).await {
            ClientEvent::Error(ClientError::Io { .. }) => connect_failures += 1,
            ClientEvent::Error(ClientError::AttemptsExhausted { attempts, .. }) => {
                assert_eq!(attempts, 2);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(connect_failures, 2);
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Error(ClientError::NotConnected(_))
    ));
}
