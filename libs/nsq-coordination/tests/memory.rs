use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use config::ConnectionConfig;
use nsq_coordination::{
    ClientState, Coordinator, MemoryBroker, Message, NsqSystem, Role, metrics,
};
use tokio::sync::mpsc;

fn config(s: &str) -> ConnectionConfig {
    ConnectionConfig::parse_str(s).unwrap()
}

async fn start(broker: &MemoryBroker, cfg: &str) -> NsqSystem<MemoryBroker> {
    Coordinator::new(config(cfg), broker.clone())
        .with_reader()
        .start()
        .unwrap()
        .ready_within(Duration::from_secs(1))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_publish_reaches_handler() {
    let broker = MemoryBroker::new();
    let system = start(&broker, r#"{"topic": "events", "channel": "workers"}"#).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    system
        .on_message(move |msg: &Message| -> anyhow::Result<()> {
            tx.send(msg.body().clone())?;
            Ok(())
        })
        .unwrap();
    system.publish("events", "foo").await.unwrap();

    let body = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap();
    assert_eq!(body, Some(Bytes::from_static(b"foo")));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.in_flight("events", "workers"), 0);
    assert_eq!(broker.depth("events", "workers"), 0);

    assert!(system.shutdown());
    assert_eq!(system.client_state(Role::Reader), Some(ClientState::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_failing_message_is_discarded_after_max_attempts() {
    let broker = MemoryBroker::new();
    let system = start(
        &broker,
        r#"{"topic": "events", "channel": "workers", "max_attempts": 3, "requeue_delay": 10}"#,
    )
    .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    system
        .on_message(move |_: &Message| -> anyhow::Result<()> {
            seen.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("always fails")
        })
        .unwrap();
    system.publish("events", "poison").await.unwrap();

    // delays are 10ms, 20ms, 30ms; give redelivery plenty of room
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // the only test in this binary that discards
    assert_eq!(metrics::DISCARDS.get(), 1);
    assert_eq!(broker.in_flight("events", "workers"), 0);
    assert_eq!(broker.depth("events", "workers"), 0);
    assert_eq!(broker.deferred("events", "workers"), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(metrics::DISCARDS.get(), 1);
}

#[tokio::test]
async fn test_shutdown_returns_unhandled_messages() {
    let broker = MemoryBroker::new();
    let system = start(&broker, r#"{"topic": "events", "channel": "workers"}"#).await;

    // no handler registered, so deliveries stay in flight
    system.publish("events", "one").await.unwrap();
    system.publish("events", "two").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.in_flight("events", "workers"), 2);

    system.shutdown();
    assert_eq!(broker.in_flight("events", "workers"), 0);
    assert_eq!(broker.depth("events", "workers"), 2);
}
