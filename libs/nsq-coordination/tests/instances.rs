//! Kept in its own binary: it reads the process-wide ready gauge, which every
//! other system started in the same process would move.
use std::time::Duration;

use config::ConnectionConfig;
use nsq_coordination::{Coordinator, MemoryBroker, NsqSystem, metrics};

async fn start(broker: &MemoryBroker) -> NsqSystem<MemoryBroker> {
    let cfg = ConnectionConfig::parse_str(r#"{"topic": "events", "channel": "workers"}"#).unwrap();
    Coordinator::new(cfg, broker.clone())
        .with_reader()
        .start()
        .unwrap()
        .ready_within(Duration::from_secs(1))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_independent_systems_in_one_process() {
    let a = start(&MemoryBroker::new()).await;
    let b = start(&MemoryBroker::new()).await;
    let b_readiness = b.readiness();
    assert_eq!(metrics::SYSTEM_READY.get(), 2);

    assert!(a.shutdown());
    assert!(!a.is_ready());
    assert!(b.is_ready());
    assert!(b_readiness.is_ready());
    assert_eq!(metrics::SYSTEM_READY.get(), 1);
    b.publish("events", "still up").await.unwrap();

    // repeated shutdown does not count twice
    assert!(!a.shutdown());
    assert_eq!(metrics::SYSTEM_READY.get(), 1);

    drop(b);
    assert!(!b_readiness.is_ready());
    assert_eq!(metrics::SYSTEM_READY.get(), 0);
}
