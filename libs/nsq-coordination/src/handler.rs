use std::time::Duration;

use async_trait::async_trait;
use nsq_client::Message;

/// longest delay a failed message is requeued with
pub const MAX_REQUEUE_DELAY: Duration = Duration::from_secs(60);

/// Consumer of reader messages.
///
/// `Ok` finishes the message and `Err` requeues it with a delay growing with
/// its attempts. A handler that finishes or requeues the message itself is
/// left alone.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, msg: &Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, msg: &Message) -> anyhow::Result<()> {
        self(msg)
    }
}

/// `base * attempts`, capped at [`MAX_REQUEUE_DELAY`]
pub fn requeue_delay(base: Duration, attempts: u16) -> Duration {
    base.saturating_mul(u32::from(attempts.max(1)))
        .min(MAX_REQUEUE_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_delay() {
        let base = Duration::from_secs(1);
        assert_eq!(requeue_delay(base, 0), Duration::from_secs(1));
        assert_eq!(requeue_delay(base, 1), Duration::from_secs(1));
        assert_eq!(requeue_delay(base, 3), Duration::from_secs(3));
        assert_eq!(requeue_delay(base, 500), MAX_REQUEUE_DELAY);
        assert_eq!(requeue_delay(Duration::ZERO, 5), Duration::ZERO);
    }
}
