use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

/// Outbound user notifications (subscription reminders, device offline).
/// The real transport - chat bot, webhook - lives outside this crate and
/// is injected at wiring time.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, tg_id: i64, message: &str) -> Result<()>;
}

/// Default notifier: writes the message to the log and nothing else.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, tg_id: i64, message: &str) -> Result<()> {
        info!("notify tg_id={}: {}", tg_id, message);
        Ok(())
    }
}
