// src/notify/log.rs
use super::NotificationSink;
use crate::types::{Event, Level};
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Mirrors every event into the tracing log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, event: &Event) -> anyhow::Result<()> {
        match event.level() {
            Level::Info | Level::Success => info!(target: "notify", "{}", event),
            Level::Warning => warn!(target: "notify", "{}", event),
            Level::Error => error!(target: "notify", "{}", event),
        }
        Ok(())
    }
}
