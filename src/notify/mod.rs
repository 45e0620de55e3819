// src/notify/mod.rs
//! Fire-and-forget notifications. The trading loop only ever calls
//! [`Notifier::notify`], which never awaits; a dispatcher task delivers each
//! event to every sink in emission order.

pub mod discord;
pub mod log;

use crate::types::Event;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

pub use discord::DiscordWebhook;
pub use log::LogSink;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, event: &Event) -> anyhow::Result<()>;
}

/// Cloneable handle onto the notification queue.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Event>,
}

impl Notifier {
    /// Bare queue without a dispatcher. Tests read the receiver directly.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue plus a dispatcher task fanning events out to `sinks`. The task
    /// ends once every `Notifier` clone is dropped and the queue is drained.
    pub fn spawn(
        sinks: Vec<Box<dyn NotificationSink>>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (notifier, rx) = Self::channel(capacity);
        let handle = tokio::spawn(dispatch(rx, sinks));
        (notifier, handle)
    }

    pub fn notify(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Notification queue full, dropping: {}", event.title());
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                error!("Notification queue closed, dropping: {}", event.title());
            }
        }
    }
}

async fn dispatch(mut rx: mpsc::Receiver<Event>, sinks: Vec<Box<dyn NotificationSink>>) {
    while let Some(event) = rx.recv().await {
        for sink in &sinks {
            if let Err(e) = sink.notify(&event).await {
                warn!(sink = sink.name(), error = %e, "Notification delivery failed");
            }
        }
    }
}
