// src/notify/discord.rs
use super::NotificationSink;
use crate::types::{Event, Level};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;

/// Posts events as Discord embeds. Events below `min_level` are skipped.
pub struct DiscordWebhook {
    url: String,
    client: reqwest::Client,
    min_level: Level,
}

impl DiscordWebhook {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
            min_level: Level::Success,
        })
    }
}

fn color(level: Level) -> u32 {
    match level {
        Level::Info => 6211540,
        Level::Success => 11523935,
        Level::Warning => 13088377,
        Level::Error => 16746375,
    }
}

pub fn embed(event: &Event) -> Value {
    let level = event.level();
    json!({
        "color": color(level),
        "author": { "name": level.as_str() },
        "title": event.title(),
        "description": event.to_string(),
        "timestamp": Utc::now().to_rfc3339(),
    })
}

#[async_trait]
impl NotificationSink for DiscordWebhook {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn notify(&self, event: &Event) -> anyhow::Result<()> {
        if event.level() < self.min_level {
            return Ok(());
        }
        self.client
            .post(&self.url)
            .json(&json!({ "embeds": [embed(event)] }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
