use async_trait::async_trait;
use metrics::counter;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{NotificationDispatcher, ProcessedItemEvent};
use crate::source::EventKind;

/// Posts each event as an embed to a Discord webhook.
/// Retries are internal to this sink; the core never sees them.
#[derive(Clone)]
pub struct DiscordDispatcher {
    webhook: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl DiscordDispatcher {
    pub fn new(webhook: String) -> Self {
        Self {
            webhook,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    async fn post(&self, payload: &DiscordWebhookPayload) -> Result<(), String> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.webhook)
                .timeout(self.timeout)
                .json(payload)
                .send()
                .await;

            let err = match res {
                Ok(rsp) => match rsp.error_for_status_ref() {
                    Ok(_) => return Ok(()),
                    Err(e) => format!("Discord webhook HTTP error: {e}"),
                },
                Err(e) => format!("Discord webhook request failed: {e}"),
            };
            if attempt >= self.max_retries {
                return Err(err);
            }
            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
        }
    }
}

#[async_trait]
impl NotificationDispatcher for DiscordDispatcher {
    async fn dispatch(&self, event: &ProcessedItemEvent) {
        let payload = DiscordWebhookPayload::from_event(event);
        if let Err(e) = self.post(&payload).await {
            tracing::warn!(
                target: "notify",
                item_id = %event.item_id,
                error = %e,
                "discord delivery failed"
            );
            counter!("notify_dropped_total", "sink" => "discord").increment(1);
        }
    }

    fn name(&self) -> &'static str {
        "discord"
    }
}

#[derive(Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
}

#[derive(Serialize)]
struct DiscordWebhookPayload {
    content: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

impl DiscordWebhookPayload {
    fn from_event(ev: &ProcessedItemEvent) -> Self {
        let title = match ev.kind {
            EventKind::Content => format!("New post from {}", ev.source_id),
            EventKind::PatternMatch => format!("Match in {}", ev.source_id),
            EventKind::Priority => format!("PRIORITY match in {}", ev.source_id),
            EventKind::Transaction => format!("Transaction on {}", ev.source_id),
        };

        let text = ev
            .payload
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let mut description = String::new();
        if ev.match_key != ev.item_id {
            description.push_str(&format!("**Match:** `{}`\n", ev.match_key));
        }
        description.push_str(&format!("**Item:** {}\n", ev.item_id));
        if !text.is_empty() {
            description.push_str(text);
        }

        Self {
            // Priority events ping the channel.
            content: ev.is_priority().then(|| "@here".to_string()),
            embeds: vec![DiscordEmbed { title, description }],
        }
    }
}
