//! Delivery of outbound chat messages.
//!
//! The chat platform itself lives outside this service. When a bridge URL
//! is configured each message is POSTed there as JSON; otherwise messages
//! are only logged, which is enough for local runs.

use crate::services::notify::ChatMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct ChatBridge {
    http: reqwest::Client,
    url: Option<String>,
}

impl ChatBridge {
    pub fn new(url: Option<String>, timeout: std::time::Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { http, url }
    }

    /// Drain the outbox until every sender is dropped.
    pub fn spawn(self, mut outbox: mpsc::UnboundedReceiver<ChatMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                self.deliver(&message).await;
            }
            tracing::info!("Chat outbox closed");
        })
    }

    /// Deliver one message. Failures are logged; chat delivery is not retried.
    pub async fn deliver(&self, message: &ChatMessage) {
        let Some(url) = &self.url else {
            tracing::info!(
                user = %message.user,
                actions = message.actions.len(),
                body = %message.body,
                "Chat message (no bridge configured)"
            );
            return;
        };

        match self.http.post(url).json(message).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(user = %message.user, "Chat message delivered");
            }
            Ok(response) => {
                tracing::warn!(
                    user = %message.user,
                    status = %response.status(),
                    "Chat bridge rejected message"
                );
            }
            Err(e) => {
                tracing::warn!(user = %message.user, error = %e, "Chat bridge unreachable");
            }
        }
    }
}
