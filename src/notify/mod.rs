use reqwest::Client;
use serde_json::json;
use std::time::Duration;

/// Fire-and-forget sink for human-readable operational events
///
/// Implementations must never block the caller or report failures back.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Writes notifications to the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        tracing::info!(target: "tradecore::notify", "{}", message);
    }
}

/// Posts notifications to a chat webhook (Discord/Slack style `{"content": ...}` body)
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Deliver one message and wait for the response
    pub async fn send(&self, message: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "content": message }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Webhook returned {}", status);
        }
        Ok(())
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, message: &str) {
        tracing::info!(target: "tradecore::notify", "{}", message);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime available, webhook notification dropped");
            return;
        };
        let notifier = self.clone();
        let message = message.to_string();
        handle.spawn(async move {
            if let Err(e) = notifier.send(&message).await {
                tracing::warn!("Webhook notification failed: {}", e);
            }
        });
    }
}
