use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

use crate::config::{AlertChannel, AlertConfig};
use crate::run::AlertEvent;

/// Outbound notification channel for failed runs.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn channel(&self) -> &'static str;
    async fn notify(&self, event: &AlertEvent) -> Result<()>;
}

/// Rendered alert as delivered to a recipient.
#[derive(Debug, Clone, Serialize)]
pub struct AlertMessage<'a> {
    pub recipient: &'a str,
    pub subject: String,
    pub body: String,
    pub event: &'a AlertEvent,
}

impl<'a> AlertMessage<'a> {
    pub fn render(service: &str, recipient: &'a str, event: &'a AlertEvent) -> Self {
        let subject = format!(
            "[{}] ingestion run {} failed at {}",
            service, event.run_id, event.failed_stage
        );
        let body = format!(
            "Format {} failed during {} after {} attempt(s) ({} error): {}\nOccurred at {}",
            event.format,
            event.failed_stage,
            event.attempts,
            event.error_kind,
            event.reason,
            event.occurred_at.to_rfc3339()
        );
        Self {
            recipient,
            subject,
            body,
            event,
        }
    }
}

/// Writes alerts to the process log at ERROR level.
pub struct LogAlertSink {
    service: String,
    recipient: String,
}

impl LogAlertSink {
    pub fn new(service: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            recipient: recipient.into(),
        }
    }
}

#[async_trait]
impl AlertSink for LogAlertSink {
    fn channel(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        let message = AlertMessage::render(&self.service, &self.recipient, event);
        error!(
            recipient = message.recipient,
            run_id = %event.run_id,
            format = %event.format,
            stage = %event.failed_stage,
            reason = event.reason.as_str(),
            "{}",
            message.subject
        );
        Ok(())
    }
}

/// Appends one JSON line per alert to a spool file for an external mailer.
pub struct SpoolAlertSink {
    service: String,
    recipient: String,
    path: PathBuf,
}

impl SpoolAlertSink {
    pub fn new(service: impl Into<String>, recipient: impl Into<String>, path: PathBuf) -> Self {
        Self {
            service: service.into(),
            recipient: recipient.into(),
            path,
        }
    }
}

#[async_trait]
impl AlertSink for SpoolAlertSink {
    fn channel(&self) -> &'static str {
        "spool"
    }

    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        let message = AlertMessage::render(&self.service, &self.recipient, event);
        let mut line = serde_json::to_vec(&message).context("Failed to serialize alert")?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create alert spool directory: {}", parent.display())
            })?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open alert spool: {}", self.path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("Failed to append alert spool: {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }
}

/// POSTs the rendered alert as JSON.
pub struct WebhookAlertSink {
    service: String,
    recipient: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookAlertSink {
    pub fn new(
        service: impl Into<String>,
        recipient: impl Into<String>,
        url: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            service: service.into(),
            recipient: recipient.into(),
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn channel(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        let message = AlertMessage::render(&self.service, &self.recipient, event);
        let response = self
            .client
            .post(&self.url)
            .json(&message)
            .send()
            .await
            .with_context(|| format!("Failed to reach alert webhook: {}", self.url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("Alert webhook {} responded with {}", self.url, status);
        }
        Ok(())
    }
}

pub fn build_sink(service: &str, config: &AlertConfig) -> Result<Arc<dyn AlertSink>> {
    let sink: Arc<dyn AlertSink> = match &config.channel {
        AlertChannel::Log => Arc::new(LogAlertSink::new(service, &config.recipient)),
        AlertChannel::Spool { path } => Arc::new(SpoolAlertSink::new(
            service,
            &config.recipient,
            path.clone(),
        )),
        AlertChannel::Webhook { url } => {
            Arc::new(WebhookAlertSink::new(service, &config.recipient, url)?)
        }
    };
    Ok(sink)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl From<&AlertConfig> for DeliveryPolicy {
    fn from(config: &AlertConfig) -> Self {
        Self {
            attempts: config.delivery_attempts.max(1),
            delay: Duration::from_millis(config.delivery_delay_ms),
        }
    }
}

/// Deliver `event`, retrying the sink up to `policy.attempts` times.
///
/// Returns whether delivery succeeded. Failures are logged and never
/// propagated.
pub async fn deliver(sink: &dyn AlertSink, event: &AlertEvent, policy: &DeliveryPolicy) -> bool {
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        match sink.notify(event).await {
            Ok(()) => return true,
            Err(err) if attempt < attempts => {
                warn!(
                    channel = sink.channel(),
                    run_id = %event.run_id,
                    attempt,
                    error = %err,
                    "Alert delivery failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => {
                error!(
                    channel = sink.channel(),
                    run_id = %event.run_id,
                    attempts,
                    error = ?err,
                    "Alert delivery abandoned"
                );
            }
        }
    }
    false
}
