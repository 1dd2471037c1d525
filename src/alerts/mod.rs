//! Outbound alerts and notifications.
//!
//! All business logic reports through one [`AlertDispatcher`]. Regular
//! notifications and error alerts go through a bounded queue drained by a
//! single worker, so a slow webhook never stalls a trading task; when the
//! queue is full the alert is dropped and logged. Fatal alerts bypass the
//! queue and are delivered directly with a bounded timeout.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AlertConfig;

/// Alert severity, which also selects the webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertLevel {
    /// Trade notifications, connection status
    Notice,
    /// Something failed but the process keeps running
    Error,
    /// The process is about to shut down
    Fatal,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Notice => "NOTICE",
            AlertLevel::Error => "ERROR",
            AlertLevel::Fatal => "FATAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
}

impl Alert {
    pub fn new(level: AlertLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.level.as_str(), self.message)
    }
}

/// Alert transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn post(&self, alert: &Alert) -> Result<()>;
}

/// Discord-style webhook transport: `{"content": message}`.
pub struct WebhookSink {
    http: Client,
    webhook_url: Option<String>,
    error_webhook_url: Option<String>,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    content: &'a str,
}

impl WebhookSink {
    pub fn new(config: &AlertConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create webhook HTTP client")?;

        Ok(Self {
            http,
            webhook_url: config.webhook_url.clone(),
            error_webhook_url: config.error_webhook_url.clone(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn post(&self, alert: &Alert) -> Result<()> {
        let (url, content) = match alert.level {
            AlertLevel::Notice => (self.webhook_url.as_ref(), alert.message.clone()),
            AlertLevel::Error | AlertLevel::Fatal => (
                self.error_webhook_url.as_ref(),
                format!("⚠️{}", alert.message),
            ),
        };

        let Some(url) = url else {
            debug!(level = alert.level.as_str(), "No webhook configured, alert not posted");
            return Ok(());
        };

        self.http
            .post(url)
            .json(&WebhookPayload { content: &content })
            .send()
            .await
            .context("Failed to post webhook")?
            .error_for_status()
            .context("Webhook rejected alert")?;

        Ok(())
    }
}

/// Cloneable front end of the alert queue.
#[derive(Clone)]
pub struct AlertDispatcher {
    tx: mpsc::Sender<Alert>,
    sink: Arc<dyn AlertSink>,
    fatal_timeout: Duration,
}

impl AlertDispatcher {
    /// Start the delivery worker.
    pub fn spawn(
        sink: Arc<dyn AlertSink>,
        capacity: usize,
        fatal_timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Alert>(capacity.max(1));
        let worker_sink = sink.clone();

        let worker = tokio::spawn(async move {
            while let Some(alert) = rx.recv().await {
                if let Err(e) = worker_sink.post(&alert).await {
                    warn!(error = %e, alert = %alert, "Alert delivery failed");
                }
            }
            debug!("Alert queue closed");
        });

        (
            Self {
                tx,
                sink,
                fatal_timeout,
            },
            worker,
        )
    }

    /// Queue a regular notification.
    pub fn notify(&self, message: impl Into<String>) {
        let alert = Alert::new(AlertLevel::Notice, message);
        info!(target: "alert", "{}", alert.message);
        self.enqueue(alert);
    }

    /// Queue an error alert.
    pub fn error(&self, message: impl Into<String>) {
        let alert = Alert::new(AlertLevel::Error, message);
        error!(target: "alert", "{}", alert.message);
        self.enqueue(alert);
    }

    /// Deliver a fatal alert directly, waiting at most `fatal_timeout`.
    ///
    /// Returns whether delivery succeeded; the caller shuts down either way.
    pub async fn fatal(&self, message: impl Into<String>) -> bool {
        let alert = Alert::new(AlertLevel::Fatal, message);
        error!(target: "alert", "FATAL: {}", alert.message);

        match tokio::time::timeout(self.fatal_timeout, self.sink.post(&alert)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Fatal alert delivery failed");
                false
            }
            Err(_) => {
                warn!(timeout = ?self.fatal_timeout, "Fatal alert delivery timed out");
                false
            }
        }
    }

    /// Alerts queued but not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Wait until the queue drains or `timeout` elapses.
    pub async fn flush(&self, timeout: Duration) {
        let drained = tokio::time::timeout(timeout, async {
            while self.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(pending = self.pending(), "Alert queue not drained before exit");
        }
    }

    fn enqueue(&self, alert: Alert) {
        match self.tx.try_send(alert) {
            Ok(()) => {}
            Err(TrySendError::Full(alert)) => {
                warn!(alert = %alert, "Alert queue saturated, dropping alert");
            }
            Err(TrySendError::Closed(alert)) => {
                debug!(alert = %alert, "Alert queue closed, dropping alert");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::recording_dispatcher;
    use super::*;

    #[tokio::test]
    async fn test_notifications_are_delivered_in_order() {
        let (dispatcher, sink) = recording_dispatcher();
        dispatcher.notify("KRW-BTC bought");
        dispatcher.error("KRW-ETH sell failed");
        dispatcher.flush(Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let alerts = sink.alerts.lock().unwrap().clone();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0], Alert::new(AlertLevel::Notice, "KRW-BTC bought"));
        assert_eq!(alerts[1].level, AlertLevel::Error);
    }

    #[tokio::test]
    async fn test_saturated_queue_drops_instead_of_blocking() {
        let mut sink = MockAlertSink::new();
        sink.expect_post().returning(|_| Ok(()));
        let (dispatcher, _worker) =
            AlertDispatcher::spawn(Arc::new(sink), 1, Duration::from_millis(100));

        let started = std::time::Instant::now();
        for i in 0..20 {
            dispatcher.notify(format!("alert {}", i));
        }
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(dispatcher.pending() <= 1);
    }

    #[tokio::test]
    async fn test_fatal_delivery_is_bounded() {
        let mut sink = MockAlertSink::new();
        sink.expect_post()
            .returning(|_| Err(anyhow::anyhow!("webhook unreachable")));
        let (dispatcher, _worker) =
            AlertDispatcher::spawn(Arc::new(sink), 4, Duration::from_millis(100));

        assert!(!dispatcher.fatal("feed exhausted").await);
    }

    #[tokio::test]
    async fn test_fatal_delivered_directly() {
        let (dispatcher, sink) = recording_dispatcher();
        assert!(dispatcher.fatal("ledger unavailable").await);
        assert_eq!(
            sink.messages(AlertLevel::Fatal),
            vec!["ledger unavailable".to_string()]
        );
    }
}
