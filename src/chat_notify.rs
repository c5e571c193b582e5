// src/chat_notify.rs

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat webhook rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Announces a finished run. Never fails the caller: delivery problems are logged.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, link: &str, summary: &str);
}

pub fn compose_message(link: &str, summary: &str) -> String {
    format!(
        "Good day!\n\
         The *Invoices vs Purchase Orders* validation report is ready.\n\n\
         {summary}\n\n\
         Link: {link}"
    )
}

/// Google Chat incoming webhook.
pub struct ChatWebhookNotifier {
    client: Client,
    webhook_url: String,
}

impl ChatWebhookNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            webhook_url: webhook_url.into(),
        }
    }

    pub async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "text": text }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for ChatWebhookNotifier {
    async fn notify(&self, link: &str, summary: &str) {
        match self.send(&compose_message(link, summary)).await {
            Ok(()) => info!("Chat notification sent"),
            Err(e) => error!(error = %e, "Failed to send chat notification"),
        }
    }
}

/// Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, link: &str, summary: &str) {
        info!(link = %link, summary = %summary, "Validation run finished (no chat webhook configured)");
    }
}

pub fn build_notifier(webhook_url: Option<&str>) -> Arc<dyn Notifier> {
    match webhook_url {
        Some(url) => Arc::new(ChatWebhookNotifier::new(url)),
        None => Arc::new(LogNotifier),
    }
}
