//! One-way operator alerts: run failures and data-loss findings.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;
use ygcdm_core::IntegrityWarning;

use crate::StageFailure;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

const DATA_LOSS_HEADLINE: &str = "\u{274C} some data is lost in uploading from YouGile!";

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<()>;
}

/// Posts alerts to a chat through the Telegram Bot API `sendMessage` method.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building telegram client")?;
        Ok(Self {
            client,
            api_base: TELEGRAM_API_BASE.to_string(),
            bot_token,
            chat_id,
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.bot_token)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        self.client
            .post(self.endpoint())
            .form(&[("chat_id", self.chat_id.as_str()), ("text", text)])
            .send()
            .await
            .context("sending telegram message")?
            .error_for_status()
            .context("telegram rejected message")?;
        Ok(())
    }
}

/// Fallback when no chat is configured: alerts only reach the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        warn!(alert = text, "operator alert");
        Ok(())
    }
}

/// Send an alert; delivery problems are logged and never fail the caller.
pub async fn deliver(notifier: &dyn Notifier, text: &str) {
    match notifier.notify(text).await {
        Ok(()) => info!("alert delivered"),
        Err(err) => warn!(error = %format!("{err:#}"), "alert delivery failed"),
    }
}

/// One message covering every integrity finding of a run.
pub fn integrity_alert(run_id: Uuid, warnings: &[IntegrityWarning]) -> Option<String> {
    if warnings.is_empty() {
        return None;
    }
    let mut lines = vec![DATA_LOSS_HEADLINE.to_string(), format!("run {run_id}")];
    lines.extend(warnings.iter().map(|w| format!("- {w}")));
    Some(lines.join("\n"))
}

pub fn failure_alert(failure: &StageFailure) -> String {
    format!(
        "\u{274C} YouGile CDM tasks sync finished with error in stage {}: {:#}",
        failure.stage, failure.error
    )
}
