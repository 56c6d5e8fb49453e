use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::{info, warn};

use super::{Notification, Notifier, NotifyError, Severity};
use crate::core::config::NotifySettings;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TITLE: &str = "批处理通知";

/// Posts interactive cards to a Feishu (Lark) custom-bot webhook.
pub struct FeishuNotifier {
    client: Client,
    webhook: String,
    secret: String,
}

impl FeishuNotifier {
    /// `None` when notifications are off or no webhook is configured.
    pub fn from_settings(settings: &NotifySettings) -> Option<Self> {
        if !settings.enabled || settings.webhook.trim().is_empty() {
            return None;
        }
        Some(Self::new(&settings.webhook, &settings.secret))
    }

    pub fn new(webhook: &str, secret: &str) -> Self {
        Self {
            client: Client::new(),
            webhook: webhook.trim().to_string(),
            secret: secret.to_string(),
        }
    }
}

fn card_template(severity: Severity) -> &'static str {
    match severity {
        Severity::Success => "green",
        Severity::Warning => "yellow",
        Severity::Error => "red",
        Severity::Info => "blue",
    }
}

/// Bot signature: HMAC-SHA256 keyed with `"{timestamp}\n{secret}"` over an
/// empty message, base64-encoded.
pub(crate) fn sign(timestamp: i64, secret: &str) -> Option<String> {
    let key = format!("{}\n{}", timestamp, secret);
    let mac = HmacSha256::new_from_slice(key.as_bytes()).ok()?;
    Some(STANDARD.encode(mac.finalize().into_bytes()))
}

pub(crate) fn build_card(
    notification: &Notification,
    timestamp: i64,
    secret: &str,
    sent_at: &str,
) -> Value {
    let title = if notification.title.is_empty() {
        DEFAULT_TITLE
    } else {
        notification.title.as_str()
    };
    let mut card = json!({
        "timestamp": timestamp.to_string(),
        "msg_type": "interactive",
        "card": {
            "header": {
                "title": { "tag": "plain_text", "content": title },
                "template": card_template(notification.severity),
            },
            "elements": [
                { "tag": "div", "text": { "tag": "lark_md", "content": notification.body } },
                { "tag": "hr" },
                {
                    "tag": "note",
                    "elements": [{ "tag": "plain_text", "content": format!("发送时间: {}", sent_at) }]
                }
            ]
        }
    });
    if !secret.is_empty()
        && let Some(signature) = sign(timestamp, secret)
    {
        card["sign"] = Value::String(signature);
    }
    card
}

/// Feishu reports success as `code == 0` (older endpoints use `StatusCode`).
fn response_code(body: &Value) -> Option<i64> {
    body.get("code")
        .or_else(|| body.get("StatusCode"))
        .and_then(Value::as_i64)
}

#[async_trait]
impl Notifier for FeishuNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.webhook.is_empty() {
            return Err(NotifyError::Disabled);
        }
        let now = chrono::Local::now();
        let card = build_card(
            notification,
            now.timestamp(),
            &self.secret,
            &now.format("%Y-%m-%d %H:%M:%S").to_string(),
        );

        let res = self
            .client
            .post(&self.webhook)
            .json(&card)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        let status = res.status();
        let body: Value = res.json().await.unwrap_or(Value::Null);

        match response_code(&body) {
            Some(0) if status.as_u16() == 200 => {
                info!(
                    "Feishu {} notification delivered: {}",
                    notification.severity.as_str(),
                    notification.title
                );
                Ok(())
            }
            code => {
                let msg = body
                    .get("msg")
                    .or_else(|| body.get("StatusMessage"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("HTTP {}", status));
                warn!("Feishu rejected notification: {}", msg);
                Err(NotifyError::Rejected {
                    code: code.unwrap_or(-1),
                    msg,
                })
            }
        }
    }
}
