pub mod feishu;

use async_trait::async_trait;

use crate::core::batch::types::ProcessingStatus;

pub use feishu::FeishuNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Warning,
    Error,
    Info,
}

impl Severity {
    /// Half or more of the rows failing is an error; any failure is a warning.
    pub fn from_counts(total: usize, failed: usize) -> Self {
        if failed == 0 {
            Severity::Success
        } else if failed * 2 >= total {
            Severity::Error
        } else {
            Severity::Warning
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub severity: Severity,
}

impl Notification {
    pub fn test_message() -> Self {
        Self {
            title: "测试消息".to_string(),
            body: "这是一条测试消息，如果您收到了这条消息，说明通知配置成功了。".to_string(),
            severity: Severity::Info,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notifications are not configured")]
    Disabled,
    #[error("webhook request failed: {0}")]
    Transport(String),
    #[error("webhook rejected the message (code {code}): {msg}")]
    Rejected { code: i64, msg: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Summary sent when a job's last row settles.
pub fn completion_notification(
    job_title: &str,
    model_name: &str,
    status: &ProcessingStatus,
    finished_at: &str,
) -> Notification {
    let body = [
        "**批处理任务完成**".to_string(),
        format!("- 任务名称: {}", job_title),
        format!("- 使用模型: {}", model_name),
        format!("- 处理总数: {}", status.total),
        format!("- 成功数量: {}", status.success),
        format!("- 失败数量: {}", status.failed),
        format!("- 完成时间: {}", finished_at),
    ]
    .join("\n");
    Notification {
        title: format!("批处理任务完成: {}", job_title),
        body,
        severity: Severity::from_counts(status.total, status.failed),
    }
}
