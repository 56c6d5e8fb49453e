pub mod http;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;

pub use http::HttpInvoker;
pub use registry::{ModelRegistry, ModelTarget};

/// Sampling knobs written into every request body that declares them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingOptions {
    pub temperature: f64,
    pub top_p: f64,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InvokeRequest<'a> {
    pub target: &'a ModelTarget,
    pub prompt: &'a str,
    pub body: &'a str,
    pub sampling: SamplingOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvokeResponse {
    pub text: String,
    pub elapsed_ms: u64,
    pub raw: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("cannot reach {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },
    #[error("server responded {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unreadable response: {0}")]
    Decode(String),
    #[error("request template is not valid JSON: {0}")]
    Template(String),
}

/// One remote model call. Implementations must eventually settle; the engine
/// never cancels an outstanding call.
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn invoke(&self, request: InvokeRequest<'_>) -> Result<InvokeResponse, InvokeError>;
}
