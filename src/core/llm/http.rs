//! `RemoteInvoker` over HTTP for OpenAI-compatible and template-driven APIs.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::{InvokeError, InvokeRequest, InvokeResponse, ModelTarget, RemoteInvoker, SamplingOptions};

const OPENROUTER_REFERER: &str = "https://github.com/promptbatch/promptbatch";
const OPENROUTER_TITLE: &str = "promptbatch";

pub struct HttpInvoker {
    client: Client,
}

impl HttpInvoker {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self { client }
    }
}

/// Escape a value for insertion between the quotes of a JSON string literal.
/// Control characters other than newline, carriage return and tab are dropped.
fn escape_json_fragment(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| matches!(c, '\n' | '\r' | '\t') || !c.is_control())
        .collect();
    let quoted = Value::String(cleaned).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

pub(crate) fn render_template(template: &str, prompt: &str, input: &str) -> String {
    template
        .replace("{prompt}", &escape_json_fragment(prompt))
        .replace("{input}", &escape_json_fragment(input))
}

/// Parse a rendered body, retrying once with a BOM removed and typographic
/// quotes straightened.
pub(crate) fn parse_body(rendered: &str) -> Result<Value, InvokeError> {
    match serde_json::from_str(rendered) {
        Ok(value) => Ok(value),
        Err(first) => {
            let repaired = rendered
                .trim_start_matches('\u{feff}')
                .replace(['\u{201c}', '\u{201d}'], "\"");
            serde_json::from_str(&repaired)
                .map_err(|second| InvokeError::Template(format!("{}; after repair: {}", first, second)))
        }
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Overwrite sampling keys the body already declares, plus a nested
/// `parameters` object when present.
pub(crate) fn apply_sampling(body: &mut Value, sampling: SamplingOptions) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    if obj.contains_key("temperature") {
        obj.insert("temperature".into(), json!(sampling.temperature));
    }
    if obj.contains_key("top_p") {
        obj.insert("top_p".into(), json!(sampling.top_p));
    }
    if let Some(Value::Object(params)) = obj.get_mut("parameters") {
        params.insert("temperature".into(), json!(sampling.temperature));
        params.insert("top_p".into(), json!(sampling.top_p));
    }
}

pub(crate) fn apply_model_override(body: &mut Value, force_model_name: &str) {
    if force_model_name.is_empty() {
        return;
    }
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    if is_truthy(obj.get("model")) {
        obj.insert("model".into(), Value::String(force_model_name.to_string()));
    }
    if let Some(Value::Object(params)) = obj.get_mut("parameters")
        && is_truthy(params.get("model"))
    {
        params.insert("model".into(), Value::String(force_model_name.to_string()));
    }
}

pub(crate) fn apply_streaming(body: &mut Value, target: &ModelTarget) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    obj.insert("stream".into(), Value::Bool(true));
    let forced = target.force_model_name.as_str();
    if target.is_openrouter() {
        let options = obj
            .entry("stream_options")
            .or_insert_with(|| Value::Object(Map::new()));
        if (forced.contains("qwen") || forced.contains("qwq"))
            && let Some(options) = options.as_object_mut()
        {
            options.insert("include_usage".into(), Value::Bool(true));
        }
    } else if forced.contains("qwq") {
        obj.insert("stream_options".into(), json!({ "include_usage": true }));
    }
}

/// Header values must be ASCII; anything else is sent base64-encoded.
pub(crate) fn header_text(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("Base64:{}", STANDARD.encode(value.as_bytes()))
    }
}

fn build_headers(target: &ModelTarget) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (key, value) in &target.headers {
        let name = HeaderName::from_bytes(key.as_bytes());
        let value = HeaderValue::from_str(&header_text(value));
        match (name, value) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("Skipping invalid header {:?} for model {}", key, target.id),
        }
    }
    if !target.api_key.is_empty() {
        match HeaderValue::from_str(&format!("Bearer {}", target.api_key)) {
            Ok(value) => {
                headers.insert(AUTHORIZATION, value);
            }
            Err(_) => warn!("API key for model {} is not a valid header value", target.id),
        }
        if target.is_openrouter() {
            headers.insert("http-referer", HeaderValue::from_static(OPENROUTER_REFERER));
            headers.insert("x-title", HeaderValue::from_static(OPENROUTER_TITLE));
        }
    }
    headers
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct StreamDelta {
    pub content: Option<String>,
    pub reasoning: Option<String>,
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Decode one server-sent-event line. `[DONE]`, comments and non-JSON lines
/// yield `None`.
pub(crate) fn parse_sse_line(line: &str) -> Option<StreamDelta> {
    let payload = line.trim().strip_prefix("data:").unwrap_or(line).trim();
    if payload.is_empty() || payload == "[DONE]" || !payload.starts_with('{') {
        return None;
    }
    let data: Value = serde_json::from_str(payload)
        .or_else(|_| serde_json::from_str(&format!("{}}}", payload)))
        .ok()?;
    let choice = data.pointer("/choices/0")?;

    let content = str_at(choice, "/content")
        .or_else(|| str_at(choice, "/delta/message/content"))
        .or_else(|| str_at(choice, "/delta/text"))
        .or_else(|| str_at(choice, "/delta/content"))
        .map(str::to_string);
    let reasoning = str_at(choice, "/delta/reasoning_content").map(str::to_string);

    if content.is_none() && reasoning.is_none() {
        return None;
    }
    Some(StreamDelta { content, reasoning })
}

/// Concatenate a buffered event stream into `(content, reasoning)`.
pub(crate) fn collect_stream(body: &str) -> (String, String) {
    let mut content = String::new();
    let mut reasoning = String::new();
    for delta in body.lines().filter_map(parse_sse_line) {
        if let Some(c) = delta.content {
            content.push_str(&c);
        }
        if let Some(r) = delta.reasoning {
            reasoning.push_str(&r);
        }
    }
    (content, reasoning)
}

/// Response text from a non-streaming JSON body.
pub(crate) fn extract_content(body: &Value) -> String {
    if let Value::String(s) = body {
        return s.clone();
    }
    ["/choices/0/message/content", "/response", "/output", "/text"]
        .iter()
        .find_map(|p| str_at(body, p))
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}

/// Build the final request body for one call.
pub(crate) fn build_body(request: &InvokeRequest<'_>) -> Result<Value, InvokeError> {
    let target = request.target;
    let rendered = render_template(target.template(), request.prompt, request.body);
    let mut body = parse_body(&rendered)?;
    apply_sampling(&mut body, request.sampling);
    apply_model_override(&mut body, &target.force_model_name);
    if target.supports_streaming {
        apply_streaming(&mut body, target);
    }
    Ok(body)
}

#[async_trait]
impl RemoteInvoker for HttpInvoker {
    async fn invoke(&self, request: InvokeRequest<'_>) -> Result<InvokeResponse, InvokeError> {
        let started = Instant::now();
        let target = request.target;
        let endpoint = target.endpoint();
        let body = build_body(&request)?;
        debug!("POST {} ({})", endpoint, target.display_name());

        let res = self
            .client
            .post(&endpoint)
            .headers(build_headers(target))
            .json(&body)
            .send()
            .await
            .map_err(|e| InvokeError::Transport {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| InvokeError::Decode(e.to_string()))?;
        if !status.is_success() {
            return Err(InvokeError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let (content, raw) = if target.supports_streaming {
            let (content, reasoning) = collect_stream(&text);
            let mut raw = json!({ "streaming": true });
            if !reasoning.is_empty() {
                raw["reasoningContent"] = Value::String(reasoning);
            }
            (content, raw)
        } else {
            match serde_json::from_str::<Value>(&text) {
                Ok(parsed) => {
                    let content = extract_content(&parsed);
                    let actual = parsed
                        .get("model")
                        .and_then(Value::as_str)
                        .unwrap_or(&target.force_model_name)
                        .to_string();
                    let mut raw = parsed;
                    if let Some(obj) = raw.as_object_mut() {
                        obj.insert("actualModelName".into(), Value::String(actual));
                        obj.insert(
                            "requestedModelName".into(),
                            Value::String(target.display_name().to_string()),
                        );
                    }
                    (content, raw)
                }
                Err(_) => (text.clone(), Value::String(text)),
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "{} responded in {}ms ({} chars)",
            target.display_name(),
            elapsed_ms,
            content.chars().count()
        );
        Ok(InvokeResponse {
            text: content,
            elapsed_ms,
            raw,
        })
    }
}
