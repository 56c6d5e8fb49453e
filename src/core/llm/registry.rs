use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

const BUILTIN_MODELS_JSON: &str = include_str!("models.json");

pub const DEFAULT_REQUEST_TEMPLATE: &str = r#"{ "prompt": "{prompt}", "input": "{input}" }"#;

/// A configured remote model endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelTarget {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub request_path: String,
    pub api_key: String,
    /// JSON body with `{prompt}` and `{input}` placeholders.
    pub request_template: String,
    pub force_model_name: String,
    pub supports_streaming: bool,
    pub headers: HashMap<String, String>,
    pub disabled: bool,
}

impl ModelTarget {
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, self.request_path)
    }

    pub fn template(&self) -> &str {
        if self.request_template.trim().is_empty() {
            DEFAULT_REQUEST_TEMPLATE
        } else {
            &self.request_template
        }
    }

    pub fn is_openrouter(&self) -> bool {
        self.base_url.contains("openrouter.ai")
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRegistry {
    pub models: Vec<ModelTarget>,
}

impl ModelRegistry {
    pub fn new(models: Vec<ModelTarget>) -> Self {
        Self { models }
    }

    /// Built-in endpoints, without credentials.
    pub fn builtin() -> Self {
        serde_json::from_str(BUILTIN_MODELS_JSON).unwrap_or_else(|e| {
            warn!("Built-in model list is unreadable: {}", e);
            Self::default()
        })
    }

    /// Built-in endpoints overlaid with configured ones. A configured model
    /// replaces a built-in one with the same id.
    pub fn with_overrides(configured: &[ModelTarget]) -> Self {
        let mut registry = Self::builtin();
        for model in configured {
            match registry.models.iter_mut().find(|m| m.id == model.id) {
                Some(existing) => *existing = model.clone(),
                None => registry.models.push(model.clone()),
            }
        }
        registry
    }

    /// Look up by id or display name, case-insensitively.
    pub fn get(&self, id: &str) -> Option<&ModelTarget> {
        let normalized = id.to_lowercase();
        self.models
            .iter()
            .find(|m| m.id.to_lowercase() == normalized || m.name.to_lowercase() == normalized)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ModelTarget> {
        self.models.iter().filter(|m| !m.disabled)
    }
}
