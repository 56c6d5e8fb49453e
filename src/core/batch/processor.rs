use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::batch::output::normalize;
use crate::core::batch::text::TextPipeline;
use crate::core::batch::types::{DerivedRow, Job, Row};
use crate::core::llm::{InvokeRequest, ModelTarget, RemoteInvoker, SamplingOptions};

const LOG_PREVIEW_CHARS: usize = 100;

fn preview(text: &str) -> String {
    if text.chars().count() <= LOG_PREVIEW_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(LOG_PREVIEW_CHARS).collect();
    format!("{}...", head)
}

/// Turns one input row into one derived row. Every failure is captured in the
/// returned row; `process` itself cannot fail.
pub struct RowProcessor {
    invoker: Arc<dyn RemoteInvoker>,
    target: ModelTarget,
    prompt: String,
    input_column: String,
    output_column: String,
    pipeline: Option<TextPipeline>,
    sampling: SamplingOptions,
}

impl RowProcessor {
    pub fn new(
        invoker: Arc<dyn RemoteInvoker>,
        target: ModelTarget,
        job: &Job,
        pipeline: Option<TextPipeline>,
    ) -> Self {
        Self {
            invoker,
            target,
            prompt: job.prompt_text.clone(),
            input_column: job.input_column_key.clone(),
            output_column: job.output_column_key.clone(),
            pipeline: pipeline.filter(|p| !p.is_empty()),
            sampling: SamplingOptions::default(),
        }
    }

    pub fn output_column(&self) -> &str {
        &self.output_column
    }

    pub async fn process(&self, row: &Row) -> DerivedRow {
        let raw = row.text(&self.input_column);
        let body = match &self.pipeline {
            Some(pipeline) => pipeline.apply(&raw),
            None => raw,
        };
        debug!("Row {} -> {}: {}", row.row_id, self.target.display_name(), preview(&body));

        let request = InvokeRequest {
            target: &self.target,
            prompt: &self.prompt,
            body: &body,
            sampling: self.sampling,
        };
        match self.invoker.invoke(request).await {
            Ok(response) => {
                let normalized = normalize(&response.text, &self.output_column);
                let mut columns = row.cells.clone();
                columns.extend(normalized.columns);
                DerivedRow {
                    row_id: row.row_id,
                    columns,
                    structured: normalized.structured,
                    failed: false,
                }
            }
            Err(e) => {
                warn!("Row {} failed: {}", row.row_id, e);
                DerivedRow::failure(row, &self.output_column, &e.to_string())
            }
        }
    }
}
