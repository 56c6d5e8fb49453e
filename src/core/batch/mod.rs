pub mod output;
pub mod processor;
pub mod runner;
pub mod scheduler;
pub mod state;
pub mod text;
pub mod types;

pub use runner::{BatchRunner, RunReport, StartMode};
pub use scheduler::{ControlState, SchedulerControl};
pub use state::JobSnapshot;
pub use types::{DerivedRow, Job, JobPhase, ProcessingStatus, Row, RunOutcome};

use crate::core::llm::{ModelRegistry, ModelTarget};

/// Job configuration rejected before any row is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no model selected")]
    MissingModel,
    #[error("unknown model '{0}'")]
    UnknownModel(String),
    #[error("model '{0}' is disabled")]
    DisabledModel(String),
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("no input column selected")]
    MissingInputColumn,
    #[error("job has no rows")]
    NoRows,
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,
}

/// Check a job before it runs and resolve its model target.
pub fn validate_job<'a>(job: &Job, registry: &'a ModelRegistry) -> Result<&'a ModelTarget, ConfigError> {
    if job.model_target.trim().is_empty() {
        return Err(ConfigError::MissingModel);
    }
    let target = registry
        .get(&job.model_target)
        .ok_or_else(|| ConfigError::UnknownModel(job.model_target.clone()))?;
    if target.disabled {
        return Err(ConfigError::DisabledModel(target.id.clone()));
    }
    if job.prompt_text.trim().is_empty() {
        return Err(ConfigError::EmptyPrompt);
    }
    if job.input_column_key.trim().is_empty() {
        return Err(ConfigError::MissingInputColumn);
    }
    if job.rows.is_empty() {
        return Err(ConfigError::NoRows);
    }
    if job.concurrency == 0 {
        return Err(ConfigError::InvalidConcurrency);
    }
    Ok(target)
}

/// Whether a job may move from phase `from` to phase `to`.
pub fn can_transition(from: JobPhase, to: JobPhase) -> bool {
    if from == to {
        return true;
    }
    match from {
        JobPhase::Idle => matches!(to, JobPhase::Running),
        JobPhase::Running => matches!(
            to,
            JobPhase::Paused | JobPhase::Stopped | JobPhase::Completed | JobPhase::Faulted
        ),
        JobPhase::Paused | JobPhase::Stopped | JobPhase::Faulted => {
            matches!(to, JobPhase::Running | JobPhase::Idle)
        }
        JobPhase::Completed => matches!(to, JobPhase::Idle),
    }
}

#[cfg(test)]
mod tests;
