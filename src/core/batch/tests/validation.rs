use serde_json::json;

use crate::core::batch::{ConfigError, Job, Row, validate_job};
use crate::core::llm::{ModelRegistry, ModelTarget};

fn registry() -> ModelRegistry {
    ModelRegistry::new(vec![
        ModelTarget {
            id: "qwen-plus".into(),
            name: "Qwen Plus".into(),
            ..Default::default()
        },
        ModelTarget {
            id: "retired".into(),
            disabled: true,
            ..Default::default()
        },
    ])
}

fn job(model: &str) -> Job {
    let cells = json!({ "text": "hi" }).as_object().cloned().unwrap();
    Job::new("t", model, "summarize", "text", "模型输出", vec![], vec![Row::new(0, cells)])
}

#[test]
fn valid_job_resolves_its_model() {
    let registry = registry();
    let target = validate_job(&job("qwen-plus"), &registry).unwrap();
    assert_eq!(target.display_name(), "Qwen Plus");
}

#[test]
fn model_lookup_accepts_display_name() {
    let registry = registry();
    let target = validate_job(&job("qwen plus"), &registry).unwrap();
    assert_eq!(target.id, "qwen-plus");
}

#[test]
fn missing_and_unknown_models_are_rejected() {
    let registry = registry();
    assert_eq!(validate_job(&job("  "), &registry), Err(ConfigError::MissingModel));
    assert_eq!(
        validate_job(&job("nope"), &registry),
        Err(ConfigError::UnknownModel("nope".into()))
    );
    assert_eq!(
        validate_job(&job("retired"), &registry),
        Err(ConfigError::DisabledModel("retired".into()))
    );
}

#[test]
fn blank_prompt_is_rejected() {
    let mut job = job("qwen-plus");
    job.prompt_text = " \n".into();
    assert_eq!(validate_job(&job, &registry()), Err(ConfigError::EmptyPrompt));
}

#[test]
fn input_column_and_rows_are_required() {
    let registry = registry();
    let mut no_column = job("qwen-plus");
    no_column.input_column_key.clear();
    assert_eq!(validate_job(&no_column, &registry), Err(ConfigError::MissingInputColumn));

    let mut no_rows = job("qwen-plus");
    no_rows.rows.clear();
    assert_eq!(validate_job(&no_rows, &registry), Err(ConfigError::NoRows));
}

#[test]
fn zero_concurrency_is_rejected() {
    let mut job = job("qwen-plus");
    job.concurrency = 0;
    assert_eq!(validate_job(&job, &registry()), Err(ConfigError::InvalidConcurrency));
}
