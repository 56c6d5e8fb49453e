use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use console::style;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::info;

use super::RunCommandArgs;
use crate::core::batch::output::{display_columns, export_columns, project};
use crate::core::batch::{BatchRunner, Job, JobPhase, JobSnapshot, Row, SchedulerControl, StartMode};
use crate::core::config::AppConfig;
use crate::core::llm::HttpInvoker;
use crate::core::notify::{FeishuNotifier, Notification, Notifier};
use crate::core::persist::{JobArchive, PersistHandle};
use crate::core::store::{KeyValueStore, MemoryStore, SqliteStore};
use crate::core::terminal::{
    self, GuideSection, print_error, print_info, print_notice, print_status, print_success,
    print_warn,
};

const JOBS_DB: &str = "jobs.db";

/// The on-disk archive, or an in-memory one when the database cannot be
/// opened so the run itself still goes ahead.
fn open_archive(config: &AppConfig) -> JobArchive {
    let path = config.data_dir().join(JOBS_DB);
    let capacity = config.store.capacity_bytes;
    let store: Arc<dyn KeyValueStore> = match SqliteStore::open(&path, capacity) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            print_warn(&format!(
                "Job store at {} is unavailable ({}); progress will not be saved.",
                path.display(),
                e
            ));
            Arc::new(MemoryStore::new(capacity))
        }
    };
    JobArchive::load(store, config.store.max_saved_jobs)
}

/// Rows from a JSON array of objects. Headers are the keys in order of first
/// appearance.
pub(crate) fn parse_rows(content: &str) -> Result<(Vec<String>, Vec<Row>)> {
    let value: Value = serde_json::from_str(content).context("Rows file is not valid JSON")?;
    let Value::Array(items) = value else {
        bail!("Rows file must hold a JSON array of objects");
    };
    let mut headers: Vec<String> = Vec::new();
    let mut rows = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let Value::Object(cells) = item else {
            bail!("Row {} is not a JSON object", index);
        };
        for key in cells.keys() {
            if !headers.contains(key) {
                headers.push(key.clone());
            }
        }
        rows.push(Row::new(index as u64, cells));
    }
    Ok((headers, rows))
}

async fn read_prompt(prompt: &str) -> Result<String> {
    match prompt.strip_prefix('@') {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read prompt file {}", path)),
        None => Ok(prompt.to_string()),
    }
}

pub async fn run_new(config: &AppConfig, args: RunCommandArgs) -> Result<()> {
    let rows_path = args
        .rows
        .ok_or_else(|| anyhow!("--rows <file.json> is required for run"))?;
    let content = tokio::fs::read_to_string(&rows_path)
        .await
        .with_context(|| format!("Failed to read {}", rows_path.display()))?;
    let (headers, rows) = parse_rows(&content)?;
    let prompt = read_prompt(&args.prompt).await?;

    let title = args.title.unwrap_or_else(|| {
        rows_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "batch".to_string())
    });
    let output_column = args
        .output_column
        .unwrap_or_else(|| config.batch.output_column.clone());
    let mut job = Job::new(
        title,
        args.model,
        prompt,
        args.input_column,
        output_column,
        headers,
        rows,
    );
    job.concurrency = args.concurrency.unwrap_or(config.batch.concurrency);
    job.notify_on_complete = args.notify;

    execute(config, open_archive(config), job, StartMode::Fresh).await
}

pub async fn run_saved(config: &AppConfig, job_id: &str, restart: bool) -> Result<()> {
    let archive = open_archive(config);
    let job = archive
        .find(job_id)
        .cloned()
        .ok_or_else(|| anyhow!("No saved job matches '{}'", job_id))?;
    let mode = if restart { StartMode::Fresh } else { StartMode::Resume };
    if mode == StartMode::Resume && job.resume_index() >= job.total() {
        print_info(&format!(
            "Job {} has no rows left to process; use restart to run it again.",
            job.id
        ));
        return Ok(());
    }
    execute(config, archive, job, mode).await
}

/// Keyboard control while a job runs: `p` pause, `r` lift a pending pause,
/// `s` stop, a number sets the concurrency.
fn apply_command(control: &SchedulerControl, line: &str) {
    match line.trim() {
        "" => {}
        "p" | "pause" => {
            control.pause();
            print_warn("Pausing after in-flight rows finish...");
        }
        "r" | "resume" => control.unpause(),
        "s" | "stop" => {
            control.stop();
            print_warn("Stopping after in-flight rows finish...");
        }
        other => match other.parse::<usize>() {
            Ok(n) => {
                let applied = control.set_concurrency(n);
                print_info(&format!("Concurrency set to {}", applied));
            }
            Err(_) => print_warn(&format!("Unknown command '{}' (p, r, s or a number)", other)),
        },
    }
}

/// Read stdin lines on a plain thread so a pending read never holds up
/// runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn follow_progress(mut runs: watch::Receiver<Option<watch::Receiver<JobSnapshot>>>) {
    let mut snapshots = loop {
        if let Some(rx) = runs.borrow_and_update().clone() {
            break rx;
        }
        if runs.changed().await.is_err() {
            return;
        }
    };
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        terminal::print_progress(&snapshot);
        if snapshots.changed().await.is_err() {
            break;
        }
    }
}

async fn execute(config: &AppConfig, archive: JobArchive, job: Job, mode: StartMode) -> Result<()> {
    let (persist, writer) = PersistHandle::spawn(archive, config.batch.persist_debounce());
    let invoker = Arc::new(HttpInvoker::new(config.batch.request_timeout()));
    let mut runner = BatchRunner::new(invoker, config.registry(), config.batch.clone())
        .with_preprocess(config.preprocess.clone())
        .with_persistence(persist);
    if job.notify_on_complete {
        match FeishuNotifier::from_settings(&config.notify) {
            Some(notifier) => runner = runner.with_notifier(Arc::new(notifier)),
            None => print_warn("Notifications requested but [notify] is not configured."),
        }
    }

    GuideSection::new(&job.title)
        .status("Job", &job.id)
        .status("Model", &job.model_target)
        .status("Rows", &job.total().to_string())
        .status("Concurrency", &job.concurrency.to_string())
        .print();
    println!();

    let control = runner.control();
    let mut keys = std::io::stdin().is_terminal().then(spawn_stdin_reader);
    let keyboard = tokio::spawn(async move {
        let Some(keys) = keys.as_mut() else {
            return;
        };
        while let Some(line) = keys.recv().await {
            apply_command(&control, &line);
        }
    });
    let progress = tokio::spawn(follow_progress(runner.progress()));

    let result = runner.run(job, mode).await;
    keyboard.abort();
    drop(runner);
    let _ = progress.await;
    println!();
    let archive = writer.await.context("Persistence writer failed")?;
    let report = result?;

    if let Some(save) = &report.save {
        save.notices.iter().for_each(print_notice);
    }
    if let Some(Err(e)) = &report.notification {
        print_warn(&format!("Completion notification failed: {}", e));
    }

    let status = &report.job.status;
    let summary = format!(
        "Job {} {}: {}/{} rows processed, {} succeeded, {} failed",
        report.job.id,
        report.outcome.phase().as_str(),
        status.processed,
        status.total,
        status.success,
        status.failed
    );
    match report.outcome.phase() {
        JobPhase::Completed if status.failed == 0 => print_success(&summary),
        JobPhase::Faulted => print_error(&summary),
        _ => print_warn(&summary),
    }
    info!("{} saved job(s) in archive", archive.jobs().len());
    Ok(())
}

pub fn list_jobs(config: &AppConfig) {
    let archive = open_archive(config);
    if archive.jobs().is_empty() {
        print_info("No saved jobs.");
        return;
    }
    let mut section = GuideSection::new("Saved jobs");
    for job in archive.jobs() {
        let short_id: String = job.id.chars().take(8).collect();
        let resumable = if job.is_partially_processed() {
            style("  resumable").cyan().to_string()
        } else {
            String::new()
        };
        section = section.status(
            &short_id,
            &format!(
                "{}  {}  {}/{} ({} failed)  {}{}",
                job.title,
                style(job.phase.as_str()).dim(),
                job.status.processed,
                job.status.total,
                job.status.failed,
                job.model_target,
                resumable
            ),
        );
    }
    section.print();
    println!();
}

pub async fn export_job(config: &AppConfig, job_id: &str, out: &Path, all_columns: bool) -> Result<()> {
    let archive = open_archive(config);
    let job = archive
        .find(job_id)
        .ok_or_else(|| anyhow!("No saved job matches '{}'", job_id))?;
    let rows: Vec<_> = job.results.iter().flatten().collect();
    let columns = if all_columns {
        display_columns(&job.headers, &job.output_column_key, rows.iter().copied())
    } else {
        export_columns(&job.headers, &job.output_column_key, rows.iter().copied())
    };

    let mut lines = String::new();
    for row in &rows {
        lines.push_str(&serde_json::to_string(&project(row, &columns))?);
        lines.push('\n');
    }
    tokio::fs::write(out, lines)
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;
    print_success(&format!(
        "Exported {} row(s) with {} column(s) to {}",
        rows.len(),
        columns.len(),
        out.display()
    ));
    Ok(())
}

pub fn list_models(config: &AppConfig) {
    let registry = config.registry();
    for model in registry.enabled() {
        let key = if model.api_key.is_empty() {
            style("no key").yellow().to_string()
        } else {
            style("key set").green().to_string()
        };
        print_status(&model.id, &format!("{}  {}  {}", model.display_name(), model.endpoint(), key));
    }
}

pub async fn notify_test(config: &AppConfig) -> Result<()> {
    let Some(notifier) = FeishuNotifier::from_settings(&config.notify) else {
        print_error("Notifications are disabled or no webhook is configured in [notify].");
        return Ok(());
    };
    notifier.send(&Notification::test_message()).await?;
    print_success("Test notification sent.");
    Ok(())
}
