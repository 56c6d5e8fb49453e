use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix written into the primary output column when a row's remote call fails.
pub const FAILURE_MARKER: &str = "处理失败:";

/// Column map of a row. Insertion order is the spreadsheet column order.
pub type Cells = Map<String, Value>;

/// Render a cell the way it is shown in a spreadsheet: strings verbatim, empty
/// for null, JSON text for everything else.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub row_id: u64,
    pub cells: Cells,
}

impl Row {
    pub fn new(row_id: u64, cells: Cells) -> Self {
        Self { row_id, cells }
    }

    pub fn text(&self, column: &str) -> String {
        self.cells.get(column).map(cell_text).unwrap_or_default()
    }
}

/// A row after processing: the original columns plus the output columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedRow {
    pub row_id: u64,
    pub columns: Cells,
    #[serde(default)]
    pub structured: bool,
    #[serde(default)]
    pub failed: bool,
}

impl DerivedRow {
    pub fn failure(row: &Row, output_column: &str, message: &str) -> Self {
        let mut columns = row.cells.clone();
        columns.insert(
            output_column.to_string(),
            Value::String(format!("{} {}", FAILURE_MARKER, message)),
        );
        Self {
            row_id: row.row_id,
            columns,
            structured: false,
            failed: true,
        }
    }

    pub fn output<'a>(&'a self, output_column: &str) -> Option<&'a str> {
        self.columns.get(output_column).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStatus {
    pub total: usize,
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    pub is_running: bool,
}

impl ProcessingStatus {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Fold one observed row outcome into the counters.
    pub fn record(&mut self, succeeded: bool) {
        if succeeded {
            self.success += 1;
        } else {
            self.failed += 1;
        }
        self.processed = self.success + self.failed;
    }

    /// Undo a previously recorded outcome (used when a row is reprocessed).
    pub fn retract(&mut self, succeeded: bool) {
        if succeeded {
            self.success = self.success.saturating_sub(1);
        } else {
            self.failed = self.failed.saturating_sub(1);
        }
        self.processed = self.success + self.failed;
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.processed as f64 * 100.0 / self.total as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
    Faulted,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Idle => "idle",
            JobPhase::Running => "running",
            JobPhase::Paused => "paused",
            JobPhase::Stopped => "stopped",
            JobPhase::Completed => "completed",
            JobPhase::Faulted => "faulted",
        }
    }
}

/// How a single invocation of the scheduler ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Paused,
    Stopped,
    Faulted(String),
}

impl RunOutcome {
    pub fn phase(&self) -> JobPhase {
        match self {
            RunOutcome::Completed => JobPhase::Completed,
            RunOutcome::Paused => JobPhase::Paused,
            RunOutcome::Stopped => JobPhase::Stopped,
            RunOutcome::Faulted(_) => JobPhase::Faulted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub model_target: String,
    pub prompt_text: String,
    pub input_column_key: String,
    pub output_column_key: String,
    #[serde(default)]
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
    /// Index-aligned with `rows`; `None` marks a row without an observed outcome.
    #[serde(default)]
    pub results: Vec<Option<DerivedRow>>,
    pub status: ProcessingStatus,
    #[serde(default)]
    pub phase: JobPhase,
    #[serde(default)]
    pub last_attempted_index: Option<usize>,
    pub concurrency: usize,
    #[serde(default)]
    pub notify_on_complete: bool,
}

impl Job {
    pub fn new(
        title: impl Into<String>,
        model_target: impl Into<String>,
        prompt_text: impl Into<String>,
        input_column_key: impl Into<String>,
        output_column_key: impl Into<String>,
        headers: Vec<String>,
        rows: Vec<Row>,
    ) -> Self {
        let total = rows.len();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
            model_target: model_target.into(),
            prompt_text: prompt_text.into(),
            input_column_key: input_column_key.into(),
            output_column_key: output_column_key.into(),
            headers,
            rows,
            results: Vec::new(),
            status: ProcessingStatus::new(total),
            phase: JobPhase::Idle,
            last_attempted_index: None,
            concurrency: 5,
            notify_on_complete: false,
        }
    }

    pub fn total(&self) -> usize {
        self.rows.len()
    }

    pub fn result(&self, index: usize) -> Option<&DerivedRow> {
        self.results.get(index).and_then(Option::as_ref)
    }

    /// Index the next `resume` starts from.
    pub fn resume_index(&self) -> usize {
        self.last_attempted_index
            .map(|i| i + 1)
            .unwrap_or(0)
            .min(self.total())
    }

    /// Drop all outcomes so the job can be processed again from row 0.
    pub fn reset_progress(&mut self) {
        self.results.clear();
        self.status = ProcessingStatus::new(self.total());
        self.last_attempted_index = None;
        self.phase = JobPhase::Idle;
    }

    /// Write an outcome at `index`, returning the outcome it replaced.
    pub(crate) fn store_result(&mut self, index: usize, derived: DerivedRow) -> Option<DerivedRow> {
        if index >= self.rows.len() {
            return None;
        }
        if self.results.len() <= index {
            self.results.resize(index + 1, None);
        }
        self.results[index].replace(derived)
    }

    /// Repair a job read back from storage: a saved job can never be running,
    /// and jobs saved without a cursor resume after their last stored result.
    pub fn settle_after_load(&mut self) {
        self.status.is_running = false;
        if self.phase == JobPhase::Running {
            self.phase = JobPhase::Paused;
        }
        self.status.total = self.rows.len();
        if self.results.len() > self.rows.len() {
            self.results.truncate(self.rows.len());
        }
        if self.last_attempted_index.is_none() && !self.results.is_empty() {
            self.last_attempted_index = Some(self.results.len() - 1);
        }
    }

    pub fn is_partially_processed(&self) -> bool {
        self.status.processed > 0 && self.status.processed < self.status.total
    }
}
