//! Saved-job archive and the degradation cascade used when the store is full.

pub mod writer;

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::core::batch::types::{Cells, Job};
use crate::core::store::{KeyValueStore, StoreError};

pub use writer::PersistHandle;

pub const JOBS_KEY: &str = "batch-jobs";

/// Columns kept per saved row besides the input column.
const EXTRA_COLUMNS: usize = 3;
const RECENT_JOBS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Info(String),
    Warning(String),
    Error(String),
}

impl Notice {
    fn log(&self) {
        match self {
            Notice::Info(msg) => info!("{}", msg),
            Notice::Warning(msg) => warn!("{}", msg),
            Notice::Error(msg) => error!("{}", msg),
        }
    }
}

/// One rung of the degradation ladder, from least to most destructive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStep {
    Full,
    RecentFive,
    CurrentOnly,
    Cleared,
}

const CASCADE: [SaveStep; 3] = [SaveStep::Full, SaveStep::RecentFive, SaveStep::CurrentOnly];

/// The first `limit` jobs in archive order, always counting `current` among
/// them wherever it sits.
fn keep_with_current(jobs: &[Job], current: &Job, limit: usize) -> Vec<Job> {
    let mut others = limit.saturating_sub(1);
    jobs.iter()
        .filter(|job| {
            if job.id == current.id {
                return true;
            }
            if others == 0 {
                return false;
            }
            others -= 1;
            true
        })
        .cloned()
        .collect()
}

impl SaveStep {
    fn shrink(self, jobs: &[Job], current: &Job, max_jobs: usize) -> Vec<Job> {
        match self {
            SaveStep::Full => keep_with_current(jobs, current, max_jobs),
            SaveStep::RecentFive => keep_with_current(jobs, current, RECENT_JOBS),
            SaveStep::CurrentOnly => vec![current.clone()],
            SaveStep::Cleared => Vec::new(),
        }
    }

    fn notice(self) -> Option<Notice> {
        match self {
            SaveStep::Full => None,
            SaveStep::RecentFive => Some(Notice::Warning(format!(
                "Storage is nearly full; only the current job and the {} most recent others were kept",
                RECENT_JOBS - 1
            ))),
            SaveStep::CurrentOnly => Some(Notice::Warning(
                "Storage is full; all older jobs were removed and only the current job was saved"
                    .to_string(),
            )),
            SaveStep::Cleared => Some(Notice::Error(
                "Storage is exhausted; all saved jobs were cleared".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub step: SaveStep,
    pub saved: usize,
    pub notices: Vec<Notice>,
}

impl SaveReport {
    pub fn degraded(&self) -> bool {
        self.step != SaveStep::Full
    }
}

fn trim_cells(cells: &Cells, input_column: &str) -> Cells {
    let mut kept = Cells::new();
    if let Some(value) = cells.get(input_column) {
        kept.insert(input_column.to_string(), value.clone());
    }
    for (key, value) in cells
        .iter()
        .filter(|(key, _)| key.as_str() != input_column && key.as_str() != "_rowId")
        .take(EXTRA_COLUMNS)
    {
        kept.insert(key.clone(), value.clone());
    }
    kept
}

/// Copy of `job` whose input rows keep only their id, the input column and at
/// most three other columns.
pub fn trim_for_storage(job: &Job) -> Job {
    let mut trimmed = job.clone();
    for row in &mut trimmed.rows {
        row.cells = trim_cells(&row.cells, &job.input_column_key);
    }
    trimmed
}

/// Replace the job with the same id in place, or put a new job first.
fn upsert(jobs: &[Job], job: Job) -> Vec<Job> {
    let mut updated = jobs.to_vec();
    match updated.iter().position(|j| j.id == job.id) {
        Some(index) => updated[index] = job,
        None => updated.insert(0, job),
    }
    updated
}

fn write(store: &dyn KeyValueStore, jobs: &[Job]) -> Result<(), StoreError> {
    let payload =
        serde_json::to_string(jobs).map_err(|e| StoreError::Backend(e.to_string()))?;
    store.put(JOBS_KEY, &payload)
}

/// Saved jobs, most recent first, mirrored into a capacity-limited store.
pub struct JobArchive {
    store: Arc<dyn KeyValueStore>,
    max_jobs: usize,
    jobs: Vec<Job>,
}

impl JobArchive {
    /// Read saved jobs back. An unreadable payload is logged and ignored.
    pub fn load(store: Arc<dyn KeyValueStore>, max_jobs: usize) -> Self {
        let jobs = match store.get(JOBS_KEY) {
            Ok(Some(payload)) => match serde_json::from_str::<Vec<Job>>(&payload) {
                Ok(mut jobs) => {
                    jobs.iter_mut().for_each(Job::settle_after_load);
                    jobs
                }
                Err(e) => {
                    warn!("Saved jobs are unreadable, starting empty: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read saved jobs: {}", e);
                Vec::new()
            }
        };
        Self {
            store,
            max_jobs: max_jobs.max(1),
            jobs,
        }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Exact id, or a unique id prefix.
    pub fn find(&self, id: &str) -> Option<&Job> {
        if let Some(job) = self.jobs.iter().find(|j| j.id == id) {
            return Some(job);
        }
        let mut matches = self.jobs.iter().filter(|j| !id.is_empty() && j.id.starts_with(id));
        match (matches.next(), matches.next()) {
            (Some(job), None) => Some(job),
            _ => None,
        }
    }

    /// Save `job`, degrading step by step while the store rejects the write.
    /// Never fails; every degradation is reported.
    pub fn save(&mut self, job: &Job) -> SaveReport {
        let current = trim_for_storage(job);
        let candidates = upsert(&self.jobs, current.clone());
        let mut notices = Vec::new();

        for step in CASCADE {
            let attempt = step.shrink(&candidates, &current, self.max_jobs);
            match write(self.store.as_ref(), &attempt) {
                Ok(()) => {
                    if step == SaveStep::Full && candidates.len() > self.max_jobs {
                        notices.push(Notice::Info(format!(
                            "Only the {} most recent jobs are kept",
                            self.max_jobs
                        )));
                    }
                    notices.extend(step.notice());
                    notices.iter().for_each(Notice::log);
                    let saved = attempt.len();
                    self.jobs = attempt;
                    return SaveReport {
                        step,
                        saved,
                        notices,
                    };
                }
                Err(StoreError::CapacityExceeded { needed, capacity }) => {
                    warn!(
                        "Saving {} job(s) needs {} bytes but the store holds {}",
                        attempt.len(),
                        needed,
                        capacity
                    );
                }
                Err(e @ StoreError::Backend(_)) => {
                    let notice = Notice::Error(format!("Failed to save jobs: {}", e));
                    notice.log();
                    return SaveReport {
                        step,
                        saved: 0,
                        notices: vec![notice],
                    };
                }
            }
        }

        if let Err(e) = self.store.remove(JOBS_KEY) {
            error!("Failed to clear saved jobs: {}", e);
        }
        self.jobs.clear();
        let notice = SaveStep::Cleared.notice();
        notices.extend(notice);
        notices.iter().for_each(Notice::log);
        SaveReport {
            step: SaveStep::Cleared,
            saved: 0,
            notices,
        }
    }
}
