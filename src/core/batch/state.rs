use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::core::batch::types::{DerivedRow, Job, JobPhase, ProcessingStatus, RunOutcome};
use crate::core::persist::PersistHandle;

/// Immutable view of a job's progress published to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub job_id: String,
    pub phase: JobPhase,
    pub status: ProcessingStatus,
    pub last_attempted_index: Option<usize>,
    pub concurrency: usize,
}

impl JobSnapshot {
    fn of(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            phase: job.phase,
            status: job.status,
            last_attempted_index: job.last_attempted_index,
            concurrency: job.concurrency,
        }
    }
}

/// Sole owner of a job while it runs. Every mutation of the result buffer and
/// counters goes through here; observers see snapshots only.
pub struct JobState {
    job: Job,
    tx: watch::Sender<JobSnapshot>,
    persist: Option<PersistHandle>,
    persist_every: Duration,
    last_persist: Option<Instant>,
    unsettled: BTreeSet<usize>,
}

impl JobState {
    pub fn new(job: Job, persist: Option<PersistHandle>, persist_every: Duration) -> Self {
        let (tx, _) = watch::channel(JobSnapshot::of(&job));
        Self {
            job,
            tx,
            persist,
            persist_every,
            last_persist: None,
            unsettled: BTreeSet::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.tx.subscribe()
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot::of(&self.job)
    }

    fn publish(&self) {
        self.tx.send_replace(JobSnapshot::of(&self.job));
    }

    fn request_persist(&mut self, force: bool) {
        let Some(persist) = &self.persist else {
            return;
        };
        let now = Instant::now();
        let due = self
            .last_persist
            .is_none_or(|at| now.duration_since(at) >= self.persist_every);
        if force || due {
            persist.save(&self.job);
            self.last_persist = Some(now);
        }
    }

    pub fn begin(&mut self, concurrency: usize) {
        self.job.status.total = self.job.total();
        self.job.status.is_running = true;
        self.job.phase = JobPhase::Running;
        self.job.concurrency = concurrency;
        self.publish();
    }

    pub fn set_concurrency(&mut self, concurrency: usize) {
        if self.job.concurrency != concurrency {
            self.job.concurrency = concurrency;
            self.publish();
        }
    }

    /// Record that row `index` has been handed to a worker.
    pub fn admit(&mut self, index: usize) {
        self.job.last_attempted_index = Some(index);
        self.unsettled.insert(index);
        debug!("Admitted row {} of job {}", index, self.job.id);
        self.publish();
    }

    /// Store an observed outcome. A row seen before has its previous outcome
    /// retracted so the counters never count it twice.
    pub fn complete(&mut self, index: usize, derived: DerivedRow) {
        if index >= self.job.total() {
            error!("Discarding result for out-of-range row {}", index);
            return;
        }
        self.unsettled.remove(&index);
        let succeeded = !derived.failed;
        if let Some(previous) = self.job.store_result(index, derived) {
            self.job.status.retract(!previous.failed);
        }
        self.job.status.record(succeeded);
        self.publish();
        self.request_persist(false);
    }

    /// Leave the running state for good; `is_running` is false afterwards.
    /// A faulted run moves the cursor back before the first admitted row that
    /// never produced a result, so resuming picks it up again.
    pub fn finish(&mut self, outcome: &RunOutcome) {
        if let (RunOutcome::Faulted(_), Some(&first)) = (outcome, self.unsettled.first()) {
            warn!(
                "Job {} faulted with {} row(s) unsettled; resuming from row {}",
                self.job.id,
                self.unsettled.len(),
                first
            );
            self.job.last_attempted_index = first.checked_sub(1);
        }
        self.unsettled.clear();
        self.job.status.is_running = false;
        self.job.phase = outcome.phase();
        self.publish();
        self.request_persist(true);
    }

    pub fn into_job(self) -> Job {
        self.job
    }
}
