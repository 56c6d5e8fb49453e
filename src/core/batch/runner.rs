use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::core::batch::processor::RowProcessor;
use crate::core::batch::scheduler::{Scheduler, SchedulerControl};
use crate::core::batch::state::{JobSnapshot, JobState};
use crate::core::batch::text::TextPipeline;
use crate::core::batch::types::{Job, JobPhase, RunOutcome};
use crate::core::batch::{ConfigError, can_transition, validate_job};
use crate::core::config::{BatchSettings, PreprocessConfig};
use crate::core::llm::{ModelRegistry, RemoteInvoker};
use crate::core::notify::{Notifier, NotifyError, completion_notification};
use crate::core::persist::{PersistHandle, SaveReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Discard previous outcomes and start at row 0.
    Fresh,
    /// Continue after the last attempted row.
    Resume,
}

#[derive(Debug)]
pub struct RunReport {
    pub job: Job,
    pub outcome: RunOutcome,
    pub save: Option<SaveReport>,
    pub notification: Option<Result<(), NotifyError>>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "scheduler panicked".to_string()
    }
}

/// Outer boundary of a run: validation, scheduling, fault containment,
/// final persistence and the completion notification.
pub struct BatchRunner {
    invoker: Arc<dyn RemoteInvoker>,
    registry: ModelRegistry,
    settings: BatchSettings,
    preprocess: PreprocessConfig,
    notifier: Option<Arc<dyn Notifier>>,
    persist: Option<PersistHandle>,
    control: SchedulerControl,
    progress: watch::Sender<Option<watch::Receiver<JobSnapshot>>>,
    #[cfg(test)]
    fault_at: Option<usize>,
}

impl BatchRunner {
    pub fn new(invoker: Arc<dyn RemoteInvoker>, registry: ModelRegistry, settings: BatchSettings) -> Self {
        let control = SchedulerControl::new(settings.concurrency, settings.max_concurrency);
        Self {
            invoker,
            registry,
            settings,
            preprocess: PreprocessConfig::default(),
            notifier: None,
            persist: None,
            control,
            progress: watch::channel(None).0,
            #[cfg(test)]
            fault_at: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_scheduler_fault_at(mut self, index: usize) -> Self {
        self.fault_at = Some(index);
        self
    }

    pub fn with_preprocess(mut self, preprocess: PreprocessConfig) -> Self {
        self.preprocess = preprocess;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_persistence(mut self, persist: PersistHandle) -> Self {
        self.persist = Some(persist);
        self
    }

    pub fn control(&self) -> SchedulerControl {
        self.control.clone()
    }

    /// Receives the snapshot channel of each run as it starts.
    pub fn progress(&self) -> watch::Receiver<Option<watch::Receiver<JobSnapshot>>> {
        self.progress.subscribe()
    }

    pub async fn run(&self, mut job: Job, mode: StartMode) -> Result<RunReport, ConfigError> {
        let target = validate_job(&job, &self.registry)?.clone();
        if mode == StartMode::Resume && !can_transition(job.phase, JobPhase::Running) {
            info!("Job {} is already {}; nothing to resume", job.id, job.phase.as_str());
            return Ok(RunReport {
                job,
                outcome: RunOutcome::Completed,
                save: None,
                notification: None,
            });
        }

        let start = match mode {
            StartMode::Fresh => {
                job.reset_progress();
                0
            }
            StartMode::Resume => job.resume_index(),
        };
        let concurrency = self.control.begin_run(job.concurrency);
        job.concurrency = concurrency;

        let pipeline = TextPipeline::from_config(&self.preprocess);
        let model_name = target.display_name().to_string();
        let processor = Arc::new(RowProcessor::new(self.invoker.clone(), target, &job, pipeline));
        let scheduler = Scheduler::new(processor, self.control.clone(), self.settings.dispatch_interval());
        #[cfg(test)]
        let scheduler = scheduler.with_fault_at(self.fault_at);

        let mut state = JobState::new(job, self.persist.clone(), self.settings.persist_debounce());
        self.progress.send_replace(Some(state.subscribe()));
        let job_id = state.job().id.clone();
        info!("Starting job {} ({:?}) at row {}", job_id, mode, start);

        let outcome = AssertUnwindSafe(scheduler.run(&mut state, start))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                let message = panic_message(payload);
                error!("Job {} aborted by internal error: {}", job_id, message);
                RunOutcome::Faulted(message)
            });
        state.finish(&outcome);
        let job = state.into_job();

        let save = match &self.persist {
            Some(persist) => persist.flush().await,
            None => None,
        };
        if let Some(report) = &save
            && report.degraded()
        {
            warn!("Job {} saved at reduced fidelity ({:?})", job.id, report.step);
        }

        let notification = match (&outcome, &self.notifier) {
            (RunOutcome::Completed, Some(notifier)) if job.notify_on_complete => {
                let finished_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
                let message = completion_notification(&job.title, &model_name, &job.status, &finished_at);
                let sent = notifier.send(&message).await;
                if let Err(e) = &sent {
                    warn!("Completion notification for job {} failed: {}", job.id, e);
                }
                Some(sent)
            }
            _ => None,
        };

        info!(
            "Job {} {}: {}/{} processed, {} failed",
            job.id,
            outcome.phase().as_str(),
            job.status.processed,
            job.status.total,
            job.status.failed
        );
        Ok(RunReport {
            job,
            outcome,
            save,
            notification,
        })
    }
}
