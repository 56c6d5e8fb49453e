use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::core::batch::types::FAILURE_MARKER;
use crate::core::batch::{
    BatchRunner, ConfigError, Job, JobPhase, ProcessingStatus, Row, RunOutcome, SchedulerControl,
    StartMode,
};
use crate::core::config::BatchSettings;
use crate::core::llm::{InvokeError, InvokeRequest, InvokeResponse, ModelRegistry, ModelTarget, RemoteInvoker};
use crate::core::notify::{Notification, Notifier, NotifyError, Severity};
use crate::core::persist::{JobArchive, PersistHandle, SaveStep};
use crate::core::store::MemoryStore;

const OUT: &str = "模型输出";

#[derive(Debug, Clone, Copy)]
enum Halt {
    Pause,
    Stop,
}

/// Echoes the row body. Bodies containing "bad" fail, "panic" panics. A
/// configured body can also drive the scheduler control from inside the call.
#[derive(Default)]
struct FakeInvoker {
    calls: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
    control: OnceLock<SchedulerControl>,
    halt_at: Option<(String, Halt)>,
    resize_at: Option<(String, usize)>,
}

impl FakeInvoker {
    fn calls(&self, body: &str) -> usize {
        self.calls.lock().unwrap().get(body).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl RemoteInvoker for FakeInvoker {
    async fn invoke(&self, request: InvokeRequest<'_>) -> Result<InvokeResponse, InvokeError> {
        let body = request.body.to_string();
        *self.calls.lock().unwrap().entry(body.clone()).or_default() += 1;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let (Some((at, n)), Some(control)) = (&self.resize_at, self.control.get())
            && *at == body
        {
            control.set_concurrency(*n);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let (Some((at, halt)), Some(control)) = (&self.halt_at, self.control.get())
            && *at == body
        {
            match halt {
                Halt::Pause => control.pause(),
                Halt::Stop => control.stop(),
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if body.contains("panic") {
            panic!("worker blew up on {}", body);
        }
        if body.contains("bad") {
            return Err(InvokeError::Status {
                status: 500,
                body: "bad row".into(),
            });
        }
        Ok(InvokeResponse {
            text: format!("echo {}", body),
            elapsed_ms: 1,
            raw: Value::Null,
        })
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        if self.fail {
            return Err(NotifyError::Rejected {
                code: 19021,
                msg: "sign match fail".into(),
            });
        }
        Ok(())
    }
}

fn job(bodies: &[&str], concurrency: usize) -> Job {
    let rows = bodies
        .iter()
        .enumerate()
        .map(|(i, body)| {
            let cells = json!({ "id": i, "text": body }).as_object().cloned().unwrap();
            Row::new(i as u64, cells)
        })
        .collect();
    let mut job = Job::new(
        "scenario",
        "m",
        "label this",
        "text",
        OUT,
        vec!["id".into(), "text".into()],
        rows,
    );
    job.concurrency = concurrency;
    job
}

fn runner(invoker: &Arc<FakeInvoker>) -> BatchRunner {
    let registry = ModelRegistry::new(vec![ModelTarget {
        id: "m".into(),
        name: "Model M".into(),
        ..Default::default()
    }]);
    let settings = BatchSettings {
        dispatch_interval_ms: 0,
        persist_debounce_ms: 0,
        ..Default::default()
    };
    let runner = BatchRunner::new(invoker.clone(), registry, settings);
    let _ = invoker.control.set(runner.control());
    runner
}

#[tokio::test]
async fn failed_row_is_counted_and_marked() {
    let invoker = Arc::new(FakeInvoker::default());
    let report = runner(&invoker)
        .run(job(&["a", "bad", "c"], 2), StartMode::Fresh)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(
        report.job.status,
        ProcessingStatus {
            total: 3,
            processed: 3,
            success: 2,
            failed: 1,
            is_running: false,
        }
    );
    assert_eq!(report.job.phase, JobPhase::Completed);
    assert_eq!(report.job.result(0).unwrap().output(OUT), Some("echo a"));
    assert_eq!(report.job.result(2).unwrap().columns["text"], "c");
    let failed = report.job.result(1).unwrap();
    assert!(failed.failed);
    assert!(failed.output(OUT).unwrap().starts_with(FAILURE_MARKER));
}

#[tokio::test]
async fn pause_then_resume_processes_each_row_once() {
    let invoker = Arc::new(FakeInvoker {
        halt_at: Some(("r0".into(), Halt::Pause)),
        ..Default::default()
    });
    let runner = runner(&invoker);
    let bodies = ["r0", "r1", "r2", "r3", "r4"];

    let paused = runner.run(job(&bodies, 1), StartMode::Fresh).await.unwrap();
    assert_eq!(paused.outcome, RunOutcome::Paused);
    assert_eq!(paused.job.phase, JobPhase::Paused);
    assert_eq!(paused.job.status.processed, 1);
    assert!(!paused.job.status.is_running);
    assert_eq!(paused.job.last_attempted_index, Some(0));
    assert_eq!(paused.job.resume_index(), 1);

    let resumed = runner.run(paused.job, StartMode::Resume).await.unwrap();
    assert_eq!(resumed.outcome, RunOutcome::Completed);
    assert_eq!(resumed.job.status.processed, 5);
    assert_eq!(resumed.job.status.success, 5);
    for body in bodies {
        assert_eq!(invoker.calls(body), 1, "row {} should be invoked once", body);
    }
}

#[tokio::test]
async fn stop_ends_run_and_keeps_cursor() {
    let invoker = Arc::new(FakeInvoker {
        halt_at: Some(("s1".into(), Halt::Stop)),
        ..Default::default()
    });
    let runner = runner(&invoker);

    let stopped = runner
        .run(job(&["s0", "s1", "s2", "s3"], 1), StartMode::Fresh)
        .await
        .unwrap();
    assert_eq!(stopped.outcome, RunOutcome::Stopped);
    assert_eq!(stopped.job.phase, JobPhase::Stopped);
    assert_eq!(stopped.job.status.processed, 2);
    assert_eq!(stopped.job.last_attempted_index, Some(1));
    assert_eq!(invoker.calls("s2"), 0);

    let resumed = runner.run(stopped.job, StartMode::Resume).await.unwrap();
    assert_eq!(resumed.outcome, RunOutcome::Completed);
    assert_eq!(resumed.job.status.processed, 4);
    assert_eq!(invoker.total_calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn raising_concurrency_mid_run_admits_more_rows() {
    let invoker = Arc::new(FakeInvoker {
        delay: Duration::from_millis(10),
        resize_at: Some(("w0".into(), 3)),
        ..Default::default()
    });
    let report = runner(&invoker)
        .run(job(&["w0", "w1", "w2", "w3", "w4", "w5"], 1), StartMode::Fresh)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.job.status.processed, 6);
    assert_eq!(report.job.concurrency, 3);
    assert_eq!(invoker.peak.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn lowering_concurrency_mid_run_keeps_admitted_rows() {
    let invoker = Arc::new(FakeInvoker {
        delay: Duration::from_millis(10),
        resize_at: Some(("l1".into(), 1)),
        ..Default::default()
    });
    let bodies = ["l0", "l1", "l2", "l3", "l4", "l5", "l6"];
    let started = tokio::time::Instant::now();
    let report = runner(&invoker)
        .run(job(&bodies, 4), StartMode::Fresh)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.job.status.processed, 7);
    assert_eq!(report.job.status.success, 7);
    assert_eq!(report.job.concurrency, 1);
    for (index, body) in bodies.iter().enumerate() {
        assert_eq!(
            report.job.result(index).unwrap().output(OUT),
            Some(format!("echo {}", body).as_str())
        );
        assert_eq!(invoker.calls(body), 1);
    }
    assert_eq!(invoker.peak.load(Ordering::SeqCst), 4);
    // Four rows together, then the last three one at a time.
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[tokio::test(start_paused = true)]
async fn in_flight_never_exceeds_concurrency() {
    let invoker = Arc::new(FakeInvoker {
        delay: Duration::from_millis(5),
        ..Default::default()
    });
    let bodies: Vec<String> = (0..12).map(|i| format!("row{}", i)).collect();
    let refs: Vec<&str> = bodies.iter().map(String::as_str).collect();
    let report = runner(&invoker)
        .run(job(&refs, 4), StartMode::Fresh)
        .await
        .unwrap();

    assert_eq!(report.job.status.processed, 12);
    assert_eq!(invoker.peak.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn fresh_restart_does_not_double_count() {
    let invoker = Arc::new(FakeInvoker::default());
    let runner = runner(&invoker);
    let first = runner.run(job(&["x", "bad", "z"], 3), StartMode::Fresh).await.unwrap();
    let second = runner.run(first.job, StartMode::Fresh).await.unwrap();

    assert_eq!(second.job.status.processed, 3);
    assert_eq!(second.job.status.failed, 1);
    assert_eq!(invoker.calls("x"), 2);
}

#[tokio::test]
async fn resuming_a_completed_job_dispatches_nothing() {
    let invoker = Arc::new(FakeInvoker::default());
    let runner = runner(&invoker);
    let done = runner.run(job(&["a", "b"], 2), StartMode::Fresh).await.unwrap();
    let again = runner.run(done.job, StartMode::Resume).await.unwrap();

    assert_eq!(again.outcome, RunOutcome::Completed);
    assert_eq!(again.job.status.processed, 2);
    assert_eq!(invoker.total_calls(), 2);
}

#[tokio::test]
async fn panicking_worker_becomes_failed_row() {
    let invoker = Arc::new(FakeInvoker::default());
    let report = runner(&invoker)
        .run(job(&["ok", "panic"], 2), StartMode::Fresh)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.job.status.success, 1);
    assert_eq!(report.job.status.failed, 1);
    let output = report.job.result(1).unwrap().output(OUT).unwrap();
    assert!(output.starts_with(FAILURE_MARKER));
    assert!(output.contains("row 1"));
}

#[tokio::test]
async fn scheduler_fault_leaves_job_resumable() {
    let invoker = Arc::new(FakeInvoker::default());
    let store = Arc::new(MemoryStore::new(1 << 20));
    let (persist, writer) = PersistHandle::spawn(JobArchive::load(store, 20), Duration::from_secs(60));
    let faulty = runner(&invoker)
        .with_persistence(persist)
        .with_scheduler_fault_at(1);
    let bodies = ["f0", "f1", "f2", "f3", "f4", "f5"];

    let faulted = faulty.run(job(&bodies, 3), StartMode::Fresh).await.unwrap();
    assert!(matches!(faulted.outcome, RunOutcome::Faulted(_)));
    assert_eq!(faulted.job.phase, JobPhase::Faulted);
    assert!(!faulted.job.status.is_running);
    assert!(faulted.job.result(1).is_none());
    let resume_at = faulted.job.resume_index();
    assert!(resume_at <= 1);
    assert!((0..resume_at).all(|index| faulted.job.result(index).is_some()));

    drop(faulty);
    let archive = writer.await.unwrap();
    let saved = archive.find(&faulted.job.id).unwrap();
    assert!(!saved.status.is_running);
    assert_eq!(saved.phase, JobPhase::Faulted);
    assert_eq!(saved.resume_index(), resume_at);

    let resumed = runner(&invoker).run(faulted.job, StartMode::Resume).await.unwrap();
    assert_eq!(resumed.outcome, RunOutcome::Completed);
    assert_eq!(resumed.job.status.processed, 6);
    assert_eq!(resumed.job.status.success, 6);
    assert!((0..bodies.len()).all(|index| resumed.job.result(index).is_some()));
}

#[tokio::test]
async fn invalid_job_is_rejected_before_dispatch() {
    let invoker = Arc::new(FakeInvoker::default());
    let mut job = job(&["a"], 1);
    job.model_target = "nope".into();
    let err = runner(&invoker).run(job, StartMode::Fresh).await.unwrap_err();

    assert_eq!(err, ConfigError::UnknownModel("nope".into()));
    assert_eq!(invoker.total_calls(), 0);
}

#[tokio::test]
async fn completion_sends_one_notification() {
    let invoker = Arc::new(FakeInvoker::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let runner = runner(&invoker).with_notifier(notifier.clone());
    let mut job = job(&["a", "b", "bad"], 2);
    job.notify_on_complete = true;

    let report = runner.run(job, StartMode::Fresh).await.unwrap();
    assert!(matches!(report.notification, Some(Ok(()))));
    let sent = notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].severity, Severity::Warning);
    assert!(sent[0].title.contains("scenario"));
    assert!(sent[0].body.contains("Model M"));
}

#[tokio::test]
async fn notifier_failure_leaves_status_untouched() {
    let invoker = Arc::new(FakeInvoker::default());
    let notifier = Arc::new(RecordingNotifier {
        fail: true,
        ..Default::default()
    });
    let runner = runner(&invoker).with_notifier(notifier);
    let mut job = job(&["a", "b"], 2);
    job.notify_on_complete = true;

    let report = runner.run(job, StartMode::Fresh).await.unwrap();
    assert!(matches!(report.notification, Some(Err(NotifyError::Rejected { .. }))));
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.job.status.success, 2);
}

#[tokio::test]
async fn paused_run_sends_no_notification() {
    let invoker = Arc::new(FakeInvoker {
        halt_at: Some(("p0".into(), Halt::Pause)),
        ..Default::default()
    });
    let notifier = Arc::new(RecordingNotifier::default());
    let runner = runner(&invoker).with_notifier(notifier.clone());
    let mut job = job(&["p0", "p1"], 1);
    job.notify_on_complete = true;

    let report = runner.run(job, StartMode::Fresh).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Paused);
    assert!(report.notification.is_none());
    assert!(notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn finished_run_is_saved_to_archive() {
    let invoker = Arc::new(FakeInvoker::default());
    let store = Arc::new(MemoryStore::new(1 << 20));
    let (persist, writer) = PersistHandle::spawn(JobArchive::load(store, 20), Duration::from_secs(60));
    let runner = runner(&invoker).with_persistence(persist);

    let report = runner.run(job(&["a", "b", "c"], 2), StartMode::Fresh).await.unwrap();
    let save = report.save.expect("final state should be written");
    assert_eq!(save.step, SaveStep::Full);
    assert!(!save.degraded());

    drop(runner);
    let archive = writer.await.unwrap();
    let saved = archive.find(&report.job.id).unwrap();
    assert_eq!(saved.status.processed, 3);
    assert!(!saved.status.is_running);
    assert_eq!(saved.phase, JobPhase::Completed);
}
