use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error};

use super::{JobArchive, SaveReport};
use crate::core::batch::types::Job;

enum PersistMsg {
    Save(Box<Job>),
    Flush(oneshot::Sender<Option<SaveReport>>),
}

/// Handle to the single task that owns the archive. Saves are coalesced per
/// job within the debounce window and written one at a time.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<PersistMsg>,
}

impl PersistHandle {
    /// Start the writer. The join handle yields the archive once every
    /// handle has been dropped and pending writes are done.
    pub fn spawn(archive: JobArchive, debounce: Duration) -> (Self, JoinHandle<JobArchive>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_writer(archive, debounce, rx));
        (Self { tx }, task)
    }

    /// Queue a snapshot for saving. Returns immediately.
    pub fn save(&self, job: &Job) {
        if self.tx.send(PersistMsg::Save(Box::new(job.clone()))).is_err() {
            debug!("Persistence writer is gone; dropping snapshot of {}", job.id);
        }
    }

    /// Write anything pending now. Returns the report of that write, if any.
    pub async fn flush(&self) -> Option<SaveReport> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PersistMsg::Flush(reply)).ok()?;
        rx.await.ok().flatten()
    }
}

/// Run the save, degradation cascade included, on the blocking pool since
/// the store does synchronous file I/O. If that task dies the archive is read
/// back from the store.
async fn write_pending(
    archive: JobArchive,
    pending: &mut Option<Box<Job>>,
) -> (JobArchive, Option<SaveReport>) {
    let Some(job) = pending.take() else {
        return (archive, None);
    };
    let store = archive.store.clone();
    let max_jobs = archive.max_jobs;
    let job_id = job.id.clone();
    let written = tokio::task::spawn_blocking(move || {
        let mut archive = archive;
        let report = archive.save(&job);
        (archive, report)
    })
    .await;
    match written {
        Ok((archive, report)) => (archive, Some(report)),
        Err(e) => {
            error!("Saving job {} did not finish: {}", job_id, e);
            (JobArchive::load(store, max_jobs), None)
        }
    }
}

async fn run_writer(
    mut archive: JobArchive,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<PersistMsg>,
) -> JobArchive {
    let mut pending: Option<Box<Job>> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        let msg = match deadline {
            Some(at) => match timeout_at(at, rx.recv()).await {
                Ok(msg) => msg,
                Err(_) => {
                    (archive, _) = write_pending(archive, &mut pending).await;
                    deadline = None;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match msg {
            Some(PersistMsg::Save(job)) => {
                if pending.as_ref().is_some_and(|p| p.id != job.id) {
                    (archive, _) = write_pending(archive, &mut pending).await;
                }
                pending = Some(job);
                deadline.get_or_insert_with(|| Instant::now() + debounce);
            }
            Some(PersistMsg::Flush(reply)) => {
                let (written, report) = write_pending(archive, &mut pending).await;
                archive = written;
                deadline = None;
                let _ = reply.send(report);
            }
            None => {
                (archive, _) = write_pending(archive, &mut pending).await;
                break;
            }
        }
    }
    archive
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::persist::JOBS_KEY;
    use crate::core::store::{KeyValueStore, MemoryStore, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::ThreadId;

    struct CountingWrites {
        inner: MemoryStore,
        puts: AtomicUsize,
        put_threads: Mutex<Vec<ThreadId>>,
    }

    impl KeyValueStore for CountingWrites {
        fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key)
        }
        fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.put_threads.lock().unwrap().push(std::thread::current().id());
            self.inner.put(key, value)
        }
        fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.inner.remove(key)
        }
        fn capacity(&self) -> usize {
            self.inner.capacity()
        }
    }

    fn store() -> Arc<CountingWrites> {
        Arc::new(CountingWrites {
            inner: MemoryStore::new(usize::MAX),
            puts: AtomicUsize::new(0),
            put_threads: Mutex::new(Vec::new()),
        })
    }

    fn job() -> Job {
        Job::new("t", "m", "p", "in", "out", vec![], vec![])
    }

    #[tokio::test(start_paused = true)]
    async fn saves_within_window_are_coalesced() {
        let store = store();
        let archive = JobArchive::load(store.clone(), 20);
        let (handle, task) = PersistHandle::spawn(archive, Duration::from_millis(500));

        let mut j = job();
        for i in 0..10 {
            j.title = format!("v{}", i);
            handle.save(&j);
        }
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);

        drop(handle);
        let archive = task.await.unwrap();
        assert_eq!(archive.jobs()[0].title, "v9");
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_immediately_and_reports() {
        let store = store();
        let (handle, _task) = PersistHandle::spawn(JobArchive::load(store.clone(), 20), Duration::from_secs(60));
        handle.save(&job());
        let report = handle.flush().await.unwrap();
        assert_eq!(report.saved, 1);
        assert!(store.get(JOBS_KEY).unwrap().is_some());
        assert!(handle.flush().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn switching_jobs_writes_the_previous_one() {
        let store = store();
        let (handle, task) = PersistHandle::spawn(JobArchive::load(store.clone(), 20), Duration::from_secs(60));
        handle.save(&job());
        handle.save(&job());
        drop(handle);
        let archive = task.await.unwrap();
        assert_eq!(archive.jobs().len(), 2);
        assert_eq!(store.puts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn store_writes_run_off_the_runtime_thread() {
        let store = store();
        let (handle, _task) = PersistHandle::spawn(JobArchive::load(store.clone(), 20), Duration::from_secs(60));
        handle.save(&job());
        assert!(handle.flush().await.is_some());
        let threads = store.put_threads.lock().unwrap().clone();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], std::thread::current().id());
    }
}
