//! Bounded-concurrency dispatch of a job's rows.
//!
//! Rows are admitted in index order while fewer than `concurrency` are in
//! flight. Completions arrive through a `JoinSet`; control changes (pause,
//! stop, concurrency) arrive through a `watch` channel and take effect on the
//! next admission round. In-flight calls are never aborted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{Id, JoinSet};
use tracing::{error, info};

use crate::core::batch::processor::RowProcessor;
use crate::core::batch::state::JobState;
use crate::core::batch::types::{DerivedRow, RunOutcome};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("worker for row {index} did not finish: {reason}")]
    WorkerFailed { index: usize, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    pub stop: bool,
    pub paused: bool,
    pub concurrency: usize,
}

impl ControlState {
    pub fn halted(&self) -> bool {
        self.stop || self.paused
    }
}

/// Cloneable control plane for a running scheduler.
#[derive(Clone)]
pub struct SchedulerControl {
    tx: Arc<watch::Sender<ControlState>>,
    max_concurrency: usize,
}

impl SchedulerControl {
    pub fn new(concurrency: usize, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        let (tx, _) = watch::channel(ControlState {
            stop: false,
            paused: false,
            concurrency: concurrency.clamp(1, max_concurrency),
        });
        Self {
            tx: Arc::new(tx),
            max_concurrency,
        }
    }

    pub fn state(&self) -> ControlState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControlState> {
        self.tx.subscribe()
    }

    /// Clear pause/stop flags before a run starts.
    pub fn begin_run(&self, concurrency: usize) -> usize {
        let concurrency = concurrency.clamp(1, self.max_concurrency);
        self.tx.send_modify(|s| {
            s.stop = false;
            s.paused = false;
            s.concurrency = concurrency;
        });
        concurrency
    }

    /// Stop admitting rows; the run ends as paused once in-flight rows settle.
    pub fn pause(&self) {
        self.tx.send_modify(|s| s.paused = true);
    }

    /// Lift a pause while the run is still draining.
    pub fn unpause(&self) {
        self.tx.send_modify(|s| s.paused = false);
    }

    /// Stop admitting rows; the run ends as stopped once in-flight rows settle.
    pub fn stop(&self) {
        self.tx.send_modify(|s| {
            s.stop = true;
            s.paused = false;
        });
    }

    /// Change the in-flight limit, clamped to `1..=max`. Already admitted rows
    /// are never discarded when lowering it.
    pub fn set_concurrency(&self, concurrency: usize) -> usize {
        let concurrency = concurrency.clamp(1, self.max_concurrency);
        self.tx.send_modify(|s| s.concurrency = concurrency);
        concurrency
    }
}

pub struct Scheduler {
    processor: Arc<RowProcessor>,
    control: SchedulerControl,
    dispatch_interval: Duration,
    #[cfg(test)]
    fault_at: Option<usize>,
}

impl Scheduler {
    pub fn new(processor: Arc<RowProcessor>, control: SchedulerControl, dispatch_interval: Duration) -> Self {
        Self {
            processor,
            control,
            dispatch_interval,
            #[cfg(test)]
            fault_at: None,
        }
    }

    /// Panic while settling row `index`, before its result is stored.
    #[cfg(test)]
    pub fn with_fault_at(mut self, index: Option<usize>) -> Self {
        self.fault_at = index;
        self
    }

    /// Process rows `start..` of the job held by `state`.
    pub async fn run(&self, state: &mut JobState, start: usize) -> RunOutcome {
        let mut control = self.control.subscribe();
        let mut control_open = true;
        let total = state.job().total();
        let mut cursor = start.min(total);
        let mut in_flight: JoinSet<DerivedRow> = JoinSet::new();
        let mut slots: HashMap<Id, usize> = HashMap::new();

        state.begin(control.borrow().concurrency);
        info!(
            "Job {} running rows {}..{} (concurrency {})",
            state.job().id,
            cursor,
            total,
            state.job().concurrency
        );

        loop {
            let ctl = *control.borrow_and_update();
            state.set_concurrency(ctl.concurrency);

            if !ctl.halted() {
                while in_flight.len() < ctl.concurrency && cursor < total {
                    let index = cursor;
                    cursor += 1;
                    let row = state.job().rows[index].clone();
                    let processor = self.processor.clone();
                    let handle = in_flight.spawn(async move { processor.process(&row).await });
                    slots.insert(handle.id(), index);
                    state.admit(index);

                    if !self.dispatch_interval.is_zero() && cursor < total {
                        tokio::time::sleep(self.dispatch_interval).await;
                        if control.has_changed().unwrap_or(false) {
                            break;
                        }
                    }
                }
            }

            if in_flight.is_empty() && (ctl.halted() || cursor >= total) {
                break;
            }

            tokio::select! {
                Some(joined) = in_flight.join_next_with_id() => match joined {
                    Ok((id, derived)) => {
                        if let Some(index) = slots.remove(&id) {
                            #[cfg(test)]
                            if self.fault_at == Some(index) {
                                panic!("scheduler fault while settling row {}", index);
                            }
                            state.complete(index, derived);
                        }
                    }
                    Err(e) => {
                        if let Some(index) = slots.remove(&e.id()) {
                            let failure = SchedulerError::WorkerFailed {
                                index,
                                reason: e.to_string(),
                            };
                            error!("{}", failure);
                            let row = &state.job().rows[index];
                            let derived = DerivedRow::failure(
                                row,
                                self.processor.output_column(),
                                &failure.to_string(),
                            );
                            state.complete(index, derived);
                        }
                    }
                },
                changed = control.changed(), if control_open => {
                    if changed.is_err() {
                        control_open = false;
                    }
                }
                else => break,
            }
        }

        let ctl = *control.borrow();
        let outcome = if ctl.stop {
            RunOutcome::Stopped
        } else if cursor >= total {
            RunOutcome::Completed
        } else {
            RunOutcome::Paused
        };
        info!(
            "Job {} {} after row {:?}",
            state.job().id,
            outcome.phase().as_str(),
            state.job().last_attempted_index
        );
        outcome
    }
}
