// ============================================================================
// Scheduler Loop
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::checksum::checksum;
use crate::engine::Engine;
use crate::executor::{self, ExecFailure, ExecOutcome};
use crate::queue::Operation;
use crate::remote::RequestClass;

/// Retry wait for the given attempt count: `2^min(attempts, ceiling)`
/// seconds.
pub(crate) fn backoff_wait(attempt_count: u32, max_exponent: u32) -> Duration {
    let exponent = attempt_count.min(max_exponent).min(62);
    Duration::from_secs(1u64 << exponent)
}

impl Engine {
    /// One scheduler tick: the auto-save scan followed by a single
    /// queue-advance step. Driven by the background worker in production
    /// and called directly by tests.
    pub(crate) async fn tick(self: &Arc<Self>) {
        self.auto_save_pass().await;
        self.advance_queue().await;
    }

    /// Scan resident records of auto-save stores and queue a save for
    /// each one whose payload changed since its last baseline.
    async fn auto_save_pass(self: &Arc<Self>) {
        if !self.config.auto_save_enabled || self.is_shutting_down() {
            return;
        }

        for store in self.stores_snapshot() {
            if !store.auto_save_enabled(self.config.auto_save_enabled) {
                continue;
            }
            for record in store.resident() {
                let Some((data, baseline)) =
                    record.auto_save_candidate(self.config.auto_save_interval)
                else {
                    continue;
                };
                if self.queue.lock().await.has_pending_for(&record) {
                    continue;
                }
                let current = checksum(&data);
                if baseline == Some(current) {
                    // Unchanged since the last save; no remote call.
                    continue;
                }
                record.stamp_auto_save(current);
                debug!(store = store.name(), key = %record.key(), "auto-save enqueued");
                if let Err(err) = self.enqueue_update(record, false).await {
                    warn!(error = %err, "auto-save enqueue failed");
                }
            }
        }
    }

    /// Advance the head of the request queue by at most one dispatch.
    /// Single-operation throughput per tick bounds remote calls.
    async fn advance_queue(self: &Arc<Self>) {
        let head = {
            let queue = self.queue.lock().await;
            queue.front().cloned()
        };
        let Some(op) = head else {
            return;
        };

        // Routine work keeps a floor of budget in reserve for emergency
        // saves; an emergency head is gated only by its own class, which
        // most backends leave unbounded.
        let class = if op.emergency() {
            RequestClass::Emergency
        } else {
            RequestClass::Standard
        };
        let floor = if op.emergency() {
            0
        } else {
            self.config.reserved_emergency_budget
        };
        if self.remote.remaining_budget(class).await <= floor {
            return;
        }

        // An in-flight head rotates so other keys make progress while
        // its remote call is outstanding.
        if op.is_processing() {
            self.queue.lock().await.rotate_front();
            return;
        }

        if !op.backoff_elapsed(self.config.max_wait_exponent) {
            self.queue.lock().await.rotate_front();
            return;
        }

        if op.record().is_closed() {
            warn!(key = %op.record().key(), "dropping operation for closed record");
            self.queue.lock().await.finalize(&op, false);
            return;
        }

        if !op.try_begin_processing() {
            return;
        }
        let engine = self.clone();
        let op = op.clone();
        tokio::spawn(async move {
            let outcome = executor::run(op.record(), engine.remote.as_ref()).await;
            engine.finish_operation(op, outcome).await;
        });
    }

    async fn finish_operation(
        self: &Arc<Self>,
        op: Arc<Operation>,
        outcome: Result<ExecOutcome, ExecFailure>,
    ) {
        let key = op.record().key().to_string();
        let mut queue = self.queue.lock().await;
        match outcome {
            Ok(ExecOutcome::Loaded) => {
                op.record().refresh_checksum();
                queue.finalize(&op, true);
                debug!(key, "load committed");
            }
            Ok(ExecOutcome::Saved) => {
                queue.finalize(&op, true);
                debug!(key, "save committed");
            }
            Err(ExecFailure::Conflict) => {
                warn!(key, "session conflict; operation failed");
                op.record().close();
                queue.finalize(&op, false);
            }
            Err(ExecFailure::Migration { index, message }) => {
                warn!(key, index, message, "migration failed; operation failed");
                op.record().close();
                queue.finalize(&op, false);
            }
            Err(ExecFailure::Remote(err)) if err.is_terminal() => {
                warn!(key, error = %err, "terminal remote error; operation failed");
                op.record().close();
                queue.finalize(&op, false);
            }
            Err(ExecFailure::Remote(err)) => {
                let attempts = op.record_failure();
                if attempts >= self.config.max_attempts {
                    warn!(key, attempts, error = %err, "attempt limit reached; operation failed");
                    op.record().close();
                    queue.finalize(&op, false);
                } else {
                    debug!(key, attempts, error = %err, "transient remote error; will retry");
                    queue.requeue_back(&op);
                }
            }
        }
    }
}

/// Background worker driving the scheduler at a fixed interval.
pub(crate) struct SchedulerWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl SchedulerWorker {
    /// Signals the worker to stop and waits for it to finish.
    pub(crate) async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.await;
        }
    }
}

impl Drop for SchedulerWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawn the periodic scheduler worker for `engine`.
pub(crate) fn spawn_scheduler_worker(engine: Arc<Engine>) -> SchedulerWorker {
    let interval = engine.config.tick_interval.max(Duration::from_millis(1));
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    engine.tick().await;
                }
            }
        }
    });

    SchedulerWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let waits: Vec<u64> = (0..7)
            .map(|attempt| backoff_wait(attempt, 5).as_secs())
            .collect();
        assert_eq!(waits, vec![1, 2, 4, 8, 16, 32, 32]);
    }

    #[test]
    fn backoff_is_monotonic_below_ceiling() {
        for attempt in 0..10u32 {
            assert!(backoff_wait(attempt + 1, 8) >= backoff_wait(attempt, 8));
        }
    }
}
