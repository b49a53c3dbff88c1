// ============================================================================
// Request Queue
// ============================================================================

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use crate::notify::Completion;
use crate::record::Record;

/// One queued read-modify-write request on behalf of a record.
///
/// At most one operation per record is outstanding at any time; the queue
/// enforces this through `has_pending_for` at enqueue time.
pub(crate) struct Operation {
    record: Arc<Record>,
    emergency: bool,
    state: Mutex<OperationState>,
    completion: Completion,
}

struct OperationState {
    attempt_count: u32,
    last_attempt_at: Option<Instant>,
    processing: bool,
}

impl Operation {
    fn new(record: Arc<Record>, emergency: bool) -> Self {
        Self {
            record,
            emergency,
            state: Mutex::new(OperationState {
                attempt_count: 0,
                last_attempt_at: None,
                processing: false,
            }),
            completion: Completion::new(),
        }
    }

    pub(crate) fn record(&self) -> &Arc<Record> {
        &self.record
    }

    pub(crate) fn emergency(&self) -> bool {
        self.emergency
    }

    pub(crate) fn completion(&self) -> &Completion {
        &self.completion
    }

    pub(crate) fn is_processing(&self) -> bool {
        self.state.lock().map(|s| s.processing).unwrap_or(false)
    }

    /// Claim the operation for dispatch. Returns false when it was
    /// already in flight, so two concurrent ticks cannot both dispatch.
    pub(crate) fn try_begin_processing(&self) -> bool {
        match self.state.lock() {
            Ok(mut state) => {
                if state.processing {
                    false
                } else {
                    state.processing = true;
                    true
                }
            }
            Err(_) => false,
        }
    }

    /// Record a failed attempt: bump the counter, stamp the clock, clear
    /// the in-flight flag. Returns the new attempt count.
    pub(crate) fn record_failure(&self) -> u32 {
        match self.state.lock() {
            Ok(mut state) => {
                state.attempt_count += 1;
                state.last_attempt_at = Some(Instant::now());
                state.processing = false;
                state.attempt_count
            }
            Err(_) => u32::MAX,
        }
    }

    pub(crate) fn attempt_count(&self) -> u32 {
        self.state.lock().map(|s| s.attempt_count).unwrap_or(0)
    }

    /// True once the backoff wait for the current attempt count has
    /// elapsed. An operation that has never been attempted is eligible
    /// immediately.
    pub(crate) fn backoff_elapsed(&self, max_exponent: u32) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        match state.last_attempt_at {
            None => true,
            Some(at) => at.elapsed() >= crate::scheduler::backoff_wait(state.attempt_count, max_exponent),
        }
    }
}

/// Ordered collection of pending operations.
///
/// Emergency operations are inserted at the front; everything else is
/// FIFO at the tail, except that an ineligible head rotates to the back
/// so later items are not starved behind it.
pub(crate) struct RequestQueue {
    items: VecDeque<Arc<Operation>>,
}

impl RequestQueue {
    pub(crate) fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    pub(crate) fn enqueue(&mut self, record: Arc<Record>, emergency: bool) -> Arc<Operation> {
        let op = Arc::new(Operation::new(record, emergency));
        if emergency {
            self.items.push_front(op.clone());
        } else {
            self.items.push_back(op.clone());
        }
        op
    }

    pub(crate) fn front(&self) -> Option<&Arc<Operation>> {
        self.items.front()
    }

    /// Move the head to the tail (in-flight or backoff-blocked head).
    pub(crate) fn rotate_front(&mut self) {
        if let Some(op) = self.items.pop_front() {
            self.items.push_back(op);
        }
    }

    /// Remove the operation wherever it sits, resolve its completion and
    /// stamp the record's processed clock.
    pub(crate) fn finalize(&mut self, op: &Arc<Operation>, success: bool) {
        if let Some(pos) = self.items.iter().position(|item| Arc::ptr_eq(item, op)) {
            self.items.remove(pos);
        }
        op.record.mark_processed_now();
        op.completion.resolve(success);
    }

    /// Move a retryable operation to the back of the queue.
    pub(crate) fn requeue_back(&mut self, op: &Arc<Operation>) {
        if let Some(pos) = self.items.iter().position(|item| Arc::ptr_eq(item, op)) {
            self.items.remove(pos);
            self.items.push_back(op.clone());
        }
    }

    /// Discard everything, resolving each dropped operation as failed so
    /// its waiters are released. Forced shutdown only. Records stay open;
    /// closing them is the caller's decision.
    pub(crate) fn emergency_flush(&mut self) {
        for op in self.items.drain(..) {
            op.completion.resolve(false);
        }
    }

    /// Discard routine work ahead of a shutdown flush: every item that is
    /// neither in flight nor emergency is dropped and resolved as failed,
    /// order preserved for the rest. The affected records stay open so
    /// the emergency pass can still save them.
    pub(crate) fn flush_non_emergency(&mut self) {
        let mut kept = VecDeque::with_capacity(self.items.len());
        for op in self.items.drain(..) {
            if op.emergency || op.is_processing() {
                kept.push_back(op);
            } else {
                op.completion.resolve(false);
            }
        }
        self.items = kept;
    }

    /// Linear scan; queue sizes are bounded by resident-record count.
    pub(crate) fn has_pending_for(&self, record: &Arc<Record>) -> bool {
        self.items.iter().any(|op| Arc::ptr_eq(&op.record, record))
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreConfig};

    fn test_record(key: &str) -> Arc<Record> {
        let store = Arc::new(Store::new(StoreConfig::new("queue-tests")));
        Record::open(store, key).unwrap()
    }

    #[test]
    fn emergency_goes_to_front() {
        let mut queue = RequestQueue::new();
        let a = test_record("a");
        let b = test_record("b");
        let c = test_record("c");

        queue.enqueue(a.clone(), false);
        queue.enqueue(b.clone(), false);
        let urgent = queue.enqueue(c.clone(), true);

        assert!(Arc::ptr_eq(queue.front().unwrap(), &urgent));
    }

    #[test]
    fn rotate_preserves_items() {
        let mut queue = RequestQueue::new();
        let a = test_record("a");
        let b = test_record("b");
        let first = queue.enqueue(a, false);
        queue.enqueue(b, false);

        queue.rotate_front();
        assert_eq!(queue.len(), 2);
        assert!(!Arc::ptr_eq(queue.front().unwrap(), &first));
        queue.rotate_front();
        assert!(Arc::ptr_eq(queue.front().unwrap(), &first));
    }

    #[test]
    fn has_pending_for_matches_identity() {
        let mut queue = RequestQueue::new();
        let a = test_record("a");
        let b = test_record("b");
        queue.enqueue(a.clone(), false);

        assert!(queue.has_pending_for(&a));
        assert!(!queue.has_pending_for(&b));
    }

    #[test]
    fn flush_non_emergency_keeps_urgent_and_inflight() {
        let mut queue = RequestQueue::new();
        let a = test_record("a");
        let b = test_record("b");
        let c = test_record("c");

        let inflight = queue.enqueue(a, false);
        assert!(inflight.try_begin_processing());
        let dropped = queue.enqueue(b, false);
        queue.enqueue(c, true);

        queue.flush_non_emergency();
        assert_eq!(queue.len(), 2);
        assert!(queue.items.iter().all(|op| op.emergency || op.is_processing()));
        // Dropped work signals failure instead of stranding its waiter.
        assert!(dropped.completion().is_resolved());
        assert!(!inflight.completion().is_resolved());
    }

    #[test]
    fn emergency_flush_discards_everything() {
        let mut queue = RequestQueue::new();
        let a = queue.enqueue(test_record("a"), false);
        let b = queue.enqueue(test_record("b"), true);

        queue.emergency_flush();
        assert!(queue.is_empty());
        assert!(a.completion().is_resolved());
        assert!(b.completion().is_resolved());
    }

    #[tokio::test]
    async fn finalize_resolves_and_removes() {
        let mut queue = RequestQueue::new();
        let record = test_record("a");
        let op = queue.enqueue(record, false);

        queue.finalize(&op, true);
        assert!(queue.is_empty());
        assert!(op.completion().wait().await);
    }

    #[tokio::test]
    async fn record_failure_counts_up() {
        let mut queue = RequestQueue::new();
        let op = queue.enqueue(test_record("a"), false);

        assert_eq!(op.attempt_count(), 0);
        assert!(op.try_begin_processing());
        assert!(!op.try_begin_processing());
        assert_eq!(op.record_failure(), 1);
        assert!(!op.is_processing());
    }
}
