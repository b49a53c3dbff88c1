use std::sync::Arc;

use tokio::sync::watch;

/// One-shot boolean completion signal.
///
/// The first `resolve` wins; later calls are no-ops. Waiters that attach
/// after resolution still observe the value, so a late listener never
/// hangs on an already-finished operation.
#[derive(Clone)]
pub struct Completion {
    tx: Arc<watch::Sender<Option<bool>>>,
}

impl Completion {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Resolve with the given outcome. Only the first call has any effect.
    pub fn resolve(&self, success: bool) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(success);
                true
            } else {
                false
            }
        });
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait for resolution. Returns immediately if already resolved.
    pub async fn wait(&self) -> bool {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => slot.unwrap_or(false),
            // Sender kept alive through self; treat loss as failure anyway.
            Err(_) => false,
        }
    }

    /// Attach a continuation invoked with the outcome once resolved.
    pub fn on_resolve<F>(&self, f: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.wait().await;
            f(outcome);
        });
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_resolution_wins() {
        let completion = Completion::new();
        completion.resolve(true);
        completion.resolve(false);
        assert!(completion.wait().await);
    }

    #[tokio::test]
    async fn late_waiter_observes_value() {
        let completion = Completion::new();
        completion.resolve(false);

        let late = completion.clone();
        assert!(!late.wait().await);
        assert!(late.is_resolved());
    }

    #[tokio::test]
    async fn continuation_runs_with_the_outcome() {
        let completion = Completion::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        completion.on_resolve(move |outcome| {
            let _ = tx.send(outcome);
        });

        completion.resolve(true);
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn waiter_blocks_until_resolved() {
        let completion = Completion::new();
        let waiter = completion.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::task::yield_now().await;
        completion.resolve(true);
        assert!(handle.await.unwrap());
    }
}
