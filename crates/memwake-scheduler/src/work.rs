//! Worker contract between the queue runner and whatever executes a job.
//!
//! A [`Worker`] is created per firing. `start_work` must return at once with a
//! [`WorkHandle`]; the runner awaits the handle and may call `on_stopped` at
//! any time (timeout, supersession, shutdown). The [`WorkCompleter`] /
//! [`WorkHandle`] pair is a single-shot latch: the first `complete` wins and
//! every later call is a no-op.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use tokio::sync::oneshot;

/// Terminal result of one job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// The job is done; the queue drops it.
    Success,
    /// The job should run again after the request's backoff delay.
    Retry { reason: String },
}

/// One execution of a queued job.
pub trait Worker: Send + Sync {
    /// Begin execution. Returns immediately; the handle resolves exactly once.
    fn start_work(self: Arc<Self>) -> WorkHandle;

    /// External stop request. Must be idempotent and safe to call before,
    /// during, or after completion.
    fn on_stopped(&self);
}

/// Builds a fresh [`Worker`] each time the runner claims a job.
pub trait WorkerFactory: Send + Sync {
    fn create(&self, name: &str) -> Arc<dyn Worker>;
}

/// Create a connected completer/handle pair.
pub fn completion_pair() -> (WorkCompleter, WorkHandle) {
    let (tx, rx) = oneshot::channel();
    (
        WorkCompleter {
            done: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        WorkHandle { rx },
    )
}

/// Sending half of the single-shot latch. Cheap to clone.
#[derive(Clone)]
pub struct WorkCompleter {
    done: Arc<AtomicBool>,
    tx: Arc<Mutex<Option<oneshot::Sender<WorkOutcome>>>>,
}

impl WorkCompleter {
    /// Claim the latch without resolving the handle yet.
    ///
    /// Returns `true` only for the first caller. The winner is responsible
    /// for calling [`WorkCompleter::resolve`] once its cleanup is done.
    pub fn claim(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    pub fn is_claimed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Deliver `outcome` to the handle. Only the first delivery lands.
    pub fn resolve(&self, outcome: WorkOutcome) -> bool {
        let tx = self.tx.lock().unwrap().take();
        match tx {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// `claim` + `resolve` in one step.
    pub fn complete(&self, outcome: WorkOutcome) -> bool {
        if !self.claim() {
            return false;
        }
        self.resolve(outcome)
    }
}

/// Awaitable side of the latch.
///
/// Resolves to `Retry` if every completer is dropped without resolving, so a
/// worker that dies mid-flight is retried rather than lost.
pub struct WorkHandle {
    rx: oneshot::Receiver<WorkOutcome>,
}

impl Future for WorkHandle {
    type Output = WorkOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| {
            r.unwrap_or_else(|_| WorkOutcome::Retry {
                reason: "worker dropped without completing".to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_completion_wins() {
        let (completer, handle) = completion_pair();
        assert!(completer.complete(WorkOutcome::Success));
        assert!(!completer.complete(WorkOutcome::Retry {
            reason: "late".into()
        }));
        assert_eq!(handle.await, WorkOutcome::Success);
    }

    #[tokio::test]
    async fn clones_share_the_latch() {
        let (completer, handle) = completion_pair();
        let other = completer.clone();
        assert!(other.claim());
        assert!(!completer.claim());
        assert!(completer.is_claimed());
        assert!(other.resolve(WorkOutcome::Success));
        assert_eq!(handle.await, WorkOutcome::Success);
    }

    #[tokio::test]
    async fn dropped_completer_means_retry() {
        let (completer, handle) = completion_pair();
        drop(completer);
        assert!(matches!(handle.await, WorkOutcome::Retry { .. }));
    }

    #[tokio::test]
    async fn handle_stays_pending_until_resolved() {
        let (completer, handle) = completion_pair();
        let mut handle = Box::pin(handle);
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(20), &mut handle).await;
        assert!(pending.is_err());
        completer.complete(WorkOutcome::Success);
        assert_eq!(handle.await, WorkOutcome::Success);
    }
}
