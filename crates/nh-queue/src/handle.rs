//! `Handle` and `BatchHandle`: per-operation status, result delivery, and
//! progress/completion callbacks for the async dispatch path.
//!
//! Grounded in the `AckNack`/result-delivery shape of FlowCatalyst's
//! `pool.rs` worker loop, adapted to spec.md §4.8's single-slot result
//! channel and sticky-terminal-state machine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nh_common::model::{HandleState, Receipt};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Terminal (or cancelled) outcome of one async operation.
#[derive(Clone)]
pub enum HandleOutcome {
    Completed(Arc<Receipt>),
    Failed(nh_common::Error),
    Cancelled,
}

impl HandleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HandleOutcome::Completed(_))
    }
}

type CompleteCallback = Box<dyn FnOnce(&Receipt) + Send>;
type ErrorCallback = Box<dyn FnOnce(&nh_common::Error) + Send>;
type ProgressCallback = Box<dyn Fn(f64) + Send>;

struct HandleInner {
    state: HandleState,
    outcome: Option<HandleOutcome>,
    on_complete: Option<CompleteCallback>,
    on_error: Option<ErrorCallback>,
    on_progress: Option<ProgressCallback>,
}

/// A reference to an in-flight (or completed) async dispatch operation.
///
/// Always held behind `Arc<Handle>`: the worker that completes the
/// operation and the caller that awaits it both hold a clone.
pub struct Handle {
    id: String,
    inner: Mutex<HandleInner>,
    notify: Notify,
}

impl Handle {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            inner: Mutex::new(HandleInner {
                state: HandleState::Pending,
                outcome: None,
                on_complete: None,
                on_error: None,
                on_progress: None,
            }),
            notify: Notify::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> HandleState {
        self.inner.lock().state
    }

    /// Register a callback that fires exactly once, synchronously on the
    /// delivering worker, when the operation completes successfully.
    /// Panics inside the callback are caught and logged, never propagated.
    pub fn on_complete(self: &Arc<Self>, f: impl FnOnce(&Receipt) + Send + 'static) -> Arc<Self> {
        self.inner.lock().on_complete = Some(Box::new(f));
        self.clone()
    }

    /// Register a callback that fires exactly once when the operation fails
    /// (not on cancellation).
    pub fn on_error(self: &Arc<Self>, f: impl FnOnce(&nh_common::Error) + Send + 'static) -> Arc<Self> {
        self.inner.lock().on_error = Some(Box::new(f));
        self.clone()
    }

    /// Register a progress callback; may fire multiple times before a
    /// terminal state is reached.
    pub fn on_progress(self: &Arc<Self>, f: impl Fn(f64) + Send + 'static) -> Arc<Self> {
        self.inner.lock().on_progress = Some(Box::new(f));
        self.clone()
    }

    pub fn report_progress(&self, fraction: f64) {
        let inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        if let Some(f) = inner.on_progress.as_ref() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(fraction))).is_err() {
                tracing::warn!(handle_id = %self.id, "on_progress callback panicked");
            }
        }
    }

    /// Mark the handle as dequeued and in flight. No-op if already terminal.
    pub fn mark_processing(&self) {
        let mut inner = self.inner.lock();
        if inner.state.can_transition_to(HandleState::Processing) {
            inner.state = HandleState::Processing;
        }
    }

    /// Deliver the terminal outcome. Idempotent: a second call is ignored
    /// (terminal states are sticky) except that a `Completed`/`Failed`
    /// outcome racing a prior `Cancel()` is discarded, per spec.md §3.
    pub fn set_outcome(&self, outcome: HandleOutcome) {
        let (on_complete, on_error) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = match &outcome {
                HandleOutcome::Completed(_) => HandleState::Completed,
                HandleOutcome::Failed(_) => HandleState::Failed,
                HandleOutcome::Cancelled => HandleState::Cancelled,
            };
            let on_complete = match &outcome {
                HandleOutcome::Completed(_) => inner.on_complete.take(),
                _ => None,
            };
            let on_error = match &outcome {
                HandleOutcome::Failed(_) => inner.on_error.take(),
                _ => None,
            };
            inner.outcome = Some(outcome.clone());
            (on_complete, on_error)
        };
        self.notify.notify_waiters();

        match (outcome, on_complete, on_error) {
            (HandleOutcome::Completed(receipt), Some(cb), _) => {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(&receipt))).is_err() {
                    tracing::warn!(handle_id = %self.id, "on_complete callback panicked");
                }
            }
            (HandleOutcome::Failed(err), _, Some(cb)) => {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(&err))).is_err() {
                    tracing::warn!(handle_id = %self.id, "on_error callback panicked");
                }
            }
            _ => {}
        }
    }

    /// Request cancellation. If the operation already reached a terminal
    /// state, this is a no-op (terminal states are sticky).
    pub fn cancel(&self) {
        self.set_outcome(HandleOutcome::Cancelled);
    }

    /// Await the terminal outcome with no deadline.
    pub async fn result(self: &Arc<Self>) -> HandleOutcome {
        loop {
            if let Some(outcome) = self.inner.lock().outcome.clone() {
                return outcome;
            }
            self.notify.notified().await;
        }
    }

    /// Await the terminal outcome, or return `QueueError::DeadlineElapsed`
    /// if `timeout` elapses first.
    pub async fn wait(self: &Arc<Self>, timeout: Duration) -> Result<HandleOutcome, crate::error::QueueError> {
        match tokio::time::timeout(timeout, self.result()).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => Err(crate::error::QueueError::DeadlineElapsed),
        }
    }
}

/// Aggregate progress snapshot pushed to a [`BatchHandle`]'s progress
/// stream on each individual child completion.
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub progress: f64,
}

/// Collects N child [`Handle`]s submitted as one batch.
pub struct BatchHandle {
    children: Vec<Arc<Handle>>,
    completed: AtomicUsize,
    failed: AtomicUsize,
    progress_tx: tokio::sync::mpsc::Sender<BatchProgress>,
    progress_rx: Mutex<Option<tokio::sync::mpsc::Receiver<BatchProgress>>>,
}

impl BatchHandle {
    pub fn new(children: Vec<Arc<Handle>>) -> Arc<Self> {
        let (tx, rx) = tokio::sync::mpsc::channel(children.len().max(1));
        let batch = Arc::new(Self {
            children,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            progress_tx: tx,
            progress_rx: Mutex::new(Some(rx)),
        });
        batch.spawn_watchers();
        batch
    }

    fn spawn_watchers(self: &Arc<Self>) {
        for child in &self.children {
            let child = child.clone();
            let batch = self.clone();
            tokio::spawn(async move {
                let outcome = child.result().await;
                batch.record(outcome.is_success());
            });
        }
    }

    fn record(&self, success: bool) {
        if success {
            self.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        let total = self.children.len();
        let done = self.completed.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst);
        let snapshot = BatchProgress {
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            total,
            progress: if total == 0 { 1.0 } else { done as f64 / total as f64 },
        };
        // Drop-on-full: a slow consumer misses intermediate snapshots, never
        // blocks the batch from progressing.
        let _ = self.progress_tx.try_send(snapshot);
    }

    /// Take the progress receiver. Can only be taken once; subsequent calls
    /// return `None`.
    pub fn take_progress(&self) -> Option<tokio::sync::mpsc::Receiver<BatchProgress>> {
        self.progress_rx.lock().take()
    }

    /// Cascade cancellation to every child handle.
    pub fn cancel(&self) {
        for child in &self.children {
            child.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Await every child and return an index-aligned vector of receipts,
    /// `None` where the child failed or was cancelled.
    pub async fn wait(&self) -> Vec<Option<Arc<Receipt>>> {
        let mut results = Vec::with_capacity(self.children.len());
        for child in &self.children {
            let outcome = child.result().await;
            results.push(match outcome {
                HandleOutcome::Completed(receipt) => Some(receipt),
                HandleOutcome::Failed(_) | HandleOutcome::Cancelled => None,
            });
        }
        results
    }
}
