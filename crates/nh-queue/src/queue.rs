//! The `Queue` trait and its in-memory implementation.
//!
//! Grounded in FlowCatalyst's `pool.rs` worker-loop shape (semaphore-free
//! here since ordering across messages is explicitly a non-goal), and in
//! `fc-queue::QueueConsumer`/`QueuePublisher` for the trait split between
//! submission and lifecycle operations.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use nh_common::model::{Message, Receipt, Target};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::QueueError;
use crate::handle::{BatchHandle, Handle, HandleOutcome};

/// A unit of work's send pipeline: given the message and its resolved
/// targets, produce a Receipt or a terminal error. Supplied by `nh-router`'s
/// `Dispatcher` when wiring a `Client` together; a bare `MemoryQueue` with
/// no processor just fails every item with "no processor", per spec.md
/// §4.7's worker-loop contract.
pub type Processor = Arc<
    dyn Fn(Message, Vec<Target>) -> Pin<Box<dyn Future<Output = Result<Receipt, nh_common::Error>> + Send>>
        + Send
        + Sync,
>;

/// Per-enqueue options.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Deadline for the enqueue call itself (blocking-on-full semantics).
    /// `None` means wait indefinitely for a slot.
    pub enqueue_timeout: Option<Duration>,
}

/// Point-in-time counters for [`Queue::get_stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub workers: u32,
    pub updated_at: Option<DateTime<Utc>>,
}

struct QueueItem {
    message: Message,
    targets: Vec<Target>,
    processor: Option<Processor>,
    handle: Arc<Handle>,
}

/// The async dispatch substrate: bounded FIFO queue + fixed worker pool.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(
        &self,
        message: Message,
        targets: Vec<Target>,
        opts: EnqueueOptions,
    ) -> Result<Arc<Handle>, QueueError>;

    async fn enqueue_with_processor(
        &self,
        message: Message,
        targets: Vec<Target>,
        processor: Processor,
        opts: EnqueueOptions,
    ) -> Result<Arc<Handle>, QueueError>;

    async fn enqueue_batch(
        &self,
        messages: Vec<(Message, Vec<Target>)>,
        processor: Processor,
        opts: EnqueueOptions,
    ) -> Result<Arc<BatchHandle>, QueueError>;

    /// Spawn `worker_count` workers (0 means the default). Takes `Arc<Self>`
    /// so each spawned worker task can hold its own strong reference.
    async fn start(self: Arc<Self>, worker_count: usize);

    /// Close intake and join all workers. In-flight items are allowed to
    /// complete. Idempotent: a second call after the first succeeds is a
    /// no-op.
    async fn stop(self: Arc<Self>);

    fn is_healthy(&self) -> bool;
    fn get_stats(&self) -> QueueStats;
}

const DEFAULT_CAPACITY: usize = 1000;
const DEFAULT_WORKERS: usize = 4;

/// Bounded in-memory `Queue`. A durable backend is a drop-in replacement
/// implementing the same [`Queue`] trait (spec.md's stated non-goal is
/// persistence, not pluggability).
pub struct MemoryQueue {
    capacity: usize,
    sender: parking_lot::Mutex<Option<mpsc::Sender<QueueItem>>>,
    receiver: Arc<AsyncMutex<Option<mpsc::Receiver<QueueItem>>>>,
    running: AtomicBool,
    stopped_permanently: AtomicBool,
    workers: AtomicU64,
    pending: AtomicU64,
    processing: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    join_handles: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MemoryQueue {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity);
        Arc::new(Self {
            capacity,
            sender: parking_lot::Mutex::new(Some(tx)),
            receiver: Arc::new(AsyncMutex::new(Some(rx))),
            running: AtomicBool::new(false),
            stopped_permanently: AtomicBool::new(false),
            workers: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            processing: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            join_handles: AsyncMutex::new(Vec::new()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    async fn submit(
        &self,
        message: Message,
        targets: Vec<Target>,
        processor: Option<Processor>,
        opts: EnqueueOptions,
    ) -> Result<Arc<Handle>, QueueError> {
        let sender = {
            let guard = self.sender.lock();
            guard.clone().ok_or(QueueError::Stopped)?
        };
        let handle = Handle::new(message.id.clone());
        let item = QueueItem {
            message,
            targets,
            processor,
            handle: handle.clone(),
        };

        let send_fut = sender.send(item);
        let outcome = match opts.enqueue_timeout {
            Some(timeout) => tokio::time::timeout(timeout, send_fut)
                .await
                .map_err(|_| QueueError::DeadlineElapsed)?,
            None => send_fut.await.map(|_| ()),
        };

        match outcome {
            Ok(()) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
                Ok(handle)
            }
            Err(_) => Err(QueueError::Stopped),
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            let item = {
                let mut guard = self.receiver.lock().await;
                match guard.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => None,
                }
            };
            let Some(item) = item else {
                tracing::debug!(worker_id, "queue worker exiting: channel closed");
                break;
            };
            self.pending.fetch_sub(1, Ordering::SeqCst);
            self.run_item(item).await;
        }
    }

    async fn run_item(&self, item: QueueItem) {
        let QueueItem {
            message,
            targets,
            processor,
            handle,
        } = item;

        if handle.status().is_terminal() {
            // Cancelled before a worker ever picked it up.
            return;
        }
        handle.mark_processing();
        self.processing.fetch_add(1, Ordering::SeqCst);

        let outcome = match processor {
            None => HandleOutcome::Failed(nh_common::Error::new(
                nh_common::ErrorCode::OperationFailed,
                "no processor bound to this queue item",
            )),
            Some(processor) => {
                let message_id = message.id.clone();
                let fut = processor(message, targets);
                match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(Ok(receipt)) => HandleOutcome::Completed(Arc::new(receipt)),
                    Ok(Err(err)) => HandleOutcome::Failed(err),
                    Err(_panic) => {
                        tracing::error!(message_id = %message_id, "processor panicked");
                        HandleOutcome::Failed(nh_common::Error::new(
                            nh_common::ErrorCode::InternalError,
                            "processor panicked",
                        ))
                    }
                }
            }
        };

        self.processing.fetch_sub(1, Ordering::SeqCst);
        match &outcome {
            HandleOutcome::Completed(_) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
            HandleOutcome::Failed(_) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
            HandleOutcome::Cancelled => {}
        }
        handle.set_outcome(outcome);
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(
        &self,
        message: Message,
        targets: Vec<Target>,
        opts: EnqueueOptions,
    ) -> Result<Arc<Handle>, QueueError> {
        self.submit(message, targets, None, opts).await
    }

    async fn enqueue_with_processor(
        &self,
        message: Message,
        targets: Vec<Target>,
        processor: Processor,
        opts: EnqueueOptions,
    ) -> Result<Arc<Handle>, QueueError> {
        self.submit(message, targets, Some(processor), opts).await
    }

    async fn enqueue_batch(
        &self,
        messages: Vec<(Message, Vec<Target>)>,
        processor: Processor,
        opts: EnqueueOptions,
    ) -> Result<Arc<BatchHandle>, QueueError> {
        let mut handles = Vec::with_capacity(messages.len());
        for (message, targets) in messages {
            let handle = self
                .submit(message, targets, Some(processor.clone()), opts.clone())
                .await?;
            handles.push(handle);
        }
        Ok(BatchHandle::new(handles))
    }

    async fn start(self: Arc<Self>, worker_count: usize) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // already running
        }
        let worker_count = if worker_count == 0 { DEFAULT_WORKERS } else { worker_count };
        self.workers.store(worker_count as u64, Ordering::SeqCst);
        tracing::info!(worker_count, capacity = self.capacity, "starting queue workers");

        let mut handles = self.join_handles.lock().await;
        for worker_id in 0..worker_count {
            let queue = self.clone();
            handles.push(tokio::spawn(queue.worker_loop(worker_id)));
        }
    }

    async fn stop(self: Arc<Self>) {
        // Idempotent: a second call after the sender is already gone is a
        // harmless no-op.
        if self.stopped_permanently.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        // Drop the last `Sender`: once no clones remain (transient ones held
        // by in-flight `submit` calls finish quickly), `recv` returns `None`
        // and every worker exits after finishing its current item.
        self.sender.lock().take();

        let mut handles = self.join_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.stopped_permanently.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending.load(Ordering::SeqCst),
            processing: self.processing.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            workers: self.workers.load(Ordering::SeqCst) as u32,
            updated_at: Some(Utc::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nh_common::model::{Target, TargetType};
    use std::sync::atomic::AtomicU32;

    fn ok_processor() -> Processor {
        Arc::new(|message, _targets| {
            Box::pin(async move {
                let receipt = Receipt::new(message.id.clone());
                receipt.add_result(nh_common::model::PlatformResult::success(
                    "mock",
                    "t",
                    "ok",
                    Duration::from_millis(1),
                ));
                Ok(receipt)
            })
        })
    }

    #[tokio::test]
    async fn enqueue_without_processor_fails_no_processor() {
        let queue = MemoryQueue::with_capacity(10);
        queue.clone().start(2).await;
        let msg = Message::builder().title("hi").build().unwrap();
        let handle = queue.enqueue(msg, vec![], EnqueueOptions::default()).await.unwrap();
        let outcome = handle.result().await;
        assert!(matches!(outcome, HandleOutcome::Failed(_)));
        queue.clone().stop().await;
    }

    #[tokio::test]
    async fn enqueue_with_processor_completes() {
        let queue = MemoryQueue::with_capacity(10);
        queue.clone().start(2).await;
        let msg = Message::builder().title("hi").build().unwrap();
        let target = Target::new(TargetType::Email, "a@example.com", None).unwrap();
        let handle = queue
            .enqueue_with_processor(msg, vec![target], ok_processor(), EnqueueOptions::default())
            .await
            .unwrap();
        let outcome = handle.result().await;
        assert!(outcome.is_success());
        queue.clone().stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_rejects_further_enqueues() {
        let queue = MemoryQueue::with_capacity(10);
        queue.clone().start(1).await;
        queue.clone().stop().await;
        queue.clone().stop().await; // second call must be a harmless no-op

        let msg = Message::builder().title("hi").build().unwrap();
        let result = queue.enqueue(msg, vec![], EnqueueOptions::default()).await;
        assert!(matches!(result, Err(QueueError::Stopped)));
    }

    #[tokio::test]
    async fn processor_panic_becomes_internal_error() {
        let queue = MemoryQueue::with_capacity(10);
        queue.clone().start(1).await;
        let panicking: Processor = Arc::new(|_msg, _targets| Box::pin(async { panic!("boom") }));
        let msg = Message::builder().title("hi").build().unwrap();
        let handle = queue
            .enqueue_with_processor(msg, vec![], panicking, EnqueueOptions::default())
            .await
            .unwrap();
        match handle.result().await {
            HandleOutcome::Failed(err) => assert_eq!(err.code(), nh_common::ErrorCode::InternalError),
            other => panic!("expected failed outcome, got a different variant: {}", other.is_success()),
        }
        queue.clone().stop().await;
    }

    #[tokio::test]
    async fn batch_enqueue_runs_every_message() {
        let queue = MemoryQueue::with_capacity(10);
        queue.clone().start(2).await;
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = counter.clone();
        let processor: Processor = Arc::new(move |message, _targets| {
            let counter = counter2.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Receipt::new(message.id))
            })
        });
        let messages = (0..5)
            .map(|i| (Message::builder().title(format!("m{i}")).build().unwrap(), vec![]))
            .collect();
        let batch = queue
            .enqueue_batch(messages, processor, EnqueueOptions::default())
            .await
            .unwrap();
        let results = batch.wait().await;
        assert_eq!(results.len(), 5);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        queue.clone().stop().await;
    }
}
