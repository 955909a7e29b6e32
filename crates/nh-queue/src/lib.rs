//! Async dispatch substrate: the `Queue` trait, its in-memory
//! implementation, and `Handle`/`BatchHandle` result delivery.

pub mod error;
pub mod handle;
pub mod queue;

pub use error::QueueError;
pub use handle::{BatchHandle, BatchProgress, Handle, HandleOutcome};
pub use queue::{EnqueueOptions, MemoryQueue, Processor, Queue, QueueStats};
