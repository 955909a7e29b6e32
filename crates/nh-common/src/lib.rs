//! Shared data model, error taxonomy, ID generation, and logging init for
//! NotifyHub. Pure — no async runtime, no network I/O.

pub mod error;
pub mod idgen;
pub mod logging;
pub mod model;

pub use error::{Error, ErrorCategory, ErrorCode};
pub use idgen::{IdGenerator, SnowflakeGenerator};
pub use model::{
    Format, HandleState, Message, MessageBuilder, PlatformHealth, PlatformResult, Receipt,
    ReceiptStatus, ReceiptWire, Target, TargetType,
};
