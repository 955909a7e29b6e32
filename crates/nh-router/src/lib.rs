//! Routing, dispatch, and platform adapters for NotifyHub.

pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod receipt_processor;
pub mod retry;
pub mod router;
pub mod sender;
pub mod senders;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{Client, ClientBuilder};
pub use dispatcher::Dispatcher;
pub use error::RouterError;
pub use receipt_processor::{LoggingReceiptHandler, MetricsReceiptHandler, ReceiptHandler};
pub use retry::{execute_with_retry, ExponentialBackoff, FixedDelay, LinearBackoff, RetryPolicy};
pub use router::{Router, RoutingRule, Strategy};
pub use sender::{Capabilities, Registry, Sender, SenderFactory};
