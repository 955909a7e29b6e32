//! The `Client` facade and its builder — the single entry point external
//! callers use, owning its own `Registry`/`Router`/`Dispatcher`/`Queue`
//! instead of reaching for process-global state (spec.md §9's REDESIGN
//! FLAG). Grounded in `fc-router::Router::new`/`RouterBuilder`'s shape.

use std::collections::HashMap;
use std::sync::Arc;

use nh_common::model::{Message, Receipt};
use nh_common::Error;
use serde_json::Value;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::RouterError;
use crate::receipt_processor::{LoggingReceiptHandler, ReceiptHandler};
use crate::retry::{ExponentialBackoff, RetryPolicy};
use crate::router::{Router, RoutingRule, Strategy};
use crate::sender::{Registry, Sender, SenderFactory};
use nh_queue::{BatchHandle, Handle, MemoryQueue, Queue};

/// Owns every long-lived piece a Send/SendAsync call touches. Construct via
/// [`ClientBuilder`]; `close` should be called once on shutdown.
pub struct Client {
    registry: Arc<Registry>,
    router: Arc<Router>,
    dispatcher: Arc<Dispatcher>,
    queue: Arc<dyn Queue>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub async fn send(&self, message: Message) -> Result<Arc<Receipt>, Error> {
        self.dispatcher.send(message).await
    }

    pub async fn send_async(&self, message: Message) -> Result<Arc<Handle>, Error> {
        self.dispatcher.send_async(message).await
    }

    pub async fn send_batch(&self, messages: Vec<Message>) -> Result<Vec<Result<Arc<Receipt>, Error>>, Error> {
        self.dispatcher.send_batch(messages).await
    }

    pub async fn send_async_batch(&self, messages: Vec<Message>) -> Result<Arc<BatchHandle>, Error> {
        self.dispatcher.send_async_batch(messages).await
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Stop accepting new async work, join queue workers, and close every
    /// registered Sender exactly once.
    pub async fn close(&self) -> Result<(), Error> {
        self.queue.clone().stop().await;
        self.registry.close_all().await
    }
}

const DEFAULT_WORKER_COUNT: usize = 0; // 0 -> Queue picks its own default
const DEFAULT_QUEUE_CAPACITY: usize = 1000;
const DEFAULT_FANOUT_LIMIT: usize = 8;

pub struct ClientBuilder {
    registry: Registry,
    rules: Vec<RoutingRule>,
    strategy: Strategy,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    circuit_breaker_config: CircuitBreakerConfig,
    worker_count: usize,
    queue_capacity: usize,
    fanout_limit: usize,
    receipt_handlers: Vec<Arc<dyn ReceiptHandler>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            registry: Registry::new(),
            rules: Vec::new(),
            strategy: Strategy::Ml,
            retry_policy: None,
            circuit_breaker_config: CircuitBreakerConfig::default(),
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            fanout_limit: DEFAULT_FANOUT_LIMIT,
            receipt_handlers: vec![Arc::new(LoggingReceiptHandler)],
        }
    }
}

impl ClientBuilder {
    pub fn with_sender(self, name: impl Into<String>, sender: Arc<dyn Sender>) -> Result<Self, RouterError> {
        self.registry.register(name, sender)?;
        Ok(self)
    }

    pub fn with_sender_factory(
        self,
        name: impl Into<String>,
        factory: SenderFactory,
        config: &HashMap<String, Value>,
    ) -> Result<Self, RouterError> {
        self.registry.register_factory(name, factory, config)?;
        Ok(self)
    }

    pub fn with_routing_rule(mut self, rule: RoutingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_circuit_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker_config = config;
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_fanout_limit(mut self, limit: usize) -> Self {
        self.fanout_limit = limit;
        self
    }

    pub fn with_receipt_handler(mut self, handler: Arc<dyn ReceiptHandler>) -> Self {
        self.receipt_handlers.push(handler);
        self
    }

    /// Build the `Client`, starting its queue's worker pool. The returned
    /// `Arc<Client>` must be `close`d once the caller is done with it.
    pub async fn build(self) -> Arc<Client> {
        let registry = Arc::new(self.registry);
        let router = Arc::new(Router::new(registry.clone(), self.strategy));
        for rule in self.rules {
            router.add_routing_rule(rule);
        }

        let queue: Arc<dyn Queue> = MemoryQueue::with_capacity(self.queue_capacity);
        let retry_policy = self
            .retry_policy
            .unwrap_or_else(|| Arc::new(ExponentialBackoff::default()));

        let dispatcher = Arc::new(
            Dispatcher::new(registry.clone(), router.clone(), queue.clone(), retry_policy, self.receipt_handlers)
                .with_fanout_limit(self.fanout_limit)
                .with_circuit_breaker_config(self.circuit_breaker_config),
        );

        queue.clone().start(self.worker_count).await;

        Arc::new(Client {
            registry,
            router,
            dispatcher,
            queue,
        })
    }
}
