//! Orchestrates validate -> route -> send -> aggregate for one [`Message`].
//!
//! Grounded in `fc-router::mediator::Mediator::dispatch`'s single-message
//! pipeline, generalized to fan out across the multiple platform buckets
//! `Router::route` produces and to retry each bucket independently.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use nh_common::model::{Message, PlatformResult, Receipt, Target};
use nh_common::{Error, ErrorCode};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::RouterError;
use crate::receipt_processor::ReceiptHandler;
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::router::Router;
use crate::sender::Registry;
use nh_queue::{BatchHandle, EnqueueOptions, Handle, Processor, Queue};

/// Text used for a circuit-open synthetic failure, tagged with the error
/// code a caller inspecting `PlatformResult::error` would expect per the
/// platform-unavailable-while-open contract.
fn circuit_open_message() -> String {
    format!("[{}] circuit open", ErrorCode::ResourceExhausted.tag())
}

const DEFAULT_FANOUT_LIMIT: usize = 8;

pub struct Dispatcher {
    registry: Arc<Registry>,
    router: Arc<Router>,
    queue: Arc<dyn Queue>,
    retry_policy: Arc<dyn RetryPolicy>,
    receipt_handlers: Vec<Arc<dyn ReceiptHandler>>,
    circuit_breakers: DashMap<String, Arc<CircuitBreaker>>,
    circuit_breaker_config: CircuitBreakerConfig,
    fanout_limit: usize,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        router: Arc<Router>,
        queue: Arc<dyn Queue>,
        retry_policy: Arc<dyn RetryPolicy>,
        receipt_handlers: Vec<Arc<dyn ReceiptHandler>>,
    ) -> Self {
        Self {
            registry,
            router,
            queue,
            retry_policy,
            receipt_handlers,
            circuit_breakers: DashMap::new(),
            circuit_breaker_config: CircuitBreakerConfig::default(),
            fanout_limit: DEFAULT_FANOUT_LIMIT,
        }
    }

    pub fn with_fanout_limit(mut self, limit: usize) -> Self {
        self.fanout_limit = limit.max(1);
        self
    }

    pub fn with_circuit_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker_config = config;
        self
    }

    fn circuit_breaker_for(&self, platform: &str) -> Arc<CircuitBreaker> {
        self.circuit_breakers
            .entry(platform.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::from_config(self.circuit_breaker_config)))
            .clone()
    }

    /// Synchronous Send: validate, route, fan out per platform bucket
    /// (bounded, order-preserving), aggregate into one Receipt.
    pub async fn send(&self, message: Message) -> Result<Arc<Receipt>, Error> {
        message.validate()?;
        let targets = message.targets.clone();
        let receipt = self.dispatch(message, targets).await?;
        let receipt = Arc::new(receipt);
        self.run_receipt_handlers(&receipt);
        Ok(receipt)
    }

    /// Async Send: validate eagerly, then hand the rest of the pipeline to
    /// the queue's worker pool. Returns as soon as the item is accepted.
    pub async fn send_async(self: &Arc<Self>, message: Message) -> Result<Arc<Handle>, Error> {
        message.validate()?;
        if message.targets.is_empty() {
            return Err(RouterError::NoTargets.into());
        }
        let targets = message.targets.clone();
        let processor = self.processor();
        self.queue
            .enqueue_with_processor(message, targets, processor, EnqueueOptions::default())
            .await
            .map_err(Into::into)
    }

    pub async fn send_batch(&self, messages: Vec<Message>) -> Result<Vec<Result<Arc<Receipt>, Error>>, Error> {
        for message in &messages {
            message.validate()?;
        }
        let limit = self.fanout_limit;
        let results = stream::iter(messages)
            .map(|message| {
                let targets = message.targets.clone();
                async move {
                    let receipt = self.dispatch(message, targets).await?;
                    let receipt = Arc::new(receipt);
                    self.run_receipt_handlers(&receipt);
                    Ok(receipt)
                }
            })
            .buffered(limit)
            .collect::<Vec<_>>()
            .await;
        Ok(results)
    }

    pub async fn send_async_batch(self: &Arc<Self>, messages: Vec<Message>) -> Result<Arc<BatchHandle>, Error> {
        for message in &messages {
            message.validate()?;
            if message.targets.is_empty() {
                return Err(RouterError::NoTargets.into());
            }
        }
        let pairs: Vec<(Message, Vec<Target>)> =
            messages.into_iter().map(|m| (m.clone(), m.targets.clone())).collect();
        let processor = self.processor();
        self.queue
            .enqueue_batch(pairs, processor, EnqueueOptions::default())
            .await
            .map_err(Into::into)
    }

    /// Build the closure the queue invokes once per dequeued item. Captures
    /// an `Arc<Self>` clone so the processor outlives the call that created it.
    /// Runs the same receipt-handler chain the synchronous `send`/`send_batch`
    /// paths run, so async sends observe identical logging/metrics.
    fn processor(self: &Arc<Self>) -> Processor {
        let dispatcher = self.clone();
        Arc::new(move |message, targets| {
            let dispatcher = dispatcher.clone();
            Box::pin(async move {
                let receipt = dispatcher.dispatch(message, targets).await?;
                dispatcher.run_receipt_handlers(&receipt);
                Ok(receipt)
            })
        })
    }

    /// Core pipeline: route `targets`, send each platform bucket, aggregate
    /// into one Receipt. Does not validate the message or run receipt
    /// handlers — callers (`send`/the queue processor) own those.
    async fn dispatch(&self, message: Message, targets: Vec<Target>) -> Result<Receipt, Error> {
        if targets.is_empty() {
            return Err(RouterError::NoTargets.into());
        }
        let buckets = self.router.route(&targets).map_err(Error::from)?;

        let receipt = Receipt::new(message.id.clone());
        receipt.mark_processing();

        let limit = self.fanout_limit;
        let bucket_results: Vec<Vec<PlatformResult>> = stream::iter(buckets)
            .map(|(platform, bucket_targets)| {
                let message = &message;
                async move { self.send_to_platform(&platform, message, &bucket_targets).await }
            })
            .buffered(limit)
            .collect::<Vec<_>>()
            .await;

        for results in bucket_results {
            for result in results {
                receipt.add_result(result);
            }
        }

        Ok(receipt)
    }

    /// Send one platform's target bucket, retrying the whole bucket while
    /// every result in it is a failure and the retry policy allows it.
    /// Never returns an `Err`: a platform that can't be reached at all
    /// (unregistered, circuit open, or a panicking Sender) yields synthetic
    /// failed [`PlatformResult`]s instead, one per target, in input order.
    async fn send_to_platform(&self, platform: &str, message: &Message, targets: &[Target]) -> Vec<PlatformResult> {
        let Some(sender) = self.registry.get(platform) else {
            return targets
                .iter()
                .map(|t| PlatformResult::failure(platform, t.canonical(), "sender not registered", Duration::ZERO))
                .collect();
        };

        let breaker = self.circuit_breaker_for(platform);
        if !breaker.allow_request() {
            return targets
                .iter()
                .map(|t| PlatformResult::failure(platform, t.canonical(), circuit_open_message(), Duration::ZERO))
                .collect();
        }

        // `execute_with_retry` only carries a terminal `Error` on failure, but
        // callers need the actual per-target results (each with its own
        // failure text), so the last attempt's results are stashed here and
        // returned whether the retry loop ends in success or exhaustion.
        let mut last_results: Vec<PlatformResult> = Vec::new();
        let outcome = execute_with_retry(self.retry_policy.as_ref(), |_attempt| {
            let sender = &sender;
            let breaker = &breaker;
            let last_results = &mut last_results;
            async move {
                let start = Instant::now();
                let results = match std::panic::AssertUnwindSafe(sender.send(message, targets))
                    .catch_unwind()
                    .await
                {
                    Ok(results) => results,
                    Err(_) => {
                        tracing::error!(platform, "sender panicked");
                        targets
                            .iter()
                            .map(|t| PlatformResult::failure(platform, t.canonical(), "sender panicked", Duration::ZERO))
                            .collect()
                    }
                };
                let elapsed = start.elapsed();

                let all_failed = !results.is_empty() && results.iter().all(|r| !r.success);
                self.router.update_platform_health(platform, !all_failed, elapsed);
                if all_failed {
                    breaker.record_failure();
                } else {
                    breaker.record_success();
                }

                let message_txt = results
                    .first()
                    .and_then(|r| r.error.clone())
                    .unwrap_or_else(|| "platform send failed".to_string());
                *last_results = results.clone();

                if all_failed {
                    Err(Error::new(ErrorCode::PlatformUnavailable, message_txt)
                        .with_platform(platform)
                        .with_retryable(true))
                } else {
                    Ok(results)
                }
            }
        })
        .await;

        match outcome {
            Ok(results) => results,
            Err(_) => last_results,
        }
    }

    fn run_receipt_handlers(&self, receipt: &Receipt) {
        for handler in &self.receipt_handlers {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler.handle(receipt))).is_err() {
                tracing::warn!("receipt handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::FixedDelay;
    use crate::router::{RoutingRule, Strategy};
    use crate::sender::{Capabilities, Sender};
    use async_trait::async_trait;
    use nh_common::model::{Message, Target, TargetType};
    use nh_queue::MemoryQueue;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySender {
        name: &'static str,
        fail_times: AtomicU32,
    }

    #[async_trait]
    impl Sender for FlakySender {
        fn name(&self) -> &str {
            self.name
        }
        async fn send(&self, _msg: &Message, targets: &[Target]) -> Vec<PlatformResult> {
            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                targets
                    .iter()
                    .map(|t| PlatformResult::failure(self.name, t.canonical(), "temporary failure", Duration::from_millis(1)))
                    .collect()
            } else {
                targets
                    .iter()
                    .map(|t| PlatformResult::success(self.name, t.canonical(), "id", Duration::from_millis(1)))
                    .collect()
            }
        }
        fn validate_target(&self, _t: &Target) -> Result<(), Error> {
            Ok(())
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        async fn is_healthy(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    fn build_dispatcher(sender_fail_times: u32) -> (Arc<Dispatcher>, Arc<dyn Queue>) {
        let registry = Arc::new(Registry::new());
        registry
            .register(
                "email",
                Arc::new(FlakySender {
                    name: "email",
                    fail_times: AtomicU32::new(sender_fail_times),
                }),
            )
            .unwrap();
        let router = Arc::new(Router::new(registry.clone(), Strategy::RoundRobin));
        router.add_routing_rule(RoutingRule {
            target_type: TargetType::Email,
            primary_platforms: vec!["email".into()],
            fallback_platforms: vec![],
        });
        let queue: Arc<dyn Queue> = MemoryQueue::with_capacity(16);
        let retry_policy: Arc<dyn RetryPolicy> = Arc::new(FixedDelay {
            delay: Duration::from_millis(1),
            max_attempts: 5,
        });
        let dispatcher = Arc::new(Dispatcher::new(registry, router, queue.clone(), retry_policy, vec![]));
        (dispatcher, queue)
    }

    fn build_dispatcher_with_handlers(
        sender_fail_times: u32,
        receipt_handlers: Vec<Arc<dyn ReceiptHandler>>,
    ) -> (Arc<Dispatcher>, Arc<dyn Queue>) {
        let registry = Arc::new(Registry::new());
        registry
            .register(
                "email",
                Arc::new(FlakySender {
                    name: "email",
                    fail_times: AtomicU32::new(sender_fail_times),
                }),
            )
            .unwrap();
        let router = Arc::new(Router::new(registry.clone(), Strategy::RoundRobin));
        router.add_routing_rule(RoutingRule {
            target_type: TargetType::Email,
            primary_platforms: vec!["email".into()],
            fallback_platforms: vec![],
        });
        let queue: Arc<dyn Queue> = MemoryQueue::with_capacity(16);
        let retry_policy: Arc<dyn RetryPolicy> = Arc::new(FixedDelay {
            delay: Duration::from_millis(1),
            max_attempts: 5,
        });
        let dispatcher = Arc::new(Dispatcher::new(registry, router, queue.clone(), retry_policy, receipt_handlers));
        (dispatcher, queue)
    }

    #[tokio::test]
    async fn send_succeeds_and_produces_one_result_per_target() {
        let (dispatcher, _queue) = build_dispatcher(0);
        let target = Target::new(TargetType::Email, "a@example.com", None).unwrap();
        let message = Message::builder().title("hi").body("body").target(target).build().unwrap();
        let receipt = dispatcher.send(message).await.unwrap();
        assert_eq!(receipt.total(), 1);
        assert_eq!(receipt.successful(), 1);
    }

    #[tokio::test]
    async fn send_retries_then_succeeds() {
        let (dispatcher, _queue) = build_dispatcher(2);
        let target = Target::new(TargetType::Email, "a@example.com", None).unwrap();
        let message = Message::builder().title("hi").body("body").target(target).build().unwrap();
        let receipt = dispatcher.send(message).await.unwrap();
        assert_eq!(receipt.successful(), 1);
        assert_eq!(receipt.failed(), 0);
    }

    #[tokio::test]
    async fn send_fails_every_target_when_platform_unregistered() {
        let (dispatcher, _queue) = build_dispatcher(0);
        let target = Target::new(TargetType::Webhook, "https://example.com/hook", None).unwrap();
        let message = Message::builder().title("hi").body("body").target(target).build().unwrap();
        let receipt = dispatcher.send(message).await.unwrap();
        assert_eq!(receipt.failed(), 1);
    }

    #[tokio::test]
    async fn send_async_completes_via_the_queue() {
        let (dispatcher, queue) = build_dispatcher(0);
        queue.clone().start(2).await;
        let target = Target::new(TargetType::Email, "a@example.com", None).unwrap();
        let message = Message::builder().title("hi").body("body").target(target).build().unwrap();
        let handle = dispatcher.send_async(message).await.unwrap();
        let outcome = handle.result().await;
        assert!(outcome.is_success());
        queue.clone().stop().await;
    }

    #[tokio::test]
    async fn send_async_runs_receipt_handlers_on_completion() {
        struct CountingHandler(AtomicU32);
        impl ReceiptHandler for CountingHandler {
            fn handle(&self, _receipt: &Receipt) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let handler = Arc::new(CountingHandler(AtomicU32::new(0)));
        let (dispatcher, queue) = build_dispatcher_with_handlers(0, vec![handler.clone()]);
        queue.clone().start(2).await;
        let target = Target::new(TargetType::Email, "a@example.com", None).unwrap();
        let message = Message::builder().title("hi").body("body").target(target).build().unwrap();
        let handle = dispatcher.send_async(message).await.unwrap();
        let outcome = handle.result().await;
        assert!(outcome.is_success());
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
        queue.clone().stop().await;
    }

    #[tokio::test]
    async fn send_batch_preserves_input_order() {
        let (dispatcher, _queue) = build_dispatcher(0);
        let messages = (0..4)
            .map(|i| {
                let target = Target::new(TargetType::Email, format!("user{i}@example.com"), None).unwrap();
                Message::builder().title(format!("m{i}")).body("b").target(target).build().unwrap()
            })
            .collect::<Vec<_>>();
        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        let results = dispatcher.send_batch(messages).await.unwrap();
        let got_ids: Vec<String> = results
            .into_iter()
            .map(|r| r.unwrap().message_id.clone())
            .collect();
        assert_eq!(got_ids, ids);
    }
}
