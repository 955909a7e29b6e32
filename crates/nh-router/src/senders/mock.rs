//! In-memory deterministic [`Sender`], useful for tests and local dev.
//!
//! Grounded in the `dispatch_to_channel` pattern from the notification
//! dispatch reference sample: route by target value into an in-process
//! mailbox instead of a real transport.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use nh_common::model::{Message, PlatformResult, Target};
use nh_common::Error;

use crate::sender::{Capabilities, Sender};

/// One delivered message, as recorded by [`MockSender`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub target: String,
    pub title: String,
    pub body: String,
}

/// A [`Sender`] that "delivers" by recording into an in-memory mailbox,
/// keyed by target value. Targets in `failing_targets` always fail.
pub struct MockSender {
    name: String,
    latency: Duration,
    mailbox: DashMap<String, Vec<Delivery>>,
    failing_targets: DashMap<String, ()>,
}

impl MockSender {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency: Duration::ZERO,
            mailbox: DashMap::new(),
            failing_targets: DashMap::new(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Mark a target value as always failing, for exercising retry/failure
    /// paths in tests without a real transport.
    pub fn fail_target(&self, value: impl Into<String>) {
        self.failing_targets.insert(value.into(), ());
    }

    pub fn deliveries_for(&self, target: &str) -> Vec<Delivery> {
        self.mailbox.get(target).map(|e| e.clone()).unwrap_or_default()
    }

    pub fn total_deliveries(&self) -> usize {
        self.mailbox.iter().map(|e| e.value().len()).sum()
    }
}

#[async_trait]
impl Sender for MockSender {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &Message, targets: &[Target]) -> Vec<PlatformResult> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        targets
            .iter()
            .map(|target| {
                if self.failing_targets.contains_key(&target.value) {
                    PlatformResult::failure(self.name(), target.canonical(), "target marked as failing", self.latency)
                } else {
                    self.mailbox.entry(target.value.clone()).or_default().push(Delivery {
                        message_id: message.id.clone(),
                        target: target.value.clone(),
                        title: message.title.clone(),
                        body: message.body.clone(),
                    });
                    PlatformResult::success(self.name(), target.canonical(), message.id.clone(), self.latency)
                }
            })
            .collect()
    }

    fn validate_target(&self, _target: &Target) -> Result<(), Error> {
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn is_healthy(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nh_common::model::TargetType;

    #[tokio::test]
    async fn delivers_and_records_by_target_value() {
        let sender = MockSender::new("mock");
        let message = Message::builder().title("hi").body("body").build().unwrap();
        let target = Target::new(TargetType::Email, "a@example.com", None).unwrap();
        let results = sender.send(&message, &[target]).await;
        assert!(results[0].success);
        assert_eq!(sender.deliveries_for("a@example.com").len(), 1);
    }

    #[tokio::test]
    async fn failing_target_always_fails() {
        let sender = MockSender::new("mock");
        sender.fail_target("bad@example.com");
        let message = Message::builder().title("hi").body("body").build().unwrap();
        let target = Target::new(TargetType::Email, "bad@example.com", None).unwrap();
        let results = sender.send(&message, &[target]).await;
        assert!(!results[0].success);
    }
}
