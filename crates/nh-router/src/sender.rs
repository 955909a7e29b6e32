//! The `Sender` (platform adapter) trait and its `Registry`.
//!
//! Grounded in `fc-common::FlowCatalystError`'s notion of a platform
//! boundary and `fc-router::mediator::Mediator`'s single-purpose `mediate`
//! method, generalized to the multi-target `Send` contract spec.md §4.4
//! requires. Per spec.md §9's REDESIGN FLAG, the `Registry` here is owned
//! by the `Client` instance that builds it — never a process-global
//! singleton.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use nh_common::model::{Format, Message, PlatformResult, Target, TargetType};
use nh_common::Error;
use serde_json::Value;

use crate::error::RouterError;

/// Static description of what a Sender supports, consulted by the Router
/// and by validation before a Send is attempted.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub supported_target_types: Vec<TargetType>,
    pub supported_formats: Vec<Format>,
    pub max_message_size: usize,
    pub supports_scheduling: bool,
    pub supports_attachments: bool,
    pub supports_mentions: bool,
    pub required_settings: Vec<String>,
}

/// A platform adapter. Implementors must never panic and must always
/// return exactly one [`PlatformResult`] per input target, in input order,
/// even when the whole batch errors wholesale.
#[async_trait]
pub trait Sender: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, msg: &Message, targets: &[Target]) -> Vec<PlatformResult>;

    fn validate_target(&self, target: &Target) -> Result<(), Error>;

    fn capabilities(&self) -> Capabilities;

    async fn is_healthy(&self) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// `(configMap) -> Sender` factory, the extension point spec.md §6
/// describes for externally-registered platform adapters.
pub type SenderFactory =
    Arc<dyn Fn(&HashMap<String, Value>) -> Result<Arc<dyn Sender>, Error> + Send + Sync>;

/// Name -> Sender mapping owned by one `Client`. Reads are lock-free after
/// registration (backed by `DashMap`, matching the teacher's choice of
/// concurrent map for independently-keyed state); writes only block the
/// specific shard being written.
#[derive(Default)]
pub struct Registry {
    senders: DashMap<String, Arc<dyn Sender>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            senders: DashMap::new(),
        }
    }

    /// Register a fully-constructed Sender under `name`. Idempotent when
    /// the same `Arc` pointer is registered again; fails when `name` is
    /// already bound to a *different* Sender instance.
    pub fn register(&self, name: impl Into<String>, sender: Arc<dyn Sender>) -> Result<(), RouterError> {
        let name = name.into();
        if let Some(existing) = self.senders.get(&name) {
            if Arc::ptr_eq(&existing, &sender) {
                return Ok(());
            }
            return Err(RouterError::DuplicateSender(name));
        }
        self.senders.insert(name, sender);
        Ok(())
    }

    /// Build a Sender via `factory(config)` and register it under `name`.
    pub fn register_factory(
        &self,
        name: impl Into<String>,
        factory: SenderFactory,
        config: &HashMap<String, Value>,
    ) -> Result<(), RouterError> {
        let name = name.into();
        let sender = factory(config).map_err(|e| RouterError::InvalidConfig(e.to_string()))?;
        self.register(name, sender)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Sender>> {
        self.senders.get(name).map(|entry| entry.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.senders.iter().map(|e| e.key().clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.senders.contains_key(name)
    }

    pub async fn close_all(&self) -> Result<(), Error> {
        // Each unique Sender instance is closed once, even if somehow
        // registered under two names (compare by pointer).
        let mut seen: Vec<*const ()> = Vec::new();
        for entry in self.senders.iter() {
            let sender = entry.value().clone();
            let ptr = Arc::as_ptr(&sender) as *const ();
            if seen.contains(&ptr) {
                continue;
            }
            seen.push(ptr);
            sender.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct NoopSender(&'static str);

    #[async_trait]
    impl Sender for NoopSender {
        fn name(&self) -> &str {
            self.0
        }

        async fn send(&self, _msg: &Message, targets: &[Target]) -> Vec<PlatformResult> {
            targets
                .iter()
                .map(|t| PlatformResult::success(self.0, t.canonical(), "ok", Duration::from_millis(1)))
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

    #[test]
    fn register_and_get_roundtrips() {
        let registry = Registry::new();
        let sender: Arc<dyn Sender> = Arc::new(NoopSender("mock"));
        registry.register("mock", sender.clone()).unwrap();
        assert!(registry.contains("mock"));
        assert_eq!(registry.get("mock").unwrap().name(), "mock");
    }

    #[test]
    fn register_same_pointer_twice_is_idempotent() {
        let registry = Registry::new();
        let sender: Arc<dyn Sender> = Arc::new(NoopSender("mock"));
        registry.register("mock", sender.clone()).unwrap();
        assert!(registry.register("mock", sender).is_ok());
    }

    #[test]
    fn register_different_sender_under_same_name_fails() {
        let registry = Registry::new();
        registry
            .register("mock", Arc::new(NoopSender("mock")) as Arc<dyn Sender>)
            .unwrap();
        let result = registry.register("mock", Arc::new(NoopSender("mock")) as Arc<dyn Sender>);
        assert!(matches!(result, Err(RouterError::DuplicateSender(_))));
    }
}
