//! Target -> platform resolution, health tracking, and load balancing.
//!
//! Grounded in `fc-router::health::HealthService`'s rolling-window health
//! model (reduced here to an EWMA response-time average plus a
//! consecutive-failure counter, since the per-target-type scored routing
//! spec.md describes has no FlowCatalyst counterpart and is built fresh
//! from spec.md §4.5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use nh_common::model::{PlatformHealth, Target, TargetType};
use parking_lot::RwLock;

use crate::error::RouterError;
use crate::sender::Registry;

/// Load-balancing strategy consulted when a target's type maps to more than
/// one primary platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    Random,
    Weighted,
    Ml,
}

/// Maps a target type to an ordered list of primary and fallback platforms.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub target_type: TargetType,
    pub primary_platforms: Vec<String>,
    pub fallback_platforms: Vec<String>,
}

const DEFAULT_CIRCUIT_BREAKER_THRESHOLD: u32 = 5;
const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub struct Router {
    registry: std::sync::Arc<Registry>,
    rules: RwLock<HashMap<TargetType, RoutingRule>>,
    health: DashMap<String, PlatformHealth>,
    in_flight: DashMap<String, AtomicU64>,
    round_robin_counters: DashMap<TargetType, AtomicU64>,
    strategy: Strategy,
    circuit_breaker_threshold: u32,
    health_check_interval: Duration,
}

impl Router {
    pub fn new(registry: std::sync::Arc<Registry>, strategy: Strategy) -> Self {
        Self {
            registry,
            rules: RwLock::new(HashMap::new()),
            health: DashMap::new(),
            in_flight: DashMap::new(),
            round_robin_counters: DashMap::new(),
            strategy,
            circuit_breaker_threshold: DEFAULT_CIRCUIT_BREAKER_THRESHOLD,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
        }
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn add_routing_rule(&self, rule: RoutingRule) {
        self.rules.write().insert(rule.target_type, rule);
    }

    pub fn set_platform_weight(&self, platform: &str, weight: u32) {
        self.health.entry(platform.to_string()).or_default().weight = weight;
    }

    pub fn get_platform_health(&self) -> HashMap<String, PlatformHealth> {
        self.health.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    /// Exponentially-weighted response-time average; resets the
    /// consecutive-fail counter on any success; marks Unhealthy once
    /// consecutive fails reach the configured threshold.
    pub fn update_platform_health(&self, platform: &str, healthy: bool, response_time: Duration) {
        let mut entry = self.health.entry(platform.to_string()).or_default();
        let sample_ms = response_time.as_millis() as f64;
        let prev_ms = entry.last_response_time.as_millis() as f64;
        let new_avg_ms = if prev_ms == 0.0 { sample_ms } else { 0.9 * prev_ms + 0.1 * sample_ms };
        entry.last_response_time = Duration::from_millis(new_avg_ms as u64);
        entry.last_check_at = Utc::now();

        if healthy {
            entry.success_count += 1;
            entry.consecutive_fails = 0;
            entry.healthy = true;
        } else {
            entry.failure_count += 1;
            entry.consecutive_fails += 1;
            if entry.consecutive_fails >= self.circuit_breaker_threshold {
                entry.healthy = false;
            }
        }
    }

    pub fn mark_in_flight(&self, platform: &str) {
        self.in_flight.entry(platform.to_string()).or_default().fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_done(&self, platform: &str) {
        if let Some(counter) = self.in_flight.get(platform) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn in_flight_count(&self, platform: &str) -> u64 {
        self.in_flight.get(platform).map(|c| c.load(Ordering::SeqCst)).unwrap_or(0)
    }

    fn is_platform_healthy(&self, platform: &str) -> bool {
        self.health.get(platform).map(|h| h.healthy).unwrap_or(true)
    }

    /// Is a re-check allowed for an unhealthy platform (the probe window
    /// has elapsed)? Does not itself flip the health flag — the caller's
    /// subsequent `update_platform_health` result does that.
    pub fn is_probe_due(&self, platform: &str) -> bool {
        match self.health.get(platform) {
            None => true,
            Some(h) if h.healthy => true,
            Some(h) => Utc::now().signed_duration_since(h.last_check_at).num_milliseconds() as u64
                >= self.health_check_interval.as_millis() as u64,
        }
    }

    fn score(&self, platform: &str) -> f64 {
        let health = self.health.get(platform);
        let (healthy, success_rate, avg_ms, consecutive_fails) = match health {
            Some(h) => (h.healthy, h.success_rate(), h.last_response_time.as_millis() as f64, h.consecutive_fails),
            None => (true, 1.0, 0.0, 0),
        };
        0.4 * if healthy { 1.0 } else { 0.0 }
            + 0.3 * success_rate
            + 0.2 * (1.0 - (avg_ms / 5000.0).min(1.0))
            + 0.1 * (1.0 / (1.0 + consecutive_fails as f64))
    }

    fn pick_by_strategy(&self, target_type: TargetType, candidates: &[String]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        if candidates.len() == 1 {
            return Some(candidates[0].clone());
        }
        match self.strategy {
            Strategy::RoundRobin => {
                let counter = self.round_robin_counters.entry(target_type).or_default();
                let idx = counter.fetch_add(1, Ordering::SeqCst) as usize % candidates.len();
                Some(candidates[idx].clone())
            }
            Strategy::Random => {
                let idx = rand::random::<usize>() % candidates.len();
                Some(candidates[idx].clone())
            }
            Strategy::Weighted => {
                let weights: Vec<u32> = candidates
                    .iter()
                    .map(|p| self.health.get(p).map(|h| h.weight.max(1)).unwrap_or(1))
                    .collect();
                let total: u32 = weights.iter().sum();
                let mut pick = rand::random::<u32>() % total.max(1);
                for (platform, weight) in candidates.iter().zip(weights.iter()) {
                    if pick < *weight {
                        return Some(platform.clone());
                    }
                    pick -= weight;
                }
                Some(candidates[candidates.len() - 1].clone())
            }
            Strategy::Ml => {
                let mut scored: Vec<(&String, f64, u64)> = candidates
                    .iter()
                    .map(|p| (p, self.score(p), self.in_flight_count(p)))
                    .collect();
                scored.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap()
                        .then_with(|| a.2.cmp(&b.2))
                        .then_with(|| a.0.cmp(b.0))
                });
                scored.first().map(|(p, _, _)| (*p).clone())
            }
        }
    }

    fn resolve_one(&self, target: &Target) -> Option<String> {
        if let Some(platform) = &target.platform {
            if self.registry.contains(platform) {
                return Some(platform.clone());
            }
            return None;
        }

        let rules = self.rules.read();
        let rule = rules.get(&target.target_type)?;

        let healthy_primaries: Vec<String> = rule
            .primary_platforms
            .iter()
            .filter(|p| self.registry.contains(p) && (self.is_platform_healthy(p) || self.is_probe_due(p)))
            .cloned()
            .collect();

        if let Some(platform) = self.pick_by_strategy(target.target_type, &healthy_primaries) {
            return Some(platform);
        }

        rule.fallback_platforms
            .iter()
            .find(|p| self.registry.contains(*p))
            .cloned()
    }

    /// Group targets by resolved platform. Returns the buckets in
    /// first-seen-platform order, preserving input-target order within
    /// each bucket — the deterministic ordering §4.6 requires downstream.
    /// A partial routing is never returned: if any target is unroutable,
    /// the whole call fails listing every unroutable target.
    pub fn route(&self, targets: &[Target]) -> Result<Vec<(String, Vec<Target>)>, RouterError> {
        if targets.is_empty() {
            return Err(RouterError::NoTargets);
        }

        let mut order: Vec<String> = Vec::new();
        let mut buckets: HashMap<String, Vec<Target>> = HashMap::new();
        let mut unroutable = Vec::new();

        for target in targets {
            match self.resolve_one(target) {
                Some(platform) => {
                    if !buckets.contains_key(&platform) {
                        order.push(platform.clone());
                    }
                    buckets.entry(platform).or_default().push(target.clone());
                }
                None => unroutable.push(target.canonical()),
            }
        }

        if !unroutable.is_empty() {
            return Err(RouterError::Unroutable(unroutable));
        }

        Ok(order
            .into_iter()
            .map(|platform| {
                let targets = buckets.remove(&platform).unwrap_or_default();
                (platform, targets)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::Sender;
    use async_trait::async_trait;
    use nh_common::model::{Format, Message, PlatformResult};
    use std::sync::Arc;

    struct Noop(&'static str);

    #[async_trait]
    impl Sender for Noop {
        fn name(&self) -> &str {
            self.0
        }
        async fn send(&self, _msg: &Message, targets: &[Target]) -> Vec<PlatformResult> {
            targets
                .iter()
                .map(|t| PlatformResult::success(self.0, t.canonical(), "ok", Duration::from_millis(1)))
                .collect()
        }
        fn validate_target(&self, _t: &Target) -> Result<(), nh_common::Error> {
            Ok(())
        }
        fn capabilities(&self) -> crate::sender::Capabilities {
            crate::sender::Capabilities::default()
        }
        async fn is_healthy(&self) -> Result<(), nh_common::Error> {
            Ok(())
        }
    }

    fn registry_with(names: &[&str]) -> Arc<Registry> {
        let registry = Registry::new();
        for name in names {
            registry.register(*name, Arc::new(Noop(Box::leak(name.to_string().into_boxed_str())))).unwrap();
        }
        Arc::new(registry)
    }

    #[test]
    fn explicit_platform_wins_when_registered() {
        let registry = registry_with(&["email"]);
        let router = Router::new(registry, Strategy::RoundRobin);
        let target = Target::new(TargetType::Email, "a@x.com", Some("email".into())).unwrap();
        let grouped = router.route(&[target.clone()]).unwrap();
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].0, "email");
        assert_eq!(grouped[0].1, vec![target]);
    }

    #[test]
    fn unroutable_target_fails_the_whole_call() {
        let registry = registry_with(&[]);
        let router = Router::new(registry, Strategy::RoundRobin);
        let target = Target::new(TargetType::Email, "a@x.com", None).unwrap();
        let result = router.route(&[target]);
        assert!(matches!(result, Err(RouterError::Unroutable(_))));
    }

    #[test]
    fn round_robin_cycles_through_healthy_primaries() {
        let registry = registry_with(&["a", "b"]);
        let router = Router::new(registry, Strategy::RoundRobin);
        router.add_routing_rule(RoutingRule {
            target_type: TargetType::Webhook,
            primary_platforms: vec!["a".into(), "b".into()],
            fallback_platforms: vec![],
        });

        let t1 = Target::new(TargetType::Webhook, "1", None).unwrap();
        let t2 = Target::new(TargetType::Webhook, "2", None).unwrap();
        let first = router.route(&[t1]).unwrap()[0].0.clone();
        let second = router.route(&[t2]).unwrap()[0].0.clone();
        assert_ne!(first, second);
    }

    #[test]
    fn falls_back_when_no_primary_is_healthy() {
        let registry = registry_with(&["a", "fallback"]);
        let router = Router::new(registry, Strategy::RoundRobin);
        router.add_routing_rule(RoutingRule {
            target_type: TargetType::Webhook,
            primary_platforms: vec!["a".into()],
            fallback_platforms: vec!["fallback".into()],
        });
        router.update_platform_health("a", false, Duration::from_millis(10));
        router.update_platform_health("a", false, Duration::from_millis(10));
        router.update_platform_health("a", false, Duration::from_millis(10));
        router.update_platform_health("a", false, Duration::from_millis(10));
        router.update_platform_health("a", false, Duration::from_millis(10));

        let t = Target::new(TargetType::Webhook, "1", None).unwrap();
        let grouped = router.route(&[t]).unwrap();
        assert_eq!(grouped[0].0, "fallback");
    }

    #[test]
    fn ml_strategy_prefers_healthier_platform() {
        let registry = registry_with(&["good", "bad"]);
        let router = Router::new(registry, Strategy::Ml);
        router.add_routing_rule(RoutingRule {
            target_type: TargetType::Webhook,
            primary_platforms: vec!["good".into(), "bad".into()],
            fallback_platforms: vec![],
        });
        for _ in 0..3 {
            router.update_platform_health("good", true, Duration::from_millis(20));
        }
        router.update_platform_health("bad", true, Duration::from_millis(20));
        router.update_platform_health("bad", false, Duration::from_millis(4000));
        router.update_platform_health("bad", false, Duration::from_millis(4000));

        let t = Target::new(TargetType::Webhook, "1", None).unwrap();
        let grouped = router.route(&[t]).unwrap();
        assert_eq!(grouped[0].0, "good");
    }

    #[test]
    fn unhealthy_primary_becomes_a_probe_candidate_once_its_window_elapses() {
        let registry = registry_with(&["a"]);
        let router = Router::new(registry, Strategy::RoundRobin).with_health_check_interval(Duration::from_millis(0));
        router.add_routing_rule(RoutingRule {
            target_type: TargetType::Webhook,
            primary_platforms: vec!["a".into()],
            fallback_platforms: vec![],
        });
        for _ in 0..5 {
            router.update_platform_health("a", false, Duration::from_millis(10));
        }
        assert!(!router.is_platform_healthy("a"));

        // The health-check window has already elapsed (it's zero), so "a"
        // is offered again as a probe candidate instead of being shed for good.
        let t = Target::new(TargetType::Webhook, "1", None).unwrap();
        let grouped = router.route(&[t]).unwrap();
        assert_eq!(grouped[0].0, "a");
    }

    #[test]
    fn update_platform_health_resets_consecutive_fails_on_success() {
        let registry = registry_with(&["a"]);
        let router = Router::new(registry, Strategy::RoundRobin);
        router.update_platform_health("a", false, Duration::from_millis(10));
        router.update_platform_health("a", false, Duration::from_millis(10));
        router.update_platform_health("a", true, Duration::from_millis(10));
        let health = router.get_platform_health();
        assert_eq!(health["a"].consecutive_fails, 0);
    }
}
