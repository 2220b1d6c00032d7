//! Load balancer module
//!
//! This module selects one healthy instance of a service per outbound call.
//! Selection policies are pluggable:
//! - Round Robin: cycles through healthy instances with a per-service cursor
//! - Random: selects a random healthy instance
//! - Least Connections: selects the instance with the fewest in-flight requests

use crate::config::{BalancerConfig, LoadBalancerPolicy};
use crate::error::{GatewayError, GatewayResult};
use crate::registry::{InstanceKey, ServiceInstance, SharedRegistry};
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Tracks in-flight requests per instance. Idle instances hold no entry.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    counts: Arc<DashMap<InstanceKey, usize>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one in-flight request against `key` until the guard is dropped
    pub fn acquire(&self, key: &InstanceKey) -> ConnectionGuard {
        *self.counts.entry(key.clone()).or_insert(0) += 1;
        ConnectionGuard {
            counts: self.counts.clone(),
            key: key.clone(),
        }
    }

    pub fn in_flight(&self, key: &InstanceKey) -> usize {
        self.counts.get(key).map(|c| *c).unwrap_or(0)
    }
}

/// Releases its in-flight slot on drop, including when the request future is cancelled
#[derive(Debug)]
pub struct ConnectionGuard {
    counts: Arc<DashMap<InstanceKey, usize>>,
    key: InstanceKey,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counts.remove_if_mut(&self.key, |_, count| {
            *count -= 1;
            *count == 0
        });
    }
}

/// The instance chosen for one request
#[derive(Debug)]
pub struct RoutingDecision {
    pub service_name: String,
    pub instance: ServiceInstance,
    _guard: ConnectionGuard,
}

/// A pluggable instance selection policy
pub trait SelectionPolicy: Send + Sync {
    /// Index into `candidates` (never empty) of the preferred instance
    fn pick(
        &self,
        service_name: &str,
        candidates: &[&ServiceInstance],
        connections: &ConnectionTracker,
    ) -> usize;

    fn name(&self) -> &'static str;
}

/// Round-robin with one monotonically advancing cursor per service name
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    fn advance(&self, service_name: &str) -> usize {
        if let Some(cursor) = self.cursors.get(service_name) {
            return cursor.fetch_add(1, Ordering::SeqCst);
        }
        self.cursors
            .entry(service_name.to_string())
            .or_default()
            .fetch_add(1, Ordering::SeqCst)
    }
}

impl SelectionPolicy for RoundRobin {
    fn pick(&self, service_name: &str, candidates: &[&ServiceInstance], _: &ConnectionTracker) -> usize {
        self.advance(service_name) % candidates.len()
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[derive(Debug, Default)]
pub struct Random;

impl SelectionPolicy for Random {
    fn pick(&self, _: &str, candidates: &[&ServiceInstance], _: &ConnectionTracker) -> usize {
        rand::thread_rng().gen_range(0..candidates.len())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Fewest in-flight requests wins; ties go to the earliest candidate
#[derive(Debug, Default)]
pub struct LeastConnections;

impl SelectionPolicy for LeastConnections {
    fn pick(&self, _: &str, candidates: &[&ServiceInstance], connections: &ConnectionTracker) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, instance)| connections.in_flight(&instance.key()))
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

/// Create the policy for a configured strategy
pub fn create_policy(policy: LoadBalancerPolicy) -> Arc<dyn SelectionPolicy> {
    match policy {
        LoadBalancerPolicy::RoundRobin => Arc::new(RoundRobin::new()),
        LoadBalancerPolicy::Random => Arc::new(Random),
        LoadBalancerPolicy::LeastConnections => Arc::new(LeastConnections),
    }
}

/// Selects instances from the registry using a selection policy
pub struct LoadBalancer {
    registry: SharedRegistry,
    policy: Arc<dyn SelectionPolicy>,
    connections: ConnectionTracker,
}

impl LoadBalancer {
    pub fn new(registry: SharedRegistry, policy: Arc<dyn SelectionPolicy>) -> Self {
        Self {
            registry,
            policy,
            connections: ConnectionTracker::new(),
        }
    }

    pub fn from_config(registry: SharedRegistry, config: &BalancerConfig) -> Self {
        Self::new(registry, create_policy(config.policy))
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn in_flight(&self, key: &InstanceKey) -> usize {
        self.connections.in_flight(key)
    }

    /// Select a healthy instance of `service_name`
    pub fn select(&self, service_name: &str) -> GatewayResult<RoutingDecision> {
        self.select_excluding(service_name, &[])
    }

    /// Select a healthy instance of `service_name` that is not in `excluded`.
    ///
    /// Fails with [`GatewayError::NoAvailableInstance`] when no instance is left.
    pub fn select_excluding(
        &self,
        service_name: &str,
        excluded: &[InstanceKey],
    ) -> GatewayResult<RoutingDecision> {
        let snapshot = self.registry.list_healthy(service_name);
        let candidates: Vec<&ServiceInstance> = snapshot
            .iter()
            .filter(|instance| {
                excluded.is_empty() || !excluded.iter().any(|key| *key == instance.key())
            })
            .collect();

        self.choose(service_name, &candidates)
    }

    fn choose(
        &self,
        service_name: &str,
        candidates: &[&ServiceInstance],
    ) -> GatewayResult<RoutingDecision> {
        if candidates.is_empty() {
            debug!(service = %service_name, "No healthy candidates");
            return Err(no_available(service_name));
        }

        let start = self.policy.pick(service_name, candidates, &self.connections);

        // The snapshot may be stale: walk forward past instances that went unhealthy
        for offset in 0..candidates.len() {
            let candidate = candidates[(start + offset) % candidates.len()];
            let key = candidate.key();
            if !self.registry.is_healthy(&key) {
                debug!(instance = %key, "Skipping instance that became unhealthy");
                continue;
            }

            debug!(
                service = %service_name,
                instance = %candidate.authority(),
                policy = self.policy.name(),
                "Selected instance"
            );
            return Ok(RoutingDecision {
                service_name: service_name.to_string(),
                instance: candidate.clone(),
                _guard: self.connections.acquire(&key),
            });
        }

        Err(no_available(service_name))
    }
}

fn no_available(service_name: &str) -> GatewayError {
    GatewayError::NoAvailableInstance {
        service: service_name.to_string(),
    }
}
