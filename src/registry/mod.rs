//! Instance registry
//!
//! Holds the live set of backend instances per logical service, with their
//! health state. Each service group is guarded by its own lock so updates to
//! one service never contend with another. Groups are stored copy-on-write:
//! readers take an `Arc` of the current list and keep a stable view even while
//! writers replace it.

use crate::error::{GatewayError, GatewayResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One network-addressable backend endpoint of a service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInstance {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub healthy: bool,
    pub last_seen: DateTime<Utc>,
    /// When the instance last went from healthy to unhealthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhealthy_since: Option<DateTime<Utc>>,
}

impl ServiceInstance {
    /// Create a healthy instance seen now
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
            healthy: true,
            last_seen: Utc::now(),
            unhealthy_since: None,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            service_name: self.service_name.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// `host:port`, as used in the outbound URI and Host header
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn same_address(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host == host
    }
}

/// Identity of an instance: service name plus address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub service_name: String,
    pub host: String,
    pub port: u16,
}

impl InstanceKey {
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.service_name, self.host, self.port)
    }
}

/// Immutable view of a service group taken at read time.
///
/// Iteration skips unhealthy entries as it goes and can be repeated any
/// number of times with the same result.
#[derive(Debug, Clone)]
pub struct HealthySnapshot {
    service_name: String,
    instances: Arc<Vec<ServiceInstance>>,
}

impl HealthySnapshot {
    fn empty(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            instances: Arc::new(Vec::new()),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceInstance> + '_ {
        self.instances.iter().filter(|instance| instance.healthy)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn to_vec(&self) -> Vec<ServiceInstance> {
        self.iter().cloned().collect()
    }
}

impl<'a> IntoIterator for &'a HealthySnapshot {
    type Item = &'a ServiceInstance;
    type IntoIter = Box<dyn Iterator<Item = &'a ServiceInstance> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// Per-service summary used by the admin API and readiness check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSummary {
    pub service_name: String,
    pub healthy: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct ServiceGroup {
    instances: RwLock<Arc<Vec<ServiceInstance>>>,
}

impl ServiceGroup {
    fn snapshot(&self) -> Arc<Vec<ServiceInstance>> {
        self.instances.read().clone()
    }
}

/// Process-wide registry of service instances
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    groups: DashMap<String, Arc<ServiceGroup>>,
}

/// Shared handle to the registry
pub type SharedRegistry = Arc<InstanceRegistry>;

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // The shard guard is released before the group lock is taken.
    fn group(&self, service_name: &str) -> Option<Arc<ServiceGroup>> {
        self.groups.get(service_name).map(|entry| entry.value().clone())
    }

    fn group_or_insert(&self, service_name: &str) -> Arc<ServiceGroup> {
        if let Some(group) = self.group(service_name) {
            return group;
        }
        self.groups
            .entry(service_name.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Register an instance, marked healthy.
    ///
    /// Fails with [`GatewayError::DuplicateInstance`] if the address is already
    /// registered for that service.
    pub fn register(&self, instance: ServiceInstance) -> GatewayResult<()> {
        let group = self.group_or_insert(&instance.service_name);
        let mut guard = group.instances.write();

        if guard
            .iter()
            .any(|existing| existing.same_address(&instance.host, instance.port))
        {
            return Err(GatewayError::DuplicateInstance {
                service: instance.service_name,
                host: instance.host,
                port: instance.port,
            });
        }

        let instance = ServiceInstance {
            healthy: true,
            last_seen: Utc::now(),
            unhealthy_since: None,
            ..instance
        };
        info!(
            service = %instance.service_name,
            instance = %instance.authority(),
            "Registered instance"
        );
        Arc::make_mut(&mut *guard).push(instance);
        Ok(())
    }

    /// Remove an instance. Returns whether it was present.
    pub fn deregister(&self, service_name: &str, host: &str, port: u16) -> bool {
        let Some(group) = self.group(service_name) else {
            return false;
        };
        let mut guard = group.instances.write();

        let Some(index) = guard.iter().position(|i| i.same_address(host, port)) else {
            return false;
        };
        Arc::make_mut(&mut *guard).remove(index);
        info!(service = %service_name, instance = %format!("{}:{}", host, port), "Deregistered instance");
        true
    }

    /// Update the health of an instance. Unknown instances are logged and ignored.
    ///
    /// Returns whether the instance was found.
    pub fn mark_health(&self, service_name: &str, host: &str, port: u16, healthy: bool) -> bool {
        let found = self.group(service_name).and_then(|group| {
            let mut guard = group.instances.write();
            let index = guard.iter().position(|i| i.same_address(host, port))?;

            let instances = Arc::make_mut(&mut *guard);
            let instance = &mut instances[index];
            let changed = instance.healthy != healthy;
            instance.healthy = healthy;
            if healthy {
                instance.last_seen = Utc::now();
                instance.unhealthy_since = None;
            } else if changed {
                instance.unhealthy_since = Some(Utc::now());
            }
            Some(changed)
        });

        match found {
            Some(true) => {
                info!(
                    service = %service_name,
                    instance = %format!("{}:{}", host, port),
                    healthy,
                    "Instance health changed"
                );
                true
            }
            Some(false) => true,
            None => {
                warn!(
                    service = %service_name,
                    instance = %format!("{}:{}", host, port),
                    healthy,
                    "Health update for unknown instance ignored"
                );
                false
            }
        }
    }

    /// Snapshot of the healthy instances of a service. Unknown services yield an empty snapshot.
    pub fn list_healthy(&self, service_name: &str) -> HealthySnapshot {
        match self.group(service_name) {
            Some(group) => HealthySnapshot {
                service_name: service_name.to_string(),
                instances: group.snapshot(),
            },
            None => HealthySnapshot::empty(service_name),
        }
    }

    /// Current health of one instance; `false` if it is not registered
    pub fn is_healthy(&self, key: &InstanceKey) -> bool {
        self.group(&key.service_name)
            .map(|group| {
                group
                    .snapshot()
                    .iter()
                    .any(|i| i.same_address(&key.host, key.port) && i.healthy)
            })
            .unwrap_or(false)
    }

    /// All instances of a service, healthy or not
    pub fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.group(service_name)
            .map(|group| group.snapshot().as_ref().clone())
            .unwrap_or_default()
    }

    pub fn healthy_count(&self, service_name: &str) -> usize {
        self.list_healthy(service_name).len()
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn summaries(&self) -> Vec<ServiceSummary> {
        self.service_names()
            .into_iter()
            .map(|service_name| {
                let instances = self.instances(&service_name);
                ServiceSummary {
                    healthy: instances.iter().filter(|i| i.healthy).count(),
                    total: instances.len(),
                    service_name,
                }
            })
            .collect()
    }

    /// Remove instances that have stayed unhealthy for longer than `max_age`
    pub fn prune_unhealthy(&self, max_age: Duration) -> Vec<InstanceKey> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|max_age| Utc::now().checked_sub_signed(max_age))
        else {
            return Vec::new();
        };

        let groups: Vec<Arc<ServiceGroup>> =
            self.groups.iter().map(|e| e.value().clone()).collect();

        let mut removed = Vec::new();
        for group in groups {
            let mut guard = group.instances.write();
            if !guard.iter().any(|i| is_stale(i, cutoff)) {
                continue;
            }
            Arc::make_mut(&mut *guard).retain(|i| {
                let stale = is_stale(i, cutoff);
                if stale {
                    removed.push(i.key());
                }
                !stale
            });
        }

        for key in &removed {
            info!(instance = %key, "Pruned unhealthy instance");
        }
        debug!(count = removed.len(), "Unhealthy instance prune finished");
        removed
    }
}

fn is_stale(instance: &ServiceInstance, cutoff: DateTime<Utc>) -> bool {
    !instance.healthy && instance.unhealthy_since.is_some_and(|since| since <= cutoff)
}
