//! Load balancing strategies for distributing requests across instances.
//!
//! The router filters a service's instance list down to the healthy subset
//! and hands it to the service's balancer; the balancer only chooses among
//! what it is given.

use crate::models::service::{LoadBalancingStrategy, ServiceInstance};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Instance selection strategy.
///
/// `on_dispatch` and `on_complete` bracket each proxied request so
/// connection-counting strategies can track live connections; stateless
/// strategies ignore them.
pub trait LoadBalancer: Send + Sync {
    /// Selects an instance from the healthy candidates, or `None` when the
    /// list is empty.
    fn select(
        &self,
        instances: &[ServiceInstance],
        client_ip: Option<&str>,
    ) -> Option<ServiceInstance>;

    /// Called when a request is dispatched to the instance.
    fn on_dispatch(&self, _instance: &ServiceInstance) {}

    /// Called when the proxied exchange completes, success or failure.
    fn on_complete(&self, _instance: &ServiceInstance) {}
}

/// Round-robin: advances a per-service index in circular order.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(
        &self,
        instances: &[ServiceInstance],
        _client_ip: Option<&str>,
    ) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % instances.len();
        Some(instances[index].clone())
    }
}

/// Weighted round-robin over a weight-expanded instance list.
///
/// An instance with weight 3 appears three times in the expansion, so it
/// receives three of every `sum(weights)` requests.
#[derive(Debug, Default)]
pub struct WeightedRoundRobinBalancer {
    counter: AtomicUsize,
}

impl WeightedRoundRobinBalancer {
    fn expand(instances: &[ServiceInstance]) -> Vec<&ServiceInstance> {
        let mut expanded = Vec::new();
        for instance in instances {
            for _ in 0..instance.weight.max(1) {
                expanded.push(instance);
            }
        }
        expanded
    }
}

impl LoadBalancer for WeightedRoundRobinBalancer {
    fn select(
        &self,
        instances: &[ServiceInstance],
        _client_ip: Option<&str>,
    ) -> Option<ServiceInstance> {
        let expanded = Self::expand(instances);
        if expanded.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % expanded.len();
        Some(expanded[index].clone())
    }
}

/// Least-connections: picks the instance with the fewest live connections.
///
/// Connection counts are incremented on dispatch and decremented on
/// completion, so long-running requests naturally steer new traffic away.
#[derive(Debug, Default)]
pub struct LeastConnectionsBalancer {
    connections: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl LeastConnectionsBalancer {
    fn counter_for(&self, instance: &ServiceInstance) -> Arc<AtomicU64> {
        let key = instance.key();
        if let Some(counter) = self.connections.read().unwrap().get(&key) {
            return counter.clone();
        }
        self.connections
            .write()
            .unwrap()
            .entry(key)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    fn live_connections(&self, instance: &ServiceInstance) -> u64 {
        self.connections
            .read()
            .unwrap()
            .get(&instance.key())
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn select(
        &self,
        instances: &[ServiceInstance],
        _client_ip: Option<&str>,
    ) -> Option<ServiceInstance> {
        instances
            .iter()
            .min_by_key(|instance| self.live_connections(instance))
            .cloned()
    }

    fn on_dispatch(&self, instance: &ServiceInstance) {
        self.counter_for(instance).fetch_add(1, Ordering::Relaxed);
    }

    fn on_complete(&self, instance: &ServiceInstance) {
        let counter = self.counter_for(instance);
        // Saturating decrement; completion without a matching dispatch can
        // happen after a registry rebuild.
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }
}

/// Uniform random selection.
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn select(
        &self,
        instances: &[ServiceInstance],
        _client_ip: Option<&str>,
    ) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        use rand::Rng;
        let index = rand::thread_rng().gen_range(0..instances.len());
        Some(instances[index].clone())
    }
}

/// Client-IP hash: deterministic and sticky per client.
#[derive(Debug, Default)]
pub struct IpHashBalancer;

impl IpHashBalancer {
    fn hash_ip(ip: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        ip.hash(&mut hasher);
        hasher.finish()
    }
}

impl LoadBalancer for IpHashBalancer {
    fn select(
        &self,
        instances: &[ServiceInstance],
        client_ip: Option<&str>,
    ) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        match client_ip {
            Some(ip) => {
                let index = (Self::hash_ip(ip) as usize) % instances.len();
                Some(instances[index].clone())
            }
            None => Some(instances[0].clone()),
        }
    }
}

/// Creates the balancer implementation for a configured strategy.
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    pub fn create(strategy: LoadBalancingStrategy) -> Arc<dyn LoadBalancer> {
        match strategy {
            LoadBalancingStrategy::RoundRobin => Arc::new(RoundRobinBalancer::default()),
            LoadBalancingStrategy::WeightedRoundRobin => {
                Arc::new(WeightedRoundRobinBalancer::default())
            }
            LoadBalancingStrategy::LeastConnections => {
                Arc::new(LeastConnectionsBalancer::default())
            }
            LoadBalancingStrategy::Random => Arc::new(RandomBalancer::default()),
            LoadBalancingStrategy::IpHash => Arc::new(IpHashBalancer::default()),
        }
    }
}
