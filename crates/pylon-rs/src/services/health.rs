//! Instance health tracking and background probing.
//!
//! Health state is shared between two producers: the background checker
//! (active probes against each instance's health path) and the reverse proxy
//! (passive failures observed on real traffic). Both feed the same
//! consecutive-failure counter, so an instance that starts refusing
//! connections is drained without waiting for the next probe round.

use crate::models::service::{ServiceDescriptor, ServiceInstance};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

/// Consecutive failures before an instance is marked unhealthy.
const UNHEALTHY_AFTER_FAILURES: u32 = 3;

/// Health record for one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealth {
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Default for InstanceHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            last_check: None,
            consecutive_failures: 0,
        }
    }
}

/// Shared health table keyed by service name, then instance key.
///
/// Every configured instance has an entry from startup; lookups for unknown
/// instances are treated as healthy so a stale registry never blocks traffic.
#[derive(Default)]
pub struct HealthRegistry {
    table: RwLock<HashMap<String, HashMap<String, InstanceHealth>>>,
}

impl HealthRegistry {
    pub fn new(services: &[ServiceDescriptor]) -> Arc<Self> {
        let mut table = HashMap::new();
        for service in services {
            let entries = service
                .instances
                .iter()
                .map(|i| (i.key(), InstanceHealth::default()))
                .collect();
            table.insert(service.name.clone(), entries);
        }
        Arc::new(Self {
            table: RwLock::new(table),
        })
    }

    /// Records a successful probe or proxied request. Any success restores
    /// the instance to healthy and clears the failure streak.
    pub fn record_success(&self, service: &str, instance_key: &str) {
        let mut table = self.table.write().unwrap();
        let entry = table
            .entry(service.to_string())
            .or_default()
            .entry(instance_key.to_string())
            .or_default();
        if !entry.healthy {
            info!("Instance {} of {} is healthy again", instance_key, service);
        }
        entry.healthy = true;
        entry.consecutive_failures = 0;
        entry.last_check = Some(Utc::now());
    }

    /// Records a failed probe or proxied request.
    pub fn record_failure(&self, service: &str, instance_key: &str) {
        let mut table = self.table.write().unwrap();
        let entry = table
            .entry(service.to_string())
            .or_default()
            .entry(instance_key.to_string())
            .or_default();
        entry.consecutive_failures += 1;
        entry.last_check = Some(Utc::now());
        if entry.consecutive_failures >= UNHEALTHY_AFTER_FAILURES && entry.healthy {
            entry.healthy = false;
            warn!(
                "Instance {} of {} marked unhealthy after {} consecutive failures",
                instance_key, service, entry.consecutive_failures
            );
        }
    }

    pub fn is_healthy(&self, service: &str, instance_key: &str) -> bool {
        self.table
            .read()
            .unwrap()
            .get(service)
            .and_then(|entries| entries.get(instance_key))
            .map(|h| h.healthy)
            .unwrap_or(true)
    }

    /// The subset of a service's instances currently considered healthy.
    pub fn healthy_instances(&self, service: &ServiceDescriptor) -> Vec<ServiceInstance> {
        service
            .instances
            .iter()
            .filter(|i| self.is_healthy(&service.name, &i.key()))
            .cloned()
            .collect()
    }

    /// Full health map for the `/health` endpoint and admin surface.
    pub fn snapshot(&self) -> HashMap<String, HashMap<String, InstanceHealth>> {
        self.table.read().unwrap().clone()
    }
}

/// Background prober that keeps the health registry current.
pub struct HealthChecker {
    registry: Arc<HealthRegistry>,
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new(registry: Arc<HealthRegistry>) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .build()
            .expect("Failed to create health check client");
        Self { registry, client }
    }

    /// Spawns one probe loop per service. The loops stop when `shutdown`
    /// flips to true.
    pub fn spawn(
        &self,
        services: Vec<ServiceDescriptor>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        services
            .into_iter()
            .map(|service| {
                let registry = self.registry.clone();
                let client = self.client.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(Duration::from_secs(
                        service.health_check.interval_secs.max(1),
                    ));
                    // The first tick fires immediately so the registry has
                    // fresh data before real traffic arrives.
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                probe_service(&client, &registry, &service).await;
                            }
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    debug!("Health checker for {} stopping", service.name);
                                    break;
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

async fn probe_service(
    client: &reqwest::Client,
    registry: &HealthRegistry,
    service: &ServiceDescriptor,
) {
    for instance in &service.instances {
        let url = format!("{}{}", instance.url(), service.health_check.path);
        let timeout = Duration::from_secs(service.health_check.timeout_secs.max(1));

        let passed = match tokio::time::timeout(timeout, client.get(&url).send()).await {
            Ok(Ok(response)) => response.status().as_u16() < 500,
            Ok(Err(e)) => {
                debug!("Health probe {} failed: {}", url, e);
                false
            }
            Err(_) => {
                debug!("Health probe {} timed out", url);
                false
            }
        };

        if passed {
            registry.record_success(&service.name, &instance.key());
        } else {
            registry.record_failure(&service.name, &instance.key());
        }
    }
}
