//! Host discovery from the cluster API
//!
//! Lists running workload instances, keeps only TCP ports that the
//! configured [`EndpointClassifier`] accepts as profiling endpoints, and
//! returns fresh [`Host`] records on every call.

mod classifier;
mod kubernetes;
mod liveness;

#[cfg(test)]
mod tests;

pub use classifier::{
    build_classifier, endpoint_address, CachedClassifier, ConventionClassifier,
    DiscoveryStrategy, EndpointClassifier, ProbeClassifier, DEFAULT_PORT_NAME,
    DEFAULT_PROBE_TIMEOUT,
};
pub use kubernetes::KubeClusterApi;
pub use liveness::LivenessCache;

use crate::models::{Host, InstancePhase, PortProtocol, WorkloadInstance};
use crate::observability::ProfilerMetrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by host discovery
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The cluster API could not be reached or returned an error
    #[error("cluster API unavailable: {0}")]
    UpstreamUnavailable(String),
}

/// Upstream contract the registry needs from the cluster control plane
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<String>, RegistryError>;

    async fn list_instances(&self, namespace: &str) -> Result<Vec<WorkloadInstance>, RegistryError>;
}

/// Orders namespaces by an explicit ranked list
///
/// Namespaces named in `priority` come first, in the list's order; the rest
/// keep their upstream order.
pub fn order_namespaces(mut namespaces: Vec<String>, priority: &[String]) -> Vec<String> {
    if priority.is_empty() {
        return namespaces;
    }
    namespaces.sort_by_key(|namespace| {
        priority
            .iter()
            .position(|p| p == namespace)
            .unwrap_or(priority.len())
    });
    namespaces
}

/// Discovers profiling endpoints per namespace
pub struct HostRegistry {
    api: Arc<dyn ClusterApi>,
    classifier: Arc<dyn EndpointClassifier>,
    priority: Vec<String>,
    metrics: ProfilerMetrics,
}

impl HostRegistry {
    pub fn new(api: Arc<dyn ClusterApi>, classifier: Arc<dyn EndpointClassifier>) -> Self {
        Self {
            api,
            classifier,
            priority: Vec::new(),
            metrics: ProfilerMetrics::new(),
        }
    }

    /// Rank these namespaces ahead of the others
    pub fn with_priority(mut self, priority: Vec<String>) -> Self {
        self.priority = priority;
        self
    }

    /// List namespace names, priority namespaces first
    pub async fn list_namespaces(&self) -> Result<Vec<String>, RegistryError> {
        let namespaces = self.api.list_namespaces().await?;
        Ok(order_namespaces(namespaces, &self.priority))
    }

    /// List profiling endpoints of running instances in a namespace
    ///
    /// Instances or ports rejected by filtering are dropped silently; only
    /// an upstream failure is an error.
    pub async fn list_hosts(&self, namespace: &str) -> Result<Vec<Host>, RegistryError> {
        let start = Instant::now();
        let instances = self.api.list_instances(namespace).await?;
        let now = chrono::Utc::now();

        let mut hosts = Vec::new();
        for instance in instances
            .iter()
            .filter(|instance| instance.phase == InstancePhase::Running)
        {
            for port in instance
                .ports
                .iter()
                .filter(|port| port.protocol == PortProtocol::Tcp)
            {
                let Some(address) = endpoint_address(instance, port) else {
                    continue;
                };
                if !self.classifier.classify(instance, port).await {
                    continue;
                }
                hosts.push(Host {
                    name: format!("{}:{}", instance.name, port.port),
                    address,
                    age: instance.age_at(now),
                });
            }
        }

        self.metrics
            .observe_discovery_latency(start.elapsed().as_secs_f64());
        debug!(
            namespace = %namespace,
            instances = instances.len(),
            hosts = hosts.len(),
            "Discovered hosts"
        );
        Ok(hosts)
    }
}
