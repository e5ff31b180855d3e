//! Endpoint classification strategies
//!
//! Decides whether a declared port on a running instance serves Go
//! profiling data. Three interchangeable strategies, in increasing cost
//! and precision:
//! - [`ConventionClassifier`]: port name equals a sentinel, no network cost
//! - [`ProbeClassifier`]: short-timeout GET against the diagnostic path
//! - [`CachedClassifier`]: any classifier, memoised in a [`LivenessCache`]

use super::LivenessCache;
use crate::models::{DeclaredPort, WorkloadInstance, DIAGNOSTIC_PATH};
use crate::observability::ProfilerMetrics;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Default port name accepted by the convention strategy
pub const DEFAULT_PORT_NAME: &str = "http";

/// Strategy deciding whether an instance port is a profiling endpoint
#[async_trait]
pub trait EndpointClassifier: Send + Sync {
    async fn classify(&self, instance: &WorkloadInstance, port: &DeclaredPort) -> bool;
}

/// `ip:port` for a port on an instance, if the instance has an IP
pub fn endpoint_address(instance: &WorkloadInstance, port: &DeclaredPort) -> Option<String> {
    instance
        .pod_ip
        .as_deref()
        .filter(|ip| !ip.is_empty())
        .map(|ip| format!("{}:{}", ip, port.port))
}

/// Selects which classifier the registry composes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    Convention,
    Probe,
    #[default]
    CachedProbe,
}

impl DiscoveryStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "convention" => Some(Self::Convention),
            "probe" => Some(Self::Probe),
            "cached_probe" | "cached-probe" => Some(Self::CachedProbe),
            _ => None,
        }
    }
}

/// Build the classifier for a strategy
pub fn build_classifier(
    strategy: DiscoveryStrategy,
    probe_timeout: Duration,
    port_name: &str,
) -> anyhow::Result<Arc<dyn EndpointClassifier>> {
    let classifier: Arc<dyn EndpointClassifier> = match strategy {
        DiscoveryStrategy::Convention => Arc::new(ConventionClassifier::new(port_name)),
        DiscoveryStrategy::Probe => Arc::new(ProbeClassifier::new(probe_timeout)?),
        DiscoveryStrategy::CachedProbe => Arc::new(CachedClassifier::new(
            ProbeClassifier::new(probe_timeout)?,
            Arc::new(LivenessCache::new()),
        )),
    };
    Ok(classifier)
}

/// Accepts ports whose declared name equals a fixed sentinel
#[derive(Debug, Clone)]
pub struct ConventionClassifier {
    port_name: String,
}

impl ConventionClassifier {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
        }
    }
}

impl Default for ConventionClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_NAME)
    }
}

#[async_trait]
impl EndpointClassifier for ConventionClassifier {
    async fn classify(&self, _instance: &WorkloadInstance, port: &DeclaredPort) -> bool {
        port.name.as_deref() == Some(self.port_name.as_str())
    }
}

/// Probes `http://{ip}:{port}/debug/pprof/` on every call
#[derive(Debug, Clone)]
pub struct ProbeClassifier {
    client: reqwest::Client,
    metrics: ProfilerMetrics,
}

impl ProbeClassifier {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            metrics: ProfilerMetrics::new(),
        })
    }

    /// GET `url` following redirects; a transport error or a final status
    /// of 300 or above is a miss
    pub async fn probe(&self, url: &str) -> bool {
        let reachable = match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.as_u16() >= 300 {
                    debug!(url = %url, status = %status, "Probe returned non-success status");
                }
                status.as_u16() < 300
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Probe failed");
                false
            }
        };
        self.metrics.record_probe(reachable);
        reachable
    }
}

#[async_trait]
impl EndpointClassifier for ProbeClassifier {
    async fn classify(&self, instance: &WorkloadInstance, port: &DeclaredPort) -> bool {
        match endpoint_address(instance, port) {
            Some(address) => {
                self.probe(&format!("http://{address}{DIAGNOSTIC_PATH}/"))
                    .await
            }
            None => false,
        }
    }
}

/// Memoises another classifier per `instance:port`
pub struct CachedClassifier<C> {
    inner: C,
    cache: Arc<LivenessCache>,
    metrics: ProfilerMetrics,
}

impl<C: EndpointClassifier> CachedClassifier<C> {
    pub fn new(inner: C, cache: Arc<LivenessCache>) -> Self {
        Self {
            inner,
            cache,
            metrics: ProfilerMetrics::new(),
        }
    }

    pub fn cache(&self) -> &Arc<LivenessCache> {
        &self.cache
    }
}

#[async_trait]
impl<C: EndpointClassifier> EndpointClassifier for CachedClassifier<C> {
    async fn classify(&self, instance: &WorkloadInstance, port: &DeclaredPort) -> bool {
        let key = LivenessCache::key(&instance.name, port.port);
        if let Some(serves_profiles) = self.cache.load(&key) {
            self.metrics.inc_liveness_cache_hits();
            return serves_profiles;
        }

        let serves_profiles = self.inner.classify(instance, port).await;
        self.cache.store(key, serves_profiles);
        serves_profiles
    }
}
