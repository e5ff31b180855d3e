//! Host registry tests against an in-memory cluster

use super::*;
use crate::models::DeclaredPort;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct FakeCluster {
    namespaces: Vec<String>,
    instances: Mutex<HashMap<String, Vec<WorkloadInstance>>>,
    unavailable: bool,
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_namespaces(&self) -> Result<Vec<String>, RegistryError> {
        if self.unavailable {
            return Err(RegistryError::UpstreamUnavailable("connection refused".into()));
        }
        Ok(self.namespaces.clone())
    }

    async fn list_instances(&self, namespace: &str) -> Result<Vec<WorkloadInstance>, RegistryError> {
        if self.unavailable {
            return Err(RegistryError::UpstreamUnavailable("connection refused".into()));
        }
        Ok(self
            .instances
            .lock()
            .unwrap()
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }
}

/// Accepts everything and counts calls per key
#[derive(Default)]
struct CountingClassifier {
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

#[async_trait]
impl EndpointClassifier for CountingClassifier {
    async fn classify(&self, instance: &WorkloadInstance, port: &DeclaredPort) -> bool {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .unwrap()
            .entry(LivenessCache::key(&instance.name, port.port))
            .or_default() += 1;
        true
    }
}

fn tcp(name: &str, number: u16) -> DeclaredPort {
    DeclaredPort {
        name: Some(name.to_string()),
        port: number,
        protocol: PortProtocol::Tcp,
    }
}

fn pod(name: &str, phase: InstancePhase, ip: Option<&str>, age_mins: i64) -> WorkloadInstance {
    WorkloadInstance {
        name: name.to_string(),
        phase,
        pod_ip: ip.map(str::to_string),
        started_at: Some(Utc::now() - chrono::Duration::minutes(age_mins)),
        ports: vec![tcp("http", 8080)],
    }
}

fn cluster_with(namespace: &str, instances: Vec<WorkloadInstance>) -> FakeCluster {
    let cluster = FakeCluster {
        namespaces: vec![namespace.to_string()],
        ..Default::default()
    };
    cluster
        .instances
        .lock()
        .unwrap()
        .insert(namespace.to_string(), instances);
    cluster
}

#[tokio::test]
async fn test_only_running_instances_with_ip_are_listed() {
    let cluster = cluster_with(
        "prod",
        vec![
            pod("api-0", InstancePhase::Running, Some("10.0.0.1"), 30),
            pod("api-1", InstancePhase::Pending, Some("10.0.0.2"), 1),
            pod("api-2", InstancePhase::Succeeded, Some("10.0.0.3"), 90),
            pod("api-3", InstancePhase::Running, None, 5),
        ],
    );
    let registry = HostRegistry::new(
        Arc::new(cluster),
        Arc::new(CountingClassifier::default()),
    );

    let hosts = registry.list_hosts("prod").await.unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].name, "api-0:8080");
    assert_eq!(hosts[0].address, "10.0.0.1:8080");
    assert!(hosts[0].age >= Duration::from_secs(29 * 60));
}

#[tokio::test]
async fn test_non_tcp_ports_are_skipped() {
    let mut instance = pod("dns-0", InstancePhase::Running, Some("10.0.0.9"), 10);
    instance.ports = vec![
        DeclaredPort {
            name: Some("dns".to_string()),
            port: 53,
            protocol: PortProtocol::Udp,
        },
        tcp("http", 6060),
    ];
    let classifier = Arc::new(CountingClassifier::default());
    let registry = HostRegistry::new(Arc::new(cluster_with("kube-system", vec![instance])), classifier.clone());

    let hosts = registry.list_hosts("kube-system").await.unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].name, "dns-0:6060");
    // UDP port never reaches the classifier
    assert_eq!(classifier.total.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_empty_namespace_is_not_an_error() {
    let registry = HostRegistry::new(
        Arc::new(FakeCluster::default()),
        Arc::new(CountingClassifier::default()),
    );

    let hosts = registry.list_hosts("empty").await.unwrap();
    assert!(hosts.is_empty());
}

#[tokio::test]
async fn test_upstream_failure_is_surfaced() {
    let cluster = FakeCluster {
        unavailable: true,
        ..Default::default()
    };
    let registry = HostRegistry::new(Arc::new(cluster), Arc::new(CountingClassifier::default()));

    assert!(matches!(
        registry.list_hosts("prod").await,
        Err(RegistryError::UpstreamUnavailable(_))
    ));
    assert!(matches!(
        registry.list_namespaces().await,
        Err(RegistryError::UpstreamUnavailable(_))
    ));
}

#[tokio::test]
async fn test_convention_strategy_filters_by_port_name() {
    let mut instance = pod("worker-0", InstancePhase::Running, Some("10.0.1.1"), 10);
    instance.ports = vec![tcp("grpc", 9000), tcp("http", 8080)];
    let registry = HostRegistry::new(
        Arc::new(cluster_with("jobs", vec![instance])),
        Arc::new(ConventionClassifier::default()),
    );

    let hosts = registry.list_hosts("jobs").await.unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].address, "10.0.1.1:8080");
}

#[tokio::test]
async fn test_cached_strategy_probes_each_key_once_across_passes() {
    let counting = Arc::new(CountingClassifier::default());

    struct Shared(Arc<CountingClassifier>);

    #[async_trait]
    impl EndpointClassifier for Shared {
        async fn classify(&self, instance: &WorkloadInstance, port: &DeclaredPort) -> bool {
            self.0.classify(instance, port).await
        }
    }

    let cached = CachedClassifier::new(Shared(counting.clone()), Arc::new(LivenessCache::new()));
    let registry = HostRegistry::new(
        Arc::new(cluster_with(
            "prod",
            vec![
                pod("api-0", InstancePhase::Running, Some("10.0.0.1"), 30),
                pod("api-1", InstancePhase::Running, Some("10.0.0.2"), 20),
            ],
        )),
        Arc::new(cached),
    );

    for _ in 0..4 {
        let hosts = registry.list_hosts("prod").await.unwrap();
        assert_eq!(hosts.len(), 2);
    }

    let calls = counting.calls.lock().unwrap();
    assert_eq!(calls.get("api-0:8080"), Some(&1));
    assert_eq!(calls.get("api-1:8080"), Some(&1));
}

#[tokio::test]
async fn test_namespaces_follow_priority_list() {
    let cluster = FakeCluster {
        namespaces: ["default", "billing", "kube-system", "checkout"]
            .map(String::from)
            .to_vec(),
        ..Default::default()
    };
    let registry = HostRegistry::new(Arc::new(cluster), Arc::new(CountingClassifier::default()))
        .with_priority(vec!["checkout".to_string(), "billing".to_string()]);

    let namespaces = registry.list_namespaces().await.unwrap();
    assert_eq!(
        namespaces,
        vec!["checkout", "billing", "default", "kube-system"]
    );
}

#[test]
fn test_order_namespaces_without_priority_keeps_upstream_order() {
    let namespaces = vec!["b".to_string(), "a".to_string()];
    assert_eq!(order_namespaces(namespaces.clone(), &[]), namespaces);
}
