//! Kubernetes-backed cluster API

use super::{ClusterApi, RegistryError};
use crate::models::{DeclaredPort, InstancePhase, PortProtocol, WorkloadInstance};
use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use std::path::Path;
use tracing::{debug, info};

/// Lists namespaces and pods through the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using an explicit kubeconfig, or infer the configuration
    /// (in-cluster service account first, then `~/.kube/config`)
    pub async fn connect(kubeconfig: Option<&Path>) -> anyhow::Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                info!(path = %path.display(), "Loading kubeconfig");
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context("Invalid kubeconfig")?
            }
            None => Config::infer()
                .await
                .context("Failed to infer Kubernetes configuration")?,
        };

        let client = Client::try_from(config).context("Failed to create Kubernetes client")?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_namespaces(&self) -> Result<Vec<String>, RegistryError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| RegistryError::UpstreamUnavailable(e.to_string()))?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|namespace| namespace.metadata.name)
            .collect())
    }

    async fn list_instances(&self, namespace: &str) -> Result<Vec<WorkloadInstance>, RegistryError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| RegistryError::UpstreamUnavailable(e.to_string()))?;

        debug!(namespace = %namespace, pods = list.items.len(), "Listed pods");
        Ok(list.items.into_iter().filter_map(pod_to_instance).collect())
    }
}

/// Convert a pod into a workload instance, flattening container ports
fn pod_to_instance(pod: Pod) -> Option<WorkloadInstance> {
    let name = pod.metadata.name?;
    let status = pod.status.unwrap_or_default();

    let ports = pod
        .spec
        .map(|spec| spec.containers)
        .unwrap_or_default()
        .into_iter()
        .flat_map(|container| container.ports.unwrap_or_default())
        .filter_map(|port| {
            Some(DeclaredPort {
                port: u16::try_from(port.container_port).ok()?,
                protocol: PortProtocol::parse(port.protocol.as_deref())?,
                name: port.name,
            })
        })
        .collect();

    Some(WorkloadInstance {
        name,
        phase: InstancePhase::parse(status.phase.as_deref()),
        pod_ip: status.pod_ip,
        started_at: status.start_time.map(|time| time.0),
        ports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn container(ports: Vec<ContainerPort>) -> Container {
        Container {
            name: "app".to_string(),
            ports: Some(ports),
            ..Default::default()
        }
    }

    fn container_port(name: Option<&str>, number: i32, protocol: Option<&str>) -> ContainerPort {
        ContainerPort {
            name: name.map(str::to_string),
            container_port: number,
            protocol: protocol.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_to_instance_flattens_ports() {
        let started = chrono::Utc::now();
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("api-7d9f".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![
                    container(vec![container_port(Some("http"), 8080, None)]),
                    container(vec![
                        container_port(Some("metrics"), 9090, Some("TCP")),
                        container_port(Some("dns"), 53, Some("UDP")),
                    ]),
                ],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some("10.1.2.3".to_string()),
                start_time: Some(Time(started)),
                ..Default::default()
            }),
        };

        let instance = pod_to_instance(pod).unwrap();
        assert_eq!(instance.name, "api-7d9f");
        assert_eq!(instance.phase, InstancePhase::Running);
        assert_eq!(instance.pod_ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(instance.started_at, Some(started));
        assert_eq!(instance.ports.len(), 3);
        assert_eq!(instance.ports[0].protocol, PortProtocol::Tcp);
        assert_eq!(instance.ports[2].protocol, PortProtocol::Udp);
    }

    #[test]
    fn test_pod_without_status_is_unknown_phase() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("pending-0".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let instance = pod_to_instance(pod).unwrap();
        assert_eq!(instance.phase, InstancePhase::Unknown);
        assert!(instance.ports.is_empty());
    }
}
