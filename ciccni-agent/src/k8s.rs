//! Control-plane reads.
//!
//! The agent consumes the Kubernetes API through the narrow [`ControlPlane`]
//! trait: the local node's pod CIDR, the cluster pod CIDR from the kubeadm
//! config map, the peer-node list for the overlay flows, and per-pod
//! annotations for egress shaping. Handlers and bootstrap depend on the
//! trait so tests run against an in-memory fake.

use std::net::Ipv4Addr;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::{api::ListParams, Api, Client};
use tracing::debug;

/// Annotation carrying the pod's egress bandwidth limit.
pub const EGRESS_RATE_ANNOTATION: &str = "ciccni/egress-rate";

/// A cluster node as the overlay cares about it.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub name: String,
    pub internal_ip: Option<Ipv4Addr>,
    pub pod_cidr: Option<Ipv4Net>,
}

/// Everything the agent reads from the cluster control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// `Node(<name>).Spec.PodCIDR`; an empty value is an error.
    async fn node_pod_cidr(&self, node_name: &str) -> Result<Ipv4Net>;

    /// `networking.podSubnet` from the kubeadm ClusterConfiguration.
    async fn cluster_pod_cidr(&self) -> Result<Ipv4Net>;

    /// All nodes in the cluster, including the local one.
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>>;

    /// The `ciccni/egress-rate` annotation of a pod, when present.
    async fn pod_egress_rate(&self, namespace: &str, pod_name: &str) -> Result<Option<String>>;
}

/// [`ControlPlane`] implementation over the in-cluster (or kubeconfig)
/// Kubernetes client.
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn node_pod_cidr(&self, node_name: &str) -> Result<Ipv4Net> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes
            .get(node_name)
            .await
            .with_context(|| format!("Failed to get node {node_name}"))?;

        let pod_cidr = node.spec.and_then(|spec| spec.pod_cidr).unwrap_or_default();
        if pod_cidr.is_empty() {
            bail!(
                "Spec.PodCIDR is empty for node {node_name}. Make sure --allocate-node-cidrs \
                 is enabled for kube-controller-manager and --cluster-cidr specifies a \
                 sufficient CIDR range"
            );
        }
        pod_cidr
            .parse()
            .with_context(|| format!("Failed to parse PodCIDR {pod_cidr} of node {node_name}"))
    }

    async fn cluster_pod_cidr(&self) -> Result<Ipv4Net> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), "kube-system");
        let kubeadm = config_maps
            .get("kubeadm-config")
            .await
            .context("Failed to get kube-system/kubeadm-config")?;

        let cluster_config = kubeadm
            .data
            .as_ref()
            .and_then(|data| data.get("ClusterConfiguration"))
            .context("kubeadm-config has no ClusterConfiguration")?;

        let parsed: serde_yaml::Value = serde_yaml::from_str(cluster_config)
            .context("Failed to parse ClusterConfiguration YAML")?;
        let pod_subnet = parsed
            .get("networking")
            .and_then(|networking| networking.get("podSubnet"))
            .and_then(|subnet| subnet.as_str())
            .context("ClusterConfiguration has no networking.podSubnet")?;

        pod_subnet
            .parse()
            .with_context(|| format!("Failed to parse cluster pod subnet {pod_subnet}"))
    }

    async fn list_nodes(&self) -> Result<Vec<ClusterNode>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .context("Failed to list nodes")?;

        let mut cluster_nodes = Vec::with_capacity(list.items.len());
        for node in list.items {
            let name = node.metadata.name.clone().unwrap_or_default();
            let internal_ip = node
                .status
                .as_ref()
                .and_then(|status| status.addresses.as_ref())
                .and_then(|addresses| {
                    addresses
                        .iter()
                        .find(|address| address.type_ == "InternalIP")
                })
                .and_then(|address| address.address.parse().ok());
            let pod_cidr = node
                .spec
                .as_ref()
                .and_then(|spec| spec.pod_cidr.as_ref())
                .and_then(|cidr| cidr.parse().ok());

            debug!(node = %name, ?internal_ip, ?pod_cidr, "Discovered cluster node");
            cluster_nodes.push(ClusterNode {
                name,
                internal_ip,
                pod_cidr,
            });
        }
        Ok(cluster_nodes)
    }

    async fn pod_egress_rate(&self, namespace: &str, pod_name: &str) -> Result<Option<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pods
            .get(pod_name)
            .await
            .with_context(|| format!("Failed to get pod {namespace}/{pod_name}"))?;

        Ok(pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(EGRESS_RATE_ANNOTATION))
            .cloned())
    }
}
