//! Node bootstrap: one linear, idempotent startup sequence.
//!
//! Discovers the node and cluster pod CIDRs from the control plane, installs
//! the host forwarding rules, ensures the bridge with its tunnel and gateway
//! ports, reconciles the interface store, and writes the overlay flow
//! program. Any failure is fatal; the process exits non-zero and the
//! supervisor restarts it. Every kernel and OVSDB object is created only if
//! absent, so re-running after a crash converges on the same state.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use rtnetlink::Handle;
use tracing::{info, warn};

use ciccni_common::TimedOperation;

use ciccni_datapath::iptables::IptablesClient;
use ciccni_datapath::link;
use ciccni_datapath::{
    FlowClient, InterfaceConfig, InterfaceStore, OvsBridgeClient, OvsPortConfig,
};

use crate::config::AgentConfig;
use crate::k8s::ControlPlane;
use crate::netconf::first_host;

pub const NODE_NAME_ENV_KEY: &str = "NODE_NAME";
pub const OUT_INTERFACE_ENV_KEY: &str = "OUT_INTERFACE";

pub const TUNNEL_PORT_NAME: &str = "tun0";
pub const TUNNEL_OF_PORT: i32 = 1;
pub const GATEWAY_OF_PORT: i32 = 2;

const GATEWAY_LINK_RETRIES: usize = 5;
const GATEWAY_LINK_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// The node-local facts bootstrap produces; read-only once the RPC server
/// starts.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_name: String,
    /// This node's pod subnet.
    pub pod_cidr: Ipv4Net,
    /// The cluster-wide pod subnet.
    pub cluster_cidr: Ipv4Net,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub name: String,
    pub ip: Ipv4Addr,
    pub mac: String,
}

/// Orchestrates the startup sequence.
pub struct Initializer {
    control_plane: Arc<dyn ControlPlane>,
    bridge: Arc<dyn OvsBridgeClient>,
    flows: FlowClient,
    store: Arc<InterfaceStore>,
    netlink: Handle,
    config: AgentConfig,
}

impl Initializer {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        bridge: Arc<dyn OvsBridgeClient>,
        flows: FlowClient,
        store: Arc<InterfaceStore>,
        netlink: Handle,
        config: AgentConfig,
    ) -> Self {
        Self {
            control_plane,
            bridge,
            flows,
            store,
            netlink,
            config,
        }
    }

    pub async fn initialize(&self) -> Result<NodeConfig> {
        let timer = TimedOperation::new("node bootstrap");
        match self.run_sequence().await {
            Ok(node_config) => {
                timer.success();
                Ok(node_config)
            }
            Err(e) => {
                timer.failure(&format!("{e:#}"));
                Err(e)
            }
        }
    }

    async fn run_sequence(&self) -> Result<NodeConfig> {
        // 1. Identify the node.
        let node_name = node_name()?;
        info!(node = %node_name, "Initializing node");

        // 2. Node and cluster pod CIDRs.
        let pod_cidr = self.control_plane.node_pod_cidr(&node_name).await?;
        let cluster_cidr = self.control_plane.cluster_pod_cidr().await?;
        info!(%pod_cidr, %cluster_cidr, "Fetched pod CIDRs");

        // 3. Host forwarding rules on the default outbound interface.
        let out_interface = match std::env::var(OUT_INTERFACE_ENV_KEY) {
            Ok(name) if !name.is_empty() => name,
            _ => link::default_route_interface(&self.netlink)
                .await
                .context("discovering default outbound interface")?,
        };
        IptablesClient::new(&self.config.host_gateway)
            .setup_host_forwarding(&out_interface)
            .await
            .context("installing host forwarding rules")?;

        // 4. The bridge itself.
        self.bridge
            .create()
            .await
            .context("ensuring OVS bridge")?;

        // 5. Reconcile the interface store from OVSDB.
        self.store
            .initialize(self.bridge.as_ref(), TUNNEL_PORT_NAME)
            .await
            .context("reconciling interface store")?;

        // 6. Tunnel port.
        self.setup_tunnel_port().await?;

        // 7. Host gateway port.
        let gateway = self
            .setup_gateway(pod_cidr, cluster_cidr)
            .await
            .context("setting up host gateway")?;

        // 8. Flow program.
        self.initialize_flows(&node_name, pod_cidr)
            .await
            .context("installing flow program")?;

        info!(node = %node_name, gateway = %gateway.ip, "Node bootstrap complete");
        Ok(NodeConfig {
            node_name,
            pod_cidr,
            cluster_cidr,
            gateway,
        })
    }

    async fn setup_tunnel_port(&self) -> Result<()> {
        if self.store.get_interface(TUNNEL_PORT_NAME).is_some() {
            info!(port = TUNNEL_PORT_NAME, "Tunnel port already registered");
            return Ok(());
        }

        let uuid = if self.config.tunnel_type == ciccni_datapath::bridge::TUNNEL_TYPE_GENEVE {
            self.bridge
                .create_geneve_port(TUNNEL_PORT_NAME, TUNNEL_OF_PORT, "")
                .await
        } else {
            self.bridge
                .create_vxlan_port(TUNNEL_PORT_NAME, TUNNEL_OF_PORT, "")
                .await
        }
        .with_context(|| format!("creating {} tunnel port", self.config.tunnel_type))?;

        let mut tunnel = InterfaceConfig::new_tunnel(TUNNEL_PORT_NAME);
        tunnel.ovs_port = Some(OvsPortConfig {
            iface_name: TUNNEL_PORT_NAME.to_string(),
            port_uuid: uuid,
            of_port: TUNNEL_OF_PORT,
        });
        self.store.add_interface(TUNNEL_PORT_NAME, tunnel);
        Ok(())
    }

    async fn setup_gateway(
        &self,
        pod_cidr: Ipv4Net,
        cluster_cidr: Ipv4Net,
    ) -> Result<GatewayConfig> {
        let name = self.config.host_gateway.clone();

        let uuid = self
            .bridge
            .create_internal_port(&name, GATEWAY_OF_PORT)
            .await
            .context("creating gateway internal port")?;
        self.bridge
            .set_interface_mtu(&name, self.config.default_mtu)
            .await
            .context("setting gateway MTU")?;

        // vswitchd creates the kernel link asynchronously.
        let gateway_link = link::wait_for_link(
            &self.netlink,
            &name,
            GATEWAY_LINK_RETRIES,
            GATEWAY_LINK_RETRY_INTERVAL,
        )
        .await
        .context("waiting for gateway link")?;

        // First host address of the local pod CIDR, with the cluster CIDR's
        // mask: pods on every node share one route to all peer pod subnets
        // via their local gateway.
        let gateway_ip = first_host(pod_cidr);
        link::ensure_link_addr(
            &self.netlink,
            gateway_link.index,
            gateway_ip,
            cluster_cidr.prefix_len(),
        )
        .await
        .context("assigning gateway address")?;
        link::set_link_up(&self.netlink, gateway_link.index)
            .await
            .context("bringing gateway up")?;

        let mut gateway = InterfaceConfig::new_host_gateway(
            &name,
            gateway_ip,
            gateway_link.mac_string(),
        );
        gateway.ovs_port = Some(OvsPortConfig {
            iface_name: name.clone(),
            port_uuid: uuid,
            of_port: GATEWAY_OF_PORT,
        });
        self.store.add_interface(&name, gateway);

        Ok(GatewayConfig {
            name,
            ip: gateway_ip,
            mac: gateway_link.mac_string(),
        })
    }

    async fn initialize_flows(&self, node_name: &str, pod_cidr: Ipv4Net) -> Result<()> {
        self.flows.initialize().await?;

        let nodes = self.control_plane.list_nodes().await?;
        let peers: Vec<_> = nodes
            .iter()
            .filter(|node| node.name != node_name)
            .collect();

        // ARP responder entries are best-effort: a peer without a reachable
        // address yet is picked up on the next agent restart.
        let peer_ips: Vec<Ipv4Addr> = peers.iter().filter_map(|node| node.internal_ip).collect();
        if !peer_ips.is_empty() {
            if let Err(e) = self
                .flows
                .install_arp_responder(GATEWAY_OF_PORT, TUNNEL_OF_PORT, &peer_ips)
                .await
            {
                warn!(error = %e, "Failed to install ARP responder flows");
            }
        }

        self.flows.install_local_ip_flow(pod_cidr).await?;

        for peer in peers {
            match (peer.internal_ip, peer.pod_cidr) {
                (Some(peer_ip), Some(peer_cidr)) => {
                    self.flows
                        .install_tunnel_flow(peer_cidr, peer_ip, TUNNEL_OF_PORT)
                        .await?;
                }
                _ => {
                    warn!(node = %peer.name, "Peer node missing InternalIP or PodCIDR, skipping tunnel flow");
                }
            }
        }
        Ok(())
    }
}

/// The node name from NODE_NAME, falling back to the host name.
fn node_name() -> Result<String> {
    if let Ok(name) = std::env::var(NODE_NAME_ENV_KEY) {
        if !name.is_empty() {
            return Ok(name);
        }
    }
    let hostname = hostname::get().context("neither NODE_NAME nor a hostname is available")?;
    Ok(hostname.to_string_lossy().to_string())
}
