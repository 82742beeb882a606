//! OpenFlow client for the overlay flow program.
//!
//! The flow program is a fixed table-0 pipeline (see the flow builders
//! below). Rules are emitted as `ovs-ofctl` flow-mods; add-flow with an
//! identical match replaces the previous rule, so every install is
//! idempotent at the OpenFlow layer.

use std::net::Ipv4Addr;
use std::process::Stdio;

use ipnet::Ipv4Net;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{DatapathError, Result};

const PRIORITY_DEFAULT: u32 = 0;
const PRIORITY_NORMAL_ARP: u32 = 100;
const PRIORITY_OVERLAY: u32 = 200;

/// Emits flow rules against the bridge named at construction time.
#[derive(Debug, Clone)]
pub struct FlowClient {
    bridge: String,
}

impl FlowClient {
    pub fn new(bridge: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
        }
    }

    /// Install the base table-0 program: permit ARP locally and drop
    /// anything no other rule claims.
    pub async fn initialize(&self) -> Result<()> {
        self.add_flow(&normal_arp_flow()).await?;
        self.add_flow(&default_drop_flow()).await?;
        info!(bridge = %self.bridge, "Installed base flow program");
        Ok(())
    }

    /// ARP responder rules: ARP requests from the gateway for any peer node
    /// address are sent out the tunnel. The rule set owns the whole peer
    /// vector; OpenFlow has no set-match for arp_tpa, so one rule is emitted
    /// per address.
    pub async fn install_arp_responder(
        &self,
        gateway_of_port: i32,
        tunnel_of_port: i32,
        peer_node_ips: &[Ipv4Addr],
    ) -> Result<()> {
        for peer in peer_node_ips {
            self.add_flow(&arp_responder_flow(gateway_of_port, tunnel_of_port, *peer))
                .await?;
        }
        Ok(())
    }

    /// Local-delivery rule: traffic for the local pod CIDR is switched
    /// normally.
    pub async fn install_local_ip_flow(&self, local_pod_cidr: Ipv4Net) -> Result<()> {
        self.add_flow(&local_ip_flow(local_pod_cidr)).await
    }

    /// Tunnel rewrite rule: traffic for a peer's pod CIDR gets its tunnel
    /// destination set to the peer's node address and leaves via the tunnel
    /// port.
    pub async fn install_tunnel_flow(
        &self,
        peer_pod_cidr: Ipv4Net,
        peer_node_ip: Ipv4Addr,
        tunnel_of_port: i32,
    ) -> Result<()> {
        self.add_flow(&tunnel_flow(peer_pod_cidr, peer_node_ip, tunnel_of_port))
            .await
    }

    async fn add_flow(&self, flow: &str) -> Result<()> {
        debug!(bridge = %self.bridge, flow, "ovs-ofctl add-flow");
        self.run(&["add-flow", &self.bridge, flow]).await
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("ovs-ofctl")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DatapathError::FlowProgramming(format!("ovs-ofctl: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DatapathError::FlowProgramming(format!(
                "ovs-ofctl {}: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Flow builders
// ============================================================================

fn normal_arp_flow() -> String {
    format!("table=0,priority={PRIORITY_NORMAL_ARP},arp,actions=normal")
}

fn default_drop_flow() -> String {
    format!("table=0,priority={PRIORITY_DEFAULT},actions=drop")
}

fn arp_responder_flow(gateway_of_port: i32, tunnel_of_port: i32, peer: Ipv4Addr) -> String {
    format!(
        "table=0,priority={PRIORITY_OVERLAY},arp,in_port={gateway_of_port},arp_tpa={peer},actions=output:{tunnel_of_port}"
    )
}

fn local_ip_flow(local_pod_cidr: Ipv4Net) -> String {
    format!("table=0,priority={PRIORITY_OVERLAY},ip,nw_dst={local_pod_cidr},actions=normal")
}

fn tunnel_flow(peer_pod_cidr: Ipv4Net, peer_node_ip: Ipv4Addr, tunnel_of_port: i32) -> String {
    format!(
        "table=0,priority={PRIORITY_OVERLAY},ip,nw_dst={peer_pod_cidr},actions=set_field:{peer_node_ip}->tun_dst,output:{tunnel_of_port}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arp_responder_flow_matches_gateway_in_port() {
        let flow = arp_responder_flow(2, 1, Ipv4Addr::new(192, 168, 1, 11));
        assert_eq!(
            flow,
            "table=0,priority=200,arp,in_port=2,arp_tpa=192.168.1.11,actions=output:1"
        );
    }

    #[test]
    fn local_ip_flow_switches_normally() {
        let cidr: Ipv4Net = "10.244.1.0/24".parse().unwrap();
        assert_eq!(
            local_ip_flow(cidr),
            "table=0,priority=200,ip,nw_dst=10.244.1.0/24,actions=normal"
        );
    }

    #[test]
    fn tunnel_flow_rewrites_tun_dst() {
        let cidr: Ipv4Net = "10.244.2.0/24".parse().unwrap();
        assert_eq!(
            tunnel_flow(cidr, Ipv4Addr::new(192, 168, 1, 12), 1),
            "table=0,priority=200,ip,nw_dst=10.244.2.0/24,actions=set_field:192.168.1.12->tun_dst,output:1"
        );
    }

    #[test]
    fn base_program_permits_arp_and_drops_rest() {
        assert_eq!(normal_arp_flow(), "table=0,priority=100,arp,actions=normal");
        assert_eq!(default_drop_flow(), "table=0,priority=0,actions=drop");
    }
}
