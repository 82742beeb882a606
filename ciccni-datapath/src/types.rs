//! Type definitions for the interfaces the agent owns on the OVS bridge.

use std::collections::HashMap;
use std::net::Ipv4Addr;

/// External-ID keys stamped onto container ports so that a restarted agent
/// (or an operator with ovs-vsctl) can tell which pod a port belongs to.
pub const OVS_EXTERNAL_ID_MAC: &str = "attached-mac";
pub const OVS_EXTERNAL_ID_IP: &str = "ip-address";
pub const OVS_EXTERNAL_ID_CONTAINER_ID: &str = "container-id";
pub const OVS_EXTERNAL_ID_POD_NAME: &str = "pod-name";
pub const OVS_EXTERNAL_ID_POD_NAMESPACE: &str = "pod-namespace";

/// What kind of port an interface entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    /// A pod's veth, host side attached to the bridge.
    Container,
    /// The VXLAN/Geneve tunnel port.
    Tunnel,
    /// The internal port pods use as their default gateway.
    HostGateway,
}

/// OVSDB identity of a bridge port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvsPortConfig {
    pub iface_name: String,
    pub port_uuid: String,
    pub of_port: i32,
}

/// One interface owned by the agent: the tunnel, the host gateway, or a
/// container veth. Stored in the [`InterfaceStore`](crate::InterfaceStore)
/// keyed by interface name.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Tunnel name, gateway name, or container ID.
    pub id: String,
    pub iface_type: InterfaceType,
    pub ip: Option<Ipv4Addr>,
    pub mac: Option<String>,
    pub pod_name: String,
    pub pod_namespace: String,
    /// Container netns path; empty for tunnel and gateway entries.
    pub netns: String,
    pub ovs_port: Option<OvsPortConfig>,
}

impl InterfaceConfig {
    pub fn new_tunnel(tunnel_name: &str) -> Self {
        Self {
            id: tunnel_name.to_string(),
            iface_type: InterfaceType::Tunnel,
            ip: None,
            mac: None,
            pod_name: String::new(),
            pod_namespace: String::new(),
            netns: String::new(),
            ovs_port: None,
        }
    }

    pub fn new_host_gateway(gateway_name: &str, ip: Ipv4Addr, mac: String) -> Self {
        Self {
            id: gateway_name.to_string(),
            iface_type: InterfaceType::HostGateway,
            ip: Some(ip),
            mac: Some(mac),
            pod_name: String::new(),
            pod_namespace: String::new(),
            netns: String::new(),
            ovs_port: None,
        }
    }

    pub fn new_container(
        container_id: &str,
        pod_name: &str,
        pod_namespace: &str,
        netns: &str,
        mac: String,
        ip: Ipv4Addr,
    ) -> Self {
        Self {
            id: container_id.to_string(),
            iface_type: InterfaceType::Container,
            ip: Some(ip),
            mac: Some(mac),
            pod_name: pod_name.to_string(),
            pod_namespace: pod_namespace.to_string(),
            netns: netns.to_string(),
            ovs_port: None,
        }
    }

    /// External-IDs stamped onto the OVS port of a container interface.
    pub fn build_ovs_port_external_ids(&self) -> HashMap<String, String> {
        let mut ids = HashMap::new();
        ids.insert(
            OVS_EXTERNAL_ID_MAC.to_string(),
            self.mac.clone().unwrap_or_default(),
        );
        ids.insert(
            OVS_EXTERNAL_ID_IP.to_string(),
            self.ip.map(|ip| ip.to_string()).unwrap_or_default(),
        );
        ids.insert(OVS_EXTERNAL_ID_CONTAINER_ID.to_string(), self.id.clone());
        ids.insert(OVS_EXTERNAL_ID_POD_NAME.to_string(), self.pod_name.clone());
        ids.insert(
            OVS_EXTERNAL_ID_POD_NAMESPACE.to_string(),
            self.pod_namespace.clone(),
        );
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_external_ids_carry_identity() {
        let config = InterfaceConfig::new_container(
            "c-123",
            "web-0",
            "default",
            "/proc/42/ns/net",
            "aa:bb:cc:dd:ee:ff".to_string(),
            Ipv4Addr::new(10, 244, 1, 2),
        );
        let ids = config.build_ovs_port_external_ids();
        assert_eq!(ids[OVS_EXTERNAL_ID_CONTAINER_ID], "c-123");
        assert_eq!(ids[OVS_EXTERNAL_ID_POD_NAME], "web-0");
        assert_eq!(ids[OVS_EXTERNAL_ID_POD_NAMESPACE], "default");
        assert_eq!(ids[OVS_EXTERNAL_ID_MAC], "aa:bb:cc:dd:ee:ff");
        assert_eq!(ids[OVS_EXTERNAL_ID_IP], "10.244.1.2");
    }
}
