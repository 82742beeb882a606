//! Configuration management for the agent.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use ciccni_datapath::bridge::{
    OVS_DATAPATH_NETDEV, OVS_DATAPATH_SYSTEM, TUNNEL_TYPE_GENEVE, TUNNEL_TYPE_VXLAN,
};

/// Agent configuration, loaded from YAML. Every option has a default, so an
/// empty (or absent) file is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    /// UNIX socket the CNI shim connects to.
    pub cni_socket: String,
    /// Name of the OVS bridge the agent creates and uses. Make sure it does
    /// not conflict with an existing bridge.
    pub ovs_bridge: String,
    /// Datapath type for the bridge: "system" (kernel) or "netdev"
    /// (userspace).
    pub ovs_datapath_type: String,
    /// Name of the internal port pods use as their default gateway.
    pub host_gateway: String,
    /// Encapsulation for pod traffic across nodes: "vxlan" or "geneve".
    pub tunnel_type: String,
    /// MTU for the gateway and every pod interface; defaults leave room for
    /// the tunnel encapsulation overhead.
    #[serde(rename = "defaultMTU")]
    pub default_mtu: u32,
    /// Mount location of the host /proc directory. "/host" matches the
    /// DaemonSet mount; set "/" when running the agent directly on the host.
    pub host_proc_path_prefix: String,
    /// CIDR range for cluster services, as passed to kube-apiserver via
    /// --service-cluster-ip-range.
    #[serde(rename = "serviceCIDR")]
    pub service_cidr: String,
    /// Whether to run an IPSec (ESP) tunnel for cross-node pod traffic.
    /// Parsed for forward compatibility; the current datapath ignores it.
    #[serde(rename = "enableIPSecTunnel")]
    pub enable_ipsec_tunnel: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cni_socket: "/var/run/ciccni/cni.sock".to_string(),
            ovs_bridge: "br-int".to_string(),
            ovs_datapath_type: OVS_DATAPATH_SYSTEM.to_string(),
            host_gateway: "gw0".to_string(),
            tunnel_type: TUNNEL_TYPE_VXLAN.to_string(),
            default_mtu: 1450,
            host_proc_path_prefix: "/host".to_string(),
            service_cidr: "10.96.0.0/12".to_string(),
            enable_ipsec_tunnel: false,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            bail!("Config file not found: {}", path.display());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AgentConfig =
            serde_yaml::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Reject combinations the datapath cannot program.
    pub fn validate(&self) -> Result<()> {
        if self.tunnel_type != TUNNEL_TYPE_VXLAN && self.tunnel_type != TUNNEL_TYPE_GENEVE {
            bail!("tunnel type {} is invalid", self.tunnel_type);
        }
        if self.ovs_datapath_type != OVS_DATAPATH_SYSTEM
            && self.ovs_datapath_type != OVS_DATAPATH_NETDEV
        {
            bail!("OVS datapath type {} is not supported", self.ovs_datapath_type);
        }
        self.service_cidr
            .parse::<ipnet::Ipv4Net>()
            .with_context(|| format!("service CIDR {} is invalid", self.service_cidr))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AgentConfig::default();
        assert_eq!(config.cni_socket, "/var/run/ciccni/cni.sock");
        assert_eq!(config.ovs_bridge, "br-int");
        assert_eq!(config.ovs_datapath_type, "system");
        assert_eq!(config.host_gateway, "gw0");
        assert_eq!(config.tunnel_type, "vxlan");
        assert_eq!(config.default_mtu, 1450);
        assert_eq!(config.host_proc_path_prefix, "/host");
        assert_eq!(config.service_cidr, "10.96.0.0/12");
        assert!(!config.enable_ipsec_tunnel);
        config.validate().unwrap();
    }

    #[test]
    fn yaml_keys_use_the_documented_spelling() {
        let yaml = r#"
cniSocket: /tmp/test.sock
ovsBridge: br-test
ovsDatapathType: netdev
hostGateway: gw1
tunnelType: geneve
defaultMTU: 1400
hostProcPathPrefix: /
serviceCIDR: 10.100.0.0/16
enableIPSecTunnel: true
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cni_socket, "/tmp/test.sock");
        assert_eq!(config.ovs_bridge, "br-test");
        assert_eq!(config.ovs_datapath_type, "netdev");
        assert_eq!(config.host_gateway, "gw1");
        assert_eq!(config.tunnel_type, "geneve");
        assert_eq!(config.default_mtu, 1400);
        assert_eq!(config.host_proc_path_prefix, "/");
        assert_eq!(config.service_cidr, "10.100.0.0/16");
        assert!(config.enable_ipsec_tunnel);
        config.validate().unwrap();
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let config: AgentConfig = serde_yaml::from_str("ovsBridge: br-x\n").unwrap();
        assert_eq!(config.ovs_bridge, "br-x");
        assert_eq!(config.tunnel_type, "vxlan");
        assert_eq!(config.default_mtu, 1450);
    }

    #[test]
    fn invalid_tunnel_type_is_rejected() {
        let mut config = AgentConfig::default();
        config.tunnel_type = "gre".to_string();
        assert!(config.validate().is_err());
    }
}
