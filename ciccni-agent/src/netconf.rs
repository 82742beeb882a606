//! CNI network configuration and result types.
//!
//! The network configuration arrives as the raw stdin JSON the runtime gave
//! the shim. It is parsed twice: once into [`NetworkConfig`] for the fields
//! the agent acts on, and once as a plain JSON value when the IPAM subnet is
//! pinned, so fields the agent does not know about survive the round trip to
//! the delegated plugin.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// CNI spec versions the agent accepts.
pub const SUPPORTED_CNI_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Result version the delegated IPAM plugin is asked to produce.
pub const CURRENT_CNI_VERSION: &str = "1.0.0";

// ============================================================================
// Network configuration (CNI stdin)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub config_type: String,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub dns: Dns,
    #[serde(default)]
    pub ipam: IpamConfig,
}

impl NetworkConfig {
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    pub fn is_version_supported(&self) -> bool {
        SUPPORTED_CNI_VERSIONS
            .iter()
            .any(|version| *version == self.cni_version)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IpamConfig {
    #[serde(rename = "type", default)]
    pub ipam_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Rewrite the raw network config so `ipam.subnet` is the local pod CIDR.
/// Unknown fields pass through untouched.
pub fn pin_ipam_subnet(raw: &[u8], subnet: Ipv4Net) -> Result<Vec<u8>, serde_json::Error> {
    let mut config: Value = serde_json::from_slice(raw)?;
    if !config.is_object() {
        config = Value::Object(serde_json::Map::new());
    }
    let ipam = config
        .as_object_mut()
        .expect("network config is an object")
        .entry("ipam")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Some(ipam) = ipam.as_object_mut() {
        ipam.insert("subnet".to_string(), Value::String(subnet.to_string()));
    }
    serde_json::to_vec(&config)
}

// ============================================================================
// Kubernetes CNI_ARGS
// ============================================================================

/// The K8s-specific key/value pairs kubelet packs into CNI_ARGS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct K8sArgs {
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_infra_container_id: String,
}

/// Parse the semicolon-separated `KEY=value` CNI_ARGS string.
pub fn parse_k8s_args(args: &str) -> Result<K8sArgs, String> {
    let mut parsed = K8sArgs::default();
    for pair in args.split(';').filter(|pair| !pair.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(format!("malformed CNI_ARGS entry {pair:?}"));
        };
        match key {
            "K8S_POD_NAME" => parsed.pod_name = value.to_string(),
            "K8S_POD_NAMESPACE" => parsed.pod_namespace = value.to_string(),
            "K8S_POD_INFRA_CONTAINER_ID" => parsed.pod_infra_container_id = value.to_string(),
            // IgnoreUnknown and friends
            _ => {}
        }
    }
    if parsed.pod_name.is_empty() || parsed.pod_namespace.is_empty() {
        return Err("CNI_ARGS is missing K8S_POD_NAME or K8S_POD_NAMESPACE".to_string());
    }
    Ok(parsed)
}

// ============================================================================
// CNI result
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CniResult {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<CniInterface>,
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CniInterface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IpConfig {
    /// Index into `interfaces`; the container end is always index 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// Address in CIDR notation, e.g. "10.244.1.2/24".
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// "4"/"6" discriminator used by pre-1.0 result formats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl IpConfig {
    pub fn parse_v4(&self) -> Option<(Ipv4Addr, Ipv4Net)> {
        let net: Ipv4Net = self.address.parse().ok()?;
        Some((net.addr(), net))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RouteConfig {
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// First usable host address of a network; pods use it as their gateway.
pub fn first_host(network: Ipv4Net) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(network.network()) + 1)
}

/// Adjust the raw IPAM result for this datapath:
/// - every IP entry references the container interface (index 1),
/// - a missing gateway defaults to the first host address of its network,
/// - a result without a default route gets `0.0.0.0/0` via the node gateway.
pub fn rewrite_ipam_result(result: &mut CniResult, node_gateway: Ipv4Addr) -> Result<(), String> {
    for ip in &mut result.ips {
        ip.interface = Some(1);
        if ip.gateway.is_none() {
            let (_, network) = ip
                .parse_v4()
                .ok_or_else(|| format!("unparseable IP entry {:?}", ip.address))?;
            ip.gateway = Some(first_host(network).to_string());
        }
    }

    let has_default_route = result
        .routes
        .iter()
        .any(|route| route.dst == "0.0.0.0/0" || route.dst == "0.0.0.0/0.0.0.0");
    if !has_default_route {
        result.routes.push(RouteConfig {
            dst: "0.0.0.0/0".to_string(),
            gw: Some(node_gateway.to_string()),
        });
    }
    Ok(())
}

/// Serialize a result in the version the client asked for. The structural
/// difference the agent has to care about is the `version` discriminator on
/// IP entries, which pre-1.0 formats require and 1.0 dropped.
pub fn serialize_result_as_version(
    result: &CniResult,
    requested_version: &str,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = result.clone();
    out.cni_version = requested_version.to_string();
    let pre_1_0 = requested_version.starts_with("0.");
    for ip in &mut out.ips {
        ip.version = pre_1_0.then(|| "4".to_string());
    }
    serde_json::to_vec(&out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STDIN: &[u8] = br#"{
        "cniVersion": "0.4.0",
        "name": "ciccni",
        "type": "ciccni",
        "ipam": {"type": "host-local", "dataDir": "/var/lib/cni"},
        "mtu": 1450
    }"#;

    #[test]
    fn parses_network_config() {
        let config = NetworkConfig::parse(STDIN).unwrap();
        assert_eq!(config.cni_version, "0.4.0");
        assert_eq!(config.config_type, "ciccni");
        assert_eq!(config.ipam.ipam_type, "host-local");
        assert_eq!(config.mtu, 1450);
        assert!(config.is_version_supported());
    }

    #[test]
    fn rejects_unknown_versions() {
        let config = NetworkConfig {
            cni_version: "0.2.0".to_string(),
            ..Default::default()
        };
        assert!(!config.is_version_supported());
    }

    #[test]
    fn pinning_preserves_unknown_fields() {
        let subnet: Ipv4Net = "10.244.1.0/24".parse().unwrap();
        let pinned = pin_ipam_subnet(STDIN, subnet).unwrap();
        let value: Value = serde_json::from_slice(&pinned).unwrap();
        assert_eq!(value["ipam"]["subnet"], "10.244.1.0/24");
        // the field the agent does not model survives
        assert_eq!(value["ipam"]["dataDir"], "/var/lib/cni");
        assert_eq!(value["name"], "ciccni");
    }

    #[test]
    fn parses_k8s_args() {
        let args = parse_k8s_args(
            "IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=web-0;\
             K8S_POD_INFRA_CONTAINER_ID=abc123",
        )
        .unwrap();
        assert_eq!(args.pod_name, "web-0");
        assert_eq!(args.pod_namespace, "default");
        assert_eq!(args.pod_infra_container_id, "abc123");
    }

    #[test]
    fn k8s_args_require_pod_identity() {
        assert!(parse_k8s_args("IgnoreUnknown=1").is_err());
        assert!(parse_k8s_args("K8S_POD_NAME").is_err());
    }

    #[test]
    fn rewrite_pins_interface_and_defaults_gateway() {
        let mut result = CniResult {
            cni_version: CURRENT_CNI_VERSION.to_string(),
            ips: vec![IpConfig {
                address: "10.244.1.2/24".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        rewrite_ipam_result(&mut result, "10.244.1.1".parse().unwrap()).unwrap();

        assert_eq!(result.ips[0].interface, Some(1));
        assert_eq!(result.ips[0].gateway.as_deref(), Some("10.244.1.1"));
        assert_eq!(result.routes.len(), 1);
        assert_eq!(result.routes[0].dst, "0.0.0.0/0");
        assert_eq!(result.routes[0].gw.as_deref(), Some("10.244.1.1"));
    }

    #[test]
    fn rewrite_keeps_existing_default_route() {
        let mut result = CniResult {
            ips: vec![IpConfig {
                address: "10.244.1.2/24".to_string(),
                gateway: Some("10.244.1.254".to_string()),
                ..Default::default()
            }],
            routes: vec![RouteConfig {
                dst: "0.0.0.0/0".to_string(),
                gw: Some("10.244.1.254".to_string()),
            }],
            ..Default::default()
        };
        rewrite_ipam_result(&mut result, "10.244.1.1".parse().unwrap()).unwrap();
        assert_eq!(result.routes.len(), 1);
        assert_eq!(result.ips[0].gateway.as_deref(), Some("10.244.1.254"));
    }

    #[test]
    fn versioned_serialization_toggles_ip_version_field() {
        let result = CniResult {
            cni_version: CURRENT_CNI_VERSION.to_string(),
            ips: vec![IpConfig {
                interface: Some(1),
                address: "10.244.1.2/24".to_string(),
                gateway: Some("10.244.1.1".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };

        let old = serialize_result_as_version(&result, "0.4.0").unwrap();
        let old: Value = serde_json::from_slice(&old).unwrap();
        assert_eq!(old["cniVersion"], "0.4.0");
        assert_eq!(old["ips"][0]["version"], "4");

        let current = serialize_result_as_version(&result, "1.0.0").unwrap();
        let current: Value = serde_json::from_slice(&current).unwrap();
        assert_eq!(current["cniVersion"], "1.0.0");
        assert!(current["ips"][0].get("version").is_none());
    }

    #[test]
    fn first_host_is_network_plus_one() {
        let net: Ipv4Net = "10.244.1.0/24".parse().unwrap();
        assert_eq!(first_host(net), Ipv4Addr::new(10, 244, 1, 1));

        let wide: Ipv4Net = "10.244.0.0/16".parse().unwrap();
        assert_eq!(first_host(wide), Ipv4Addr::new(10, 244, 0, 1));
    }
}
