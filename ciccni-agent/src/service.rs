//! CNI gRPC service implementation.
//!
//! Each handler decodes the request, walks its state machine, and maps any
//! failure to the closed CNI error-code set at this boundary - lower layers
//! return typed errors and never log-and-return.
//!
//! The ADD handler threads a [`Rollback`] stack through its steps: every
//! side effect pushes an undo closure, the stack is drained in reverse
//! before an error reply goes out, and if the request future is dropped
//! mid-flight (client cancellation) the drop handler spawns the same undos.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::Future;
use ipnet::Ipv4Net;
use rtnetlink::Handle;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument, warn};

use ciccni_datapath::link::{
    self, generate_container_interface_name, AssignedAddress, AssignedRoute, Netns,
};
use ciccni_datapath::tc;
use ciccni_datapath::{InterfaceConfig, InterfaceStore, OvsBridgeClient, OvsPortConfig};
use ciccni_proto::{Cni, CniCmdArgs, CniCmdRequest, CniCmdResponse, ErrorCode};

use crate::bootstrap::NodeConfig;
use crate::config::AgentConfig;
use crate::ipam::IpamRegistry;
use crate::k8s::ControlPlane;
use crate::netconf::{
    parse_k8s_args, pin_ipam_subnet, rewrite_ipam_result, serialize_result_as_version,
    CniInterface, K8sArgs, NetworkConfig,
};

/// CNI request service.
pub struct CniService {
    node: NodeConfig,
    config: AgentConfig,
    bridge: Arc<dyn OvsBridgeClient>,
    store: Arc<InterfaceStore>,
    control_plane: Arc<dyn ControlPlane>,
    ipam: Arc<IpamRegistry>,
    netlink: Handle,
}

impl CniService {
    pub fn new(
        node: NodeConfig,
        config: AgentConfig,
        bridge: Arc<dyn OvsBridgeClient>,
        store: Arc<InterfaceStore>,
        control_plane: Arc<dyn ControlPlane>,
        ipam: Arc<IpamRegistry>,
        netlink: Handle,
    ) -> Self {
        Self {
            node,
            config,
            bridge,
            store,
            control_plane,
            ipam,
            netlink,
        }
    }

    // ========================================================================
    // ADD
    // ========================================================================

    async fn handle_add(&self, args: &CniCmdArgs) -> Result<Vec<u8>, CniError> {
        // 1. Decode network config and Kubernetes args.
        let net_config = NetworkConfig::parse(&args.network_configuration).map_err(|e| {
            CniError::new(
                ErrorCode::DecodingFailure,
                format!("invalid network config: {e}"),
            )
        })?;
        let k8s = parse_k8s_args(&args.args)
            .map_err(|e| CniError::new(ErrorCode::DecodingFailure, e))?;

        // 2. Version gate.
        if !net_config.is_version_supported() {
            return Err(CniError::new(
                ErrorCode::UnsupportedField,
                format!("unsupported cniVersion {:?}", net_config.cni_version),
            ));
        }

        let mut rollback = Rollback::new();

        // 3. IPAM ADD, with the subnet pinned to this node's pod CIDR.
        let driver = self.ipam.driver(&net_config.ipam.ipam_type).map_err(|e| {
            CniError::new(ErrorCode::InvalidNetworkConfig, e.to_string())
        })?;
        let pinned = pin_ipam_subnet(&args.network_configuration, self.node.pod_cidr)
            .map_err(|e| CniError::new(ErrorCode::InvalidNetworkConfig, e.to_string()))?;
        let mut result = match driver.add(args, &pinned).await {
            Ok(result) => result,
            Err(e) => {
                return Err(abort(rollback, ErrorCode::IpamFailure, format!("IPAM ADD: {e}"))
                    .await)
            }
        };
        {
            let driver = Arc::clone(&driver);
            let args = args.clone();
            let pinned = pinned.clone();
            rollback.push("release IPAM allocation", move || async move {
                if let Err(e) = driver.del(&args, &pinned).await {
                    error!(error = %e, "Rollback: IPAM DEL failed");
                }
            });
        }

        // 4. Rewrite the result for this datapath.
        if let Err(e) = rewrite_ipam_result(&mut result, self.node.gateway.ip) {
            return Err(abort(rollback, ErrorCode::InvalidNetworkConfig, e).await);
        }
        let Some((pod_ip, _)) = result.ips.iter().find_map(|ip| ip.parse_v4()) else {
            return Err(abort(
                rollback,
                ErrorCode::InvalidNetworkConfig,
                "IPAM result carried no IPv4 address".to_string(),
            )
            .await);
        };

        // 5. Resolve the container netns through the host proc mount.
        let netns_path = format!("{}{}", self.config.host_proc_path_prefix, args.netns);
        let netns = match Netns::open(&netns_path) {
            Ok(netns) => netns,
            Err(e) => {
                return Err(abort(
                    rollback,
                    ErrorCode::ConfigInterfaceFailure,
                    format!("opening netns {netns_path}: {e}"),
                )
                .await)
            }
        };

        // 6. Veth pair bridging the container netns and the host.
        let host_veth_name = generate_container_interface_name(&k8s.pod_name, &k8s.pod_namespace);
        let mtu = if net_config.mtu > 0 {
            net_config.mtu
        } else {
            self.config.default_mtu
        };
        let pair = match link::setup_veth_pair(
            &self.netlink,
            &netns,
            &args.ifname,
            &host_veth_name,
            mtu,
        )
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                return Err(abort(
                    rollback,
                    ErrorCode::ConfigInterfaceFailure,
                    format!("creating veth pair: {e}"),
                )
                .await)
            }
        };
        {
            let netns_path = netns_path.clone();
            let ifname = args.ifname.clone();
            rollback.push("delete container veth", move || async move {
                match Netns::open(&netns_path) {
                    Ok(netns) => {
                        if let Err(e) = link::delete_interface(&netns, &ifname).await {
                            error!(error = %e, "Rollback: deleting container veth failed");
                        }
                    }
                    Err(e) => debug!(error = %e, "Rollback: netns already gone"),
                }
            });
        }

        // 7. Egress shaping from the pod annotation. Best-effort: the
        //    network works without shaping.
        if let Err(e) = self.configure_egress_shaping(&k8s, &netns, &args.ifname).await {
            warn!(
                pod = %k8s.pod_name,
                namespace = %k8s.pod_namespace,
                error = %e,
                "Egress shaping not applied"
            );
        }

        // 8. OVS port for the host-side veth, stamped with the pod identity.
        let mut iface = InterfaceConfig::new_container(
            &args.container_id,
            &k8s.pod_name,
            &k8s.pod_namespace,
            &netns_path,
            pair.container.mac_string(),
            pod_ip,
        );
        let external_ids = iface.build_ovs_port_external_ids();
        let port_uuid = match self
            .bridge
            .create_port(&host_veth_name, &host_veth_name, &external_ids)
            .await
        {
            Ok(uuid) => uuid,
            Err(e) => {
                return Err(abort(
                    rollback,
                    ErrorCode::ConfigInterfaceFailure,
                    format!("creating OVS port {host_veth_name}: {e}"),
                )
                .await)
            }
        };
        {
            let bridge = Arc::clone(&self.bridge);
            let uuid = port_uuid.clone();
            rollback.push("delete OVS port", move || async move {
                if let Err(e) = bridge.delete_port(&uuid).await {
                    error!(error = %e, "Rollback: deleting OVS port failed");
                }
            });
        }

        // 9. Assign addresses, install result routes, announce via ARP.
        let (addresses, routes) = collect_assignments(&result);
        if let Err(e) =
            link::configure_container_addr(&netns, &args.ifname, &addresses, &routes).await
        {
            return Err(abort(
                rollback,
                ErrorCode::ConfigInterfaceFailure,
                format!("configuring container address: {e}"),
            )
            .await);
        }

        // 11. Serialize the reply in the version the client requested...
        result.interfaces = vec![
            CniInterface {
                name: host_veth_name.clone(),
                mac: Some(pair.host.mac_string()),
                sandbox: None,
            },
            CniInterface {
                name: args.ifname.clone(),
                mac: Some(pair.container.mac_string()),
                sandbox: Some(args.netns.clone()),
            },
        ];
        let reply = match serialize_result_as_version(&result, &net_config.cni_version) {
            Ok(reply) => reply,
            Err(e) => {
                return Err(abort(
                    rollback,
                    ErrorCode::Unknown,
                    format!("serializing result: {e}"),
                )
                .await)
            }
        };

        // 10. ...and only now make the pod visible to other operations.
        iface.ovs_port = Some(OvsPortConfig {
            iface_name: host_veth_name.clone(),
            port_uuid,
            of_port: 0,
        });
        self.store.add_interface(&host_veth_name, iface);
        rollback.commit();

        info!(
            pod = %k8s.pod_name,
            namespace = %k8s.pod_namespace,
            ip = %pod_ip,
            host_veth = %host_veth_name,
            "Configured pod network"
        );
        Ok(reply)
    }

    /// Read the egress-rate annotation and program the HTB limiter on the
    /// container-side veth.
    async fn configure_egress_shaping(
        &self,
        k8s: &K8sArgs,
        netns: &Netns,
        ifname: &str,
    ) -> anyhow::Result<()> {
        let Some(rate) = self
            .control_plane
            .pod_egress_rate(&k8s.pod_namespace, &k8s.pod_name)
            .await?
        else {
            return Ok(());
        };

        let rate_bps = tc::validate_bandwidth(&rate)?;
        let tc_args = tc::TcArgs {
            rate: rate_bps,
            burst: rate_bps / 10,
        };
        let ifname = ifname.to_string();
        let pod_network = self.node.cluster_cidr;
        netns
            .run_sync(move || tc::setup_egress_limit(&ifname, &tc_args, pod_network))
            .await?;
        info!(rate_bps, "Configured egress shaping");
        Ok(())
    }

    // ========================================================================
    // DEL
    // ========================================================================

    async fn handle_del(&self, args: &CniCmdArgs) -> Result<(), CniError> {
        // 1. Decode; same mapping as ADD.
        let net_config = NetworkConfig::parse(&args.network_configuration).map_err(|e| {
            CniError::new(
                ErrorCode::DecodingFailure,
                format!("invalid network config: {e}"),
            )
        })?;
        let k8s = parse_k8s_args(&args.args)
            .map_err(|e| CniError::new(ErrorCode::DecodingFailure, e))?;

        // The deletion is attempted to completion even when a step fails;
        // the first failure decides the reply.
        let mut first_error: Option<CniError> = None;

        // 2. Release the IPAM allocation.
        match self.ipam.driver(&net_config.ipam.ipam_type) {
            Ok(driver) => {
                let pinned = pin_ipam_subnet(&args.network_configuration, self.node.pod_cidr)
                    .unwrap_or_else(|_| args.network_configuration.clone());
                if let Err(e) = driver.del(args, &pinned).await {
                    error!(error = %e, "IPAM DEL failed");
                    first_error.get_or_insert(CniError::new(
                        ErrorCode::IpamFailure,
                        format!("IPAM DEL: {e}"),
                    ));
                }
            }
            Err(e) => {
                first_error.get_or_insert(CniError::new(
                    ErrorCode::IpamFailure,
                    e.to_string(),
                ));
            }
        }

        // 3. Remove the container-side veth, tolerating absence.
        if !args.netns.is_empty() {
            let netns_path = format!("{}{}", self.config.host_proc_path_prefix, args.netns);
            match Netns::open(&netns_path) {
                Ok(netns) => {
                    if let Err(e) = link::delete_interface(&netns, &args.ifname).await {
                        error!(error = %e, "Deleting container veth failed");
                        first_error.get_or_insert(CniError::new(
                            ErrorCode::ConfigInterfaceFailure,
                            format!("deleting container veth: {e}"),
                        ));
                    }
                }
                // The namespace is gone, and its links with it.
                Err(e) => debug!(error = %e, "Container netns already gone"),
            }
        }

        // 4. Index lookup; a miss is not an error.
        let host_veth_name = generate_container_interface_name(&k8s.pod_name, &k8s.pod_namespace);
        if let Some(iface) = self.store.get_interface(&host_veth_name) {
            // 5. Delete the OVS port. On failure the index entry stays so a
            //    retried DEL finds it again.
            if let Some(port) = &iface.ovs_port {
                if let Err(e) = self.bridge.delete_port(&port.port_uuid).await {
                    return Err(first_error.unwrap_or_else(|| {
                        CniError::new(
                            ErrorCode::ConfigInterfaceFailure,
                            format!("deleting OVS port {}: {e}", port.port_uuid),
                        )
                    }));
                }
            }
            // 6. Drop the index entry.
            self.store.delete_interface(&host_veth_name);
            info!(
                pod = %k8s.pod_name,
                namespace = %k8s.pod_namespace,
                host_veth = %host_veth_name,
                "Removed pod network"
            );
        } else {
            debug!(
                container_id = %args.container_id,
                "Unknown container, treating DEL as success"
            );
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ========================================================================
    // CHECK
    // ========================================================================

    async fn handle_check(&self, args: &CniCmdArgs) -> Result<(), CniError> {
        NetworkConfig::parse(&args.network_configuration).map_err(|e| {
            CniError::new(
                ErrorCode::DecodingFailure,
                format!("invalid network config: {e}"),
            )
        })?;
        let k8s = parse_k8s_args(&args.args)
            .map_err(|e| CniError::new(ErrorCode::DecodingFailure, e))?;

        let host_veth_name = generate_container_interface_name(&k8s.pod_name, &k8s.pod_namespace);
        if self.store.get_interface(&host_veth_name).is_some() {
            Ok(())
        } else {
            Err(CniError::new(
                ErrorCode::CheckInterfaceFailure,
                format!("no interface entry for container {}", args.container_id),
            ))
        }
    }
}

/// Addresses and routes from the rewritten result, in programmable form.
/// Entries that do not parse as IPv4 are skipped.
fn collect_assignments(
    result: &crate::netconf::CniResult,
) -> (Vec<AssignedAddress>, Vec<AssignedRoute>) {
    let addresses = result
        .ips
        .iter()
        .filter_map(|ip| {
            let (address, network) = ip.parse_v4()?;
            Some(AssignedAddress {
                address,
                prefix_len: network.prefix_len(),
            })
        })
        .collect();
    let routes = result
        .routes
        .iter()
        .filter_map(|route| {
            let destination: Ipv4Net = route.dst.parse().ok()?;
            let gateway = route.gw.as_ref().and_then(|gw| gw.parse().ok());
            Some(AssignedRoute {
                destination,
                gateway,
            })
        })
        .collect();
    (addresses, routes)
}

// ============================================================================
// tonic service glue
// ============================================================================

#[tonic::async_trait]
impl Cni for CniService {
    #[instrument(skip(self, request), fields(container_id))]
    async fn cmd_add(
        &self,
        request: Request<CniCmdRequest>,
    ) -> Result<Response<CniCmdResponse>, Status> {
        let request = request.into_inner();
        let Some(args) = request.cni_args else {
            return Ok(Response::new(error_response(
                ErrorCode::DecodingFailure,
                "request carried no CNI args",
            )));
        };
        tracing::Span::current().record("container_id", args.container_id.as_str());
        debug!("CNI ADD");

        match self.handle_add(&args).await {
            Ok(result) => Ok(Response::new(CniCmdResponse {
                cni_result: result,
                error: None,
            })),
            Err(e) => Ok(Response::new(e.into_response())),
        }
    }

    #[instrument(skip(self, request), fields(container_id))]
    async fn cmd_check(
        &self,
        request: Request<CniCmdRequest>,
    ) -> Result<Response<CniCmdResponse>, Status> {
        let request = request.into_inner();
        let Some(args) = request.cni_args else {
            return Ok(Response::new(error_response(
                ErrorCode::DecodingFailure,
                "request carried no CNI args",
            )));
        };
        tracing::Span::current().record("container_id", args.container_id.as_str());
        debug!("CNI CHECK");

        match self.handle_check(&args).await {
            Ok(()) => Ok(Response::new(CniCmdResponse::default())),
            Err(e) => Ok(Response::new(e.into_response())),
        }
    }

    #[instrument(skip(self, request), fields(container_id))]
    async fn cmd_del(
        &self,
        request: Request<CniCmdRequest>,
    ) -> Result<Response<CniCmdResponse>, Status> {
        let request = request.into_inner();
        let Some(args) = request.cni_args else {
            return Ok(Response::new(error_response(
                ErrorCode::DecodingFailure,
                "request carried no CNI args",
            )));
        };
        tracing::Span::current().record("container_id", args.container_id.as_str());
        debug!("CNI DEL");

        match self.handle_del(&args).await {
            Ok(()) => Ok(Response::new(CniCmdResponse::default())),
            Err(e) => Ok(Response::new(e.into_response())),
        }
    }
}

// ============================================================================
// Error mapping
// ============================================================================

#[derive(Debug)]
struct CniError {
    code: ErrorCode,
    message: String,
}

impl CniError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn into_response(self) -> CniCmdResponse {
        error_response(self.code, &self.message)
    }
}

fn error_response(code: ErrorCode, message: &str) -> CniCmdResponse {
    CniCmdResponse {
        cni_result: Vec::new(),
        error: Some(ciccni_proto::Error {
            code: code as i32,
            message: message.to_string(),
        }),
    }
}

/// Drain the rollback stack, then hand back the error to reply with.
async fn abort(rollback: Rollback, code: ErrorCode, message: String) -> CniError {
    error!(code = ?code, message, "CNI request failed, rolling back");
    rollback.run().await;
    CniError::new(code, message)
}

// ============================================================================
// Rollback stack
// ============================================================================

type UndoFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Reverse-order undo stack for the ADD state machine.
///
/// `run` drains the stack awaiting each undo (the error path); dropping an
/// uncommitted stack - which happens when the request future is cancelled -
/// spawns the undos instead, since there is nothing left to await them.
struct Rollback {
    undos: Vec<(&'static str, UndoFn)>,
    committed: bool,
}

impl Rollback {
    fn new() -> Self {
        Self {
            undos: Vec::new(),
            committed: false,
        }
    }

    fn push<F, Fut>(&mut self, step: &'static str, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.undos.push((step, Box::new(move || Box::pin(undo()))));
    }

    /// The call succeeded; nothing to undo.
    fn commit(mut self) {
        self.committed = true;
        self.undos.clear();
    }

    /// Undo every recorded step, newest first.
    async fn run(mut self) {
        self.committed = true;
        let undos = std::mem::take(&mut self.undos);
        for (step, undo) in undos.into_iter().rev() {
            warn!(step, "Rolling back");
            undo().await;
        }
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for (step, undo) in self.undos.drain(..).rev() {
            warn!(step, "Rolling back after cancellation");
            tokio::spawn(undo());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use ciccni_datapath::{DatapathError, OvsPortData};
    use ciccni_proto::CniCmdArgs;

    use crate::bootstrap::GatewayConfig;
    use crate::ipam::{IpamDriver, IpamError};
    use crate::k8s::ClusterNode;
    use crate::netconf::{CniResult, IpConfig};

    // ------------------------------------------------------------------
    // Mocks
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct MockBridge {
        fail_create_port: bool,
        created: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OvsBridgeClient for MockBridge {
        async fn create(&self) -> ciccni_datapath::Result<()> {
            Ok(())
        }
        async fn create_port(
            &self,
            name: &str,
            _if_dev: &str,
            _external_ids: &std::collections::HashMap<String, String>,
        ) -> ciccni_datapath::Result<String> {
            if self.fail_create_port {
                return Err(DatapathError::OvsdbTransaction("constraint violation".into()));
            }
            self.created.lock().unwrap().push(name.to_string());
            Ok(format!("uuid-{name}"))
        }
        async fn create_internal_port(
            &self,
            name: &str,
            _of_port_request: i32,
        ) -> ciccni_datapath::Result<String> {
            Ok(format!("uuid-{name}"))
        }
        async fn create_vxlan_port(
            &self,
            name: &str,
            _of_port_request: i32,
            _remote_ip: &str,
        ) -> ciccni_datapath::Result<String> {
            Ok(format!("uuid-{name}"))
        }
        async fn create_geneve_port(
            &self,
            name: &str,
            _of_port_request: i32,
            _remote_ip: &str,
        ) -> ciccni_datapath::Result<String> {
            Ok(format!("uuid-{name}"))
        }
        async fn delete_port(&self, port_uuid: &str) -> ciccni_datapath::Result<()> {
            self.deleted.lock().unwrap().push(port_uuid.to_string());
            Ok(())
        }
        async fn get_of_port(&self, _if_name: &str) -> ciccni_datapath::Result<i32> {
            Ok(1)
        }
        async fn get_port_list(&self) -> ciccni_datapath::Result<Vec<OvsPortData>> {
            Ok(Vec::new())
        }
        async fn set_interface_mtu(&self, _name: &str, _mtu: u32) -> ciccni_datapath::Result<()> {
            Ok(())
        }
    }

    struct MockControlPlane;

    #[async_trait]
    impl ControlPlane for MockControlPlane {
        async fn node_pod_cidr(&self, _node_name: &str) -> anyhow::Result<Ipv4Net> {
            Ok("10.244.1.0/24".parse().unwrap())
        }
        async fn cluster_pod_cidr(&self) -> anyhow::Result<Ipv4Net> {
            Ok("10.244.0.0/16".parse().unwrap())
        }
        async fn list_nodes(&self) -> anyhow::Result<Vec<ClusterNode>> {
            Ok(Vec::new())
        }
        async fn pod_egress_rate(
            &self,
            _namespace: &str,
            _pod_name: &str,
        ) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct MockIpam {
        fail_add: bool,
        deletes: Mutex<usize>,
    }

    #[async_trait]
    impl IpamDriver for MockIpam {
        async fn add(
            &self,
            _args: &CniCmdArgs,
            _network_config: &[u8],
        ) -> Result<CniResult, IpamError> {
            if self.fail_add {
                return Err(IpamError::PluginFailed("no addresses left".into()));
            }
            Ok(CniResult {
                cni_version: "1.0.0".to_string(),
                ips: vec![IpConfig {
                    address: "10.244.1.2/24".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            })
        }
        async fn del(&self, _args: &CniCmdArgs, _network_config: &[u8]) -> Result<(), IpamError> {
            *self.deletes.lock().unwrap() += 1;
            Ok(())
        }
        async fn check(&self, _args: &CniCmdArgs, _network_config: &[u8]) -> Result<(), IpamError> {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Harness
    // ------------------------------------------------------------------

    struct Harness {
        service: CniService,
        bridge: Arc<MockBridge>,
        ipam: Arc<MockIpam>,
        store: Arc<InterfaceStore>,
    }

    async fn harness(bridge: MockBridge, ipam: MockIpam) -> Harness {
        let (connection, netlink, _) = rtnetlink::new_connection().unwrap();
        tokio::spawn(connection);

        let bridge = Arc::new(bridge);
        let ipam_driver = Arc::new(ipam);
        let store = Arc::new(InterfaceStore::new());

        let mut registry = IpamRegistry::new();
        registry
            .register("host-local", ipam_driver.clone() as Arc<dyn IpamDriver>)
            .unwrap();

        let node = NodeConfig {
            node_name: "n1".to_string(),
            pod_cidr: "10.244.1.0/24".parse().unwrap(),
            cluster_cidr: "10.244.0.0/16".parse().unwrap(),
            gateway: GatewayConfig {
                name: "gw0".to_string(),
                ip: Ipv4Addr::new(10, 244, 1, 1),
                mac: "aa:bb:cc:dd:ee:ff".to_string(),
            },
        };
        let mut config = AgentConfig::default();
        // No /host mount in tests; netns resolution lands on paths that do
        // not exist.
        config.host_proc_path_prefix = "/nonexistent".to_string();

        let service = CniService::new(
            node,
            config,
            bridge.clone() as Arc<dyn OvsBridgeClient>,
            store.clone(),
            Arc::new(MockControlPlane),
            Arc::new(registry),
            netlink,
        );
        Harness {
            service,
            bridge,
            ipam: ipam_driver,
            store,
        }
    }

    fn request(container_id: &str, netns: &str) -> Request<CniCmdRequest> {
        Request::new(CniCmdRequest {
            cni_args: Some(CniCmdArgs {
                container_id: container_id.to_string(),
                netns: netns.to_string(),
                ifname: "eth0".to_string(),
                args: "K8S_POD_NAMESPACE=default;K8S_POD_NAME=web-0".to_string(),
                path: "/opt/cni/bin".to_string(),
                network_configuration: br#"{
                    "cniVersion": "1.0.0",
                    "name": "ciccni",
                    "type": "ciccni",
                    "ipam": {"type": "host-local"}
                }"#
                .to_vec(),
            }),
        })
    }

    fn error_code(response: &CniCmdResponse) -> Option<i32> {
        response.error.as_ref().map(|e| e.code)
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn del_of_unknown_container_is_success() {
        let h = harness(MockBridge::default(), MockIpam::default()).await;
        let response = h
            .service
            .cmd_del(request("never-seen", ""))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(error_code(&response), None);
        assert!(response.cni_result.is_empty());
    }

    #[tokio::test]
    async fn add_with_failing_ipam_reports_ipam_failure() {
        let h = harness(
            MockBridge::default(),
            MockIpam {
                fail_add: true,
                ..Default::default()
            },
        )
        .await;
        let response = h
            .service
            .cmd_add(request("c-1", "/proc/1/ns/net"))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(error_code(&response), Some(ErrorCode::IpamFailure as i32));
        // nothing was created, nothing is visible
        assert!(h.bridge.created.lock().unwrap().is_empty());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn add_releases_ipam_when_netns_is_missing() {
        let h = harness(MockBridge::default(), MockIpam::default()).await;
        let response = h
            .service
            .cmd_add(request("c-1", "/proc/1/ns/net"))
            .await
            .unwrap()
            .into_inner();
        // The netns path does not exist in the test environment, so the ADD
        // fails after the allocation succeeded and must release it.
        assert_eq!(
            error_code(&response),
            Some(ErrorCode::ConfigInterfaceFailure as i32)
        );
        assert_eq!(*h.ipam.deletes.lock().unwrap(), 1);
        assert!(h.store.is_empty());
        assert!(h.bridge.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_rejects_malformed_config() {
        let h = harness(MockBridge::default(), MockIpam::default()).await;
        let mut req = request("c-1", "/proc/1/ns/net").into_inner();
        req.cni_args.as_mut().unwrap().network_configuration = b"not json".to_vec();
        let response = h
            .service
            .cmd_add(Request::new(req))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            error_code(&response),
            Some(ErrorCode::DecodingFailure as i32)
        );
    }

    #[tokio::test]
    async fn add_rejects_unsupported_version() {
        let h = harness(MockBridge::default(), MockIpam::default()).await;
        let mut req = request("c-1", "/proc/1/ns/net").into_inner();
        req.cni_args.as_mut().unwrap().network_configuration = br#"{
            "cniVersion": "0.1.0",
            "ipam": {"type": "host-local"}
        }"#
        .to_vec();
        let response = h
            .service
            .cmd_add(Request::new(req))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            error_code(&response),
            Some(ErrorCode::UnsupportedField as i32)
        );
        assert_eq!(*h.ipam.deletes.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn check_reflects_index_membership() {
        let h = harness(MockBridge::default(), MockIpam::default()).await;

        let response = h
            .service
            .cmd_check(request("c-1", ""))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            error_code(&response),
            Some(ErrorCode::CheckInterfaceFailure as i32)
        );

        let host_veth = generate_container_interface_name("web-0", "default");
        h.store.add_interface(
            &host_veth,
            InterfaceConfig::new_container(
                "c-1",
                "web-0",
                "default",
                "/proc/1/ns/net",
                "aa:bb:cc:dd:ee:ff".to_string(),
                Ipv4Addr::new(10, 244, 1, 2),
            ),
        );
        let response = h
            .service
            .cmd_check(request("c-1", ""))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(error_code(&response), None);
    }

    #[tokio::test]
    async fn del_removes_known_container_port() {
        let h = harness(MockBridge::default(), MockIpam::default()).await;
        let host_veth = generate_container_interface_name("web-0", "default");
        let mut iface = InterfaceConfig::new_container(
            "c-1",
            "web-0",
            "default",
            "/proc/1/ns/net",
            "aa:bb:cc:dd:ee:ff".to_string(),
            Ipv4Addr::new(10, 244, 1, 2),
        );
        iface.ovs_port = Some(OvsPortConfig {
            iface_name: host_veth.clone(),
            port_uuid: "uuid-1".to_string(),
            of_port: 0,
        });
        h.store.add_interface(&host_veth, iface);

        let response = h
            .service
            .cmd_del(request("c-1", ""))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(error_code(&response), None);
        assert_eq!(h.bridge.deleted.lock().unwrap().as_slice(), ["uuid-1"]);
        assert!(h.store.is_empty());
        assert_eq!(*h.ipam.deletes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn rollback_runs_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut rollback = Rollback::new();
        for step in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            rollback.push("step", move || async move {
                order.lock().unwrap().push(step);
            });
        }
        rollback.run().await;
        assert_eq!(order.lock().unwrap().as_slice(), ["third", "second", "first"]);
    }

    #[tokio::test]
    async fn committed_rollback_does_nothing() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut rollback = Rollback::new();
        {
            let order = Arc::clone(&order);
            rollback.push("step", move || async move {
                order.lock().unwrap().push("ran");
            });
        }
        rollback.commit();
        assert!(order.lock().unwrap().is_empty());
    }
}
