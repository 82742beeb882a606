//! Server setup and lifecycle: wire the datapath clients together, run
//! bootstrap, then serve the CNI service on the local UNIX socket.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::info;

use ciccni_datapath::{FlowClient, InterfaceStore, OvsBridge, OvsBridgeClient, OvsdbConnection};
use ciccni_proto::CniServer;

use crate::bootstrap::Initializer;
use crate::config::AgentConfig;
use crate::ipam::IpamRegistry;
use crate::k8s::{ControlPlane, KubeControlPlane};
use crate::service::CniService;

/// Run the agent: bootstrap the datapath, then serve CNI requests until the
/// process is stopped.
pub async fn run(config: AgentConfig) -> Result<()> {
    // Control-plane client.
    let control_plane: Arc<dyn ControlPlane> = Arc::new(
        KubeControlPlane::new()
            .await
            .context("connecting to the cluster control plane")?,
    );

    // OVSDB connection and bridge client. Assumes OVS itself is already
    // installed and running on the node.
    let db = OvsdbConnection::new();
    db.check_connection()
        .await
        .context("connecting to OVSDB")?;
    let bridge: Arc<dyn OvsBridgeClient> = Arc::new(OvsBridge::new(
        db,
        &config.ovs_bridge,
        &config.ovs_datapath_type,
    ));
    let flows = FlowClient::new(&config.ovs_bridge);
    let store = Arc::new(InterfaceStore::new());

    // Host-side rtnetlink handle, shared by bootstrap and the handlers.
    let (connection, netlink, _) =
        rtnetlink::new_connection().context("opening rtnetlink connection")?;
    tokio::spawn(connection);

    // Bootstrap precedes serving; any failure here is fatal.
    let initializer = Initializer::new(
        Arc::clone(&control_plane),
        Arc::clone(&bridge),
        flows,
        Arc::clone(&store),
        netlink.clone(),
        config.clone(),
    );
    let node_config = initializer
        .initialize()
        .await
        .context("node bootstrap failed")?;

    // IPAM registry, constructed here and handed to the service by
    // reference so tests can swap in their own drivers.
    let ipam = Arc::new(IpamRegistry::with_defaults());

    let service = CniService::new(
        node_config,
        config.clone(),
        bridge,
        store,
        control_plane,
        ipam,
        netlink,
    );

    // Bind the UNIX socket, removing a stale file from a previous run.
    let socket_path = Path::new(&config.cni_socket);
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating socket directory {}", parent.display()))?;
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;

    info!(socket = %config.cni_socket, "Serving CNI requests");

    Server::builder()
        .add_service(CniServer::new(service))
        .serve_with_incoming(UnixListenerStream::new(listener))
        .await
        .context("CNI server error")?;

    Ok(())
}
