//! # ciccni Agent
//!
//! The ciccni agent runs on each cluster node. At startup it discovers the
//! node's pod subnet from the control plane, programs the OVS bridge with a
//! tunnel port, a host gateway and the overlay flow rules, and installs the
//! host forwarding rules. It then serves CNI ADD/CHECK/DEL requests,
//! forwarded by the ciccni shim, on a local UNIX socket.
//!
//! ## Usage
//! ```bash
//! ciccni-agent --config /etc/ciccni/agent.yaml
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod bootstrap;
mod cli;
mod config;
mod ipam;
mod k8s;
mod netconf;
mod server;
mod service;

use cli::Args;
use config::AgentConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    if args.log_json {
        ciccni_common::init_logging_json(&args.log_level)?;
    } else {
        ciccni_common::init_logging(&args.log_level)?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting ciccni agent"
    );

    // Load configuration
    let config = match AgentConfig::load(&args.config) {
        Ok(cfg) => {
            info!(config_path = %args.config, "Configuration loaded");
            cfg
        }
        Err(_) if args.config == "/etc/ciccni/agent.yaml" => {
            info!("No config file found, using defaults");
            AgentConfig::default()
        }
        Err(e) => {
            error!(error = %e, path = %args.config, "Failed to load configuration");
            return Err(e);
        }
    };
    config.validate()?;

    info!(
        socket = %config.cni_socket,
        bridge = %config.ovs_bridge,
        tunnel = %config.tunnel_type,
        "Agent configured"
    );

    // Bootstrap the datapath and serve CNI requests. Any failure before the
    // socket opens is fatal; the supervisor restarts us.
    if let Err(e) = server::run(config).await {
        error!(error = %e, "Agent failed");
        return Err(e);
    }

    Ok(())
}
