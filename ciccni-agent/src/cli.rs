//! Command-line argument parsing.

use clap::Parser;

/// ciccni Agent - CNI datapath agent, runs on each node
#[derive(Parser, Debug)]
#[command(name = "ciccni-agent")]
#[command(about = "ciccni agent - programs the OVS overlay and serves CNI requests")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/ciccni/agent.yaml")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit JSON logs instead of console output
    #[arg(long)]
    pub log_json: bool,
}
