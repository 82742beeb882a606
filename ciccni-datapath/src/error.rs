//! Error types for the datapath layer.

use thiserror::Error;

/// Errors that can occur while programming OVS, netlink, iptables or TC.
#[derive(Error, Debug)]
pub enum DatapathError {
    /// Failed to reach the OVSDB server. Retryable.
    #[error("OVSDB connection error: {0}")]
    OvsdbConnection(String),

    /// OVSDB accepted the connection but rejected the transaction. Permanent.
    #[error("OVSDB transaction error: {0}")]
    OvsdbTransaction(String),

    /// An OpenFlow port number was requested before vswitchd assigned one.
    #[error("OpenFlow port not assigned for interface {0}")]
    OfPortNotAssigned(String),

    /// ovs-ofctl invocation failed.
    #[error("Flow programming error: {0}")]
    FlowProgramming(String),

    /// iptables chain or rule manipulation failed.
    #[error("iptables error: {0}")]
    Iptables(String),

    /// rtnetlink request failed.
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// A kernel link expected to exist was not found.
    #[error("Link not found: {0}")]
    LinkNotFound(String),

    /// Network namespace could not be entered or restored.
    #[error("Netns error: {0}")]
    Netns(String),

    /// Bandwidth annotation did not match the accepted grammar.
    #[error("Invalid bandwidth: {0}")]
    InvalidBandwidth(String),

    /// I/O error from a socket or file descriptor.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DatapathError {
    /// Whether the operation may succeed if retried against the same state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DatapathError::OvsdbConnection(_))
    }
}

/// Result type alias for datapath operations.
pub type Result<T> = std::result::Result<T, DatapathError>;
