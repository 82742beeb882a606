//! # ciccni Datapath
//!
//! Datapath layer for the ciccni agent: everything that touches the kernel
//! or Open vSwitch on behalf of the CNI request handlers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │            CNI handlers / bootstrap            │
//! └──────┬──────────┬──────────┬──────────┬────────┘
//!        ▼          ▼          ▼          ▼
//! ┌──────────┐ ┌─────────┐ ┌────────┐ ┌──────────┐
//! │ OvsBridge│ │FlowClient│ │iptables│ │ link/tc  │
//! │  (OVSDB) │ │(ovs-ofctl)│ │        │ │(netlink) │
//! └──────────┘ └─────────┘ └────────┘ └──────────┘
//! ```
//!
//! The OVSDB bridge client is the only component behind a trait
//! ([`OvsBridgeClient`]); the request handlers are tested against a mock of
//! it. Flow, iptables, TC and link operations are plain clients.

pub mod bridge;
pub mod error;
pub mod iface_store;
pub mod iptables;
pub mod link;
pub mod openflow;
pub mod ovsdb;
pub mod tc;
pub mod types;

pub use bridge::{OvsBridge, OvsBridgeClient, OvsPortData};
pub use error::{DatapathError, Result};
pub use iface_store::InterfaceStore;
pub use link::Netns;
pub use openflow::FlowClient;
pub use ovsdb::OvsdbConnection;
pub use types::*;
