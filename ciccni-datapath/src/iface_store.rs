//! In-memory index of the OVS ports this agent owns.
//!
//! The store is the agent's source of truth for "which interfaces did I
//! create": the tunnel and gateway entries registered at bootstrap, plus one
//! entry per pod added by `ADD` and removed by `DEL`. It is reconciled from
//! OVSDB at startup so a restarted agent keeps serving `DEL`s for pods it
//! set up in a previous life.
//!
//! All map operations are O(1) critical sections behind a reader-writer
//! lock; no lock is held across an await point.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use crate::bridge::OvsBridgeClient;
use crate::error::Result;
use crate::types::{InterfaceConfig, InterfaceType, OvsPortConfig};

/// Concurrency-safe interface index keyed by interface name.
#[derive(Debug, Default)]
pub struct InterfaceStore {
    cache: RwLock<HashMap<String, InterfaceConfig>>,
}

impl InterfaceStore {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the index from the ports currently on the bridge.
    ///
    /// Only the tunnel port is re-registered eagerly; container ports are
    /// left out and re-admitted lazily by future CNI calls. Ports without
    /// external-IDs that are not the tunnel are ignored entirely.
    pub async fn initialize(
        &self,
        bridge: &dyn OvsBridgeClient,
        tunnel_port: &str,
    ) -> Result<()> {
        let ports = bridge.get_port_list().await?;

        let mut cache = self.cache.write().unwrap();
        for port in ports {
            if port.name == tunnel_port {
                let mut config = InterfaceConfig::new_tunnel(tunnel_port);
                config.ovs_port = Some(OvsPortConfig {
                    iface_name: port.name.clone(),
                    port_uuid: port.uuid.clone(),
                    of_port: port.of_port,
                });
                cache.insert(port.name, config);
            } else if port.external_ids.is_empty() {
                debug!(port = %port.name, "OVS port has no external-ids, skipping");
            }
        }
        Ok(())
    }

    pub fn add_interface(&self, iface_name: &str, config: InterfaceConfig) {
        self.cache
            .write()
            .unwrap()
            .insert(iface_name.to_string(), config);
    }

    pub fn delete_interface(&self, iface_name: &str) {
        self.cache.write().unwrap().remove(iface_name);
    }

    pub fn get_interface(&self, iface_name: &str) -> Option<InterfaceConfig> {
        self.cache.read().unwrap().get(iface_name).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.cache
            .read()
            .unwrap()
            .values()
            .filter(|c| c.iface_type == InterfaceType::Container)
            .count()
    }

    pub fn len(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn interface_ids(&self) -> Vec<String> {
        self.cache.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn container(id: &str) -> InterfaceConfig {
        InterfaceConfig::new_container(
            id,
            "web-0",
            "default",
            "/proc/42/ns/net",
            "aa:bb:cc:dd:ee:ff".to_string(),
            Ipv4Addr::new(10, 244, 1, 2),
        )
    }

    #[test]
    fn add_get_delete_roundtrip() {
        let store = InterfaceStore::new();
        assert!(store.is_empty());

        store.add_interface("veth-1", container("c-1"));
        let got = store.get_interface("veth-1").expect("entry present");
        assert_eq!(got.id, "c-1");
        assert_eq!(store.len(), 1);

        store.delete_interface("veth-1");
        assert!(store.get_interface("veth-1").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn container_count_ignores_system_ports() {
        let store = InterfaceStore::new();
        store.add_interface("tun0", InterfaceConfig::new_tunnel("tun0"));
        store.add_interface("veth-1", container("c-1"));
        store.add_interface("veth-2", container("c-2"));
        assert_eq!(store.container_count(), 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn concurrent_readers_and_writers() {
        use std::sync::Arc;

        let store = Arc::new(InterfaceStore::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let name = format!("veth-{i}");
                store.add_interface(&name, container(&format!("c-{i}")));
                assert!(store.get_interface(&name).is_some());
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 8);
    }
}
