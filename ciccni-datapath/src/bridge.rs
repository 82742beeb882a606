//! OVS bridge client: idempotent bridge/port management over OVSDB.
//!
//! Every mutating operation batches its inserts and mutations into a single
//! OVSDB transaction so a crash can never leave a half-created port (for
//! example an Interface row without the Port row referencing it).

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{DatapathError, Result};
use crate::ovsdb::OvsdbConnection;

pub const OVS_DATAPATH_SYSTEM: &str = "system";
pub const OVS_DATAPATH_NETDEV: &str = "netdev";

pub const TUNNEL_TYPE_VXLAN: &str = "vxlan";
pub const TUNNEL_TYPE_GENEVE: &str = "geneve";

/// One port on the bridge as reported by [`OvsBridgeClient::get_port_list`].
#[derive(Debug, Clone)]
pub struct OvsPortData {
    pub name: String,
    pub uuid: String,
    /// -1 while vswitchd has not assigned an OpenFlow port yet.
    pub of_port: i32,
    pub external_ids: HashMap<String, String>,
}

/// Capability set the rest of the agent programs the bridge through.
#[async_trait]
pub trait OvsBridgeClient: Send + Sync {
    /// Create the bridge if it does not exist yet.
    async fn create(&self) -> Result<()>;

    /// Add a plain port for an existing kernel interface; returns the port
    /// UUID. Idempotent: an existing port of the same name is reused.
    async fn create_port(
        &self,
        name: &str,
        if_dev: &str,
        external_ids: &HashMap<String, String>,
    ) -> Result<String>;

    /// Add an internal port (vswitchd creates the kernel interface).
    async fn create_internal_port(&self, name: &str, of_port_request: i32) -> Result<String>;

    /// Add a VXLAN tunnel port. An empty `remote_ip` leaves the tunnel
    /// destination to be set per-packet by the flow table.
    async fn create_vxlan_port(
        &self,
        name: &str,
        of_port_request: i32,
        remote_ip: &str,
    ) -> Result<String>;

    /// Add a Geneve tunnel port; same remote semantics as VXLAN.
    async fn create_geneve_port(
        &self,
        name: &str,
        of_port_request: i32,
        remote_ip: &str,
    ) -> Result<String>;

    /// Remove a port by UUID. Deleting an absent UUID succeeds.
    async fn delete_port(&self, port_uuid: &str) -> Result<()>;

    /// OpenFlow port number for an interface; error while unassigned.
    async fn get_of_port(&self, if_name: &str) -> Result<i32>;

    /// Every port on the bridge, with external-IDs.
    async fn get_port_list(&self) -> Result<Vec<OvsPortData>>;

    /// Adjust the kernel MTU of an interface via its mtu_request column.
    async fn set_interface_mtu(&self, name: &str, mtu: u32) -> Result<()>;
}

/// OVSDB-backed implementation of [`OvsBridgeClient`].
pub struct OvsBridge {
    db: OvsdbConnection,
    bridge: String,
    datapath_type: String,
}

impl OvsBridge {
    pub fn new(db: OvsdbConnection, bridge: impl Into<String>, datapath_type: impl Into<String>) -> Self {
        Self {
            db,
            bridge: bridge.into(),
            datapath_type: datapath_type.into(),
        }
    }

    pub fn bridge_name(&self) -> &str {
        &self.bridge
    }

    async fn port_uuid_by_name(&self, name: &str) -> Result<Option<String>> {
        let results = self
            .db
            .transact(vec![select_op(
                "Port",
                json!([["name", "==", name]]),
                &["_uuid"],
            )])
            .await?;
        Ok(first_row(&results[0])
            .and_then(|row| row.get("_uuid"))
            .and_then(parse_atom_uuid))
    }

    /// Insert Interface + Port and link the Port into the bridge, all in one
    /// transaction. Returns the new Port UUID.
    async fn insert_port(
        &self,
        name: &str,
        interface_row: Value,
        external_ids: &HashMap<String, String>,
    ) -> Result<String> {
        if let Some(existing) = self.port_uuid_by_name(name).await? {
            debug!(port = %name, uuid = %existing, "OVS port already exists");
            return Ok(existing);
        }

        let ops = vec![
            json!({
                "op": "insert",
                "table": "Interface",
                "row": interface_row,
                "uuid-name": "iface_row",
            }),
            json!({
                "op": "insert",
                "table": "Port",
                "row": {
                    "name": name,
                    "interfaces": ["named-uuid", "iface_row"],
                    "external_ids": map_value(external_ids),
                },
                "uuid-name": "port_row",
            }),
            json!({
                "op": "mutate",
                "table": "Bridge",
                "where": [["name", "==", self.bridge]],
                "mutations": [["ports", "insert", ["set", [["named-uuid", "port_row"]]]]],
            }),
        ];

        let results = self.db.transact(ops).await?;
        let uuid = results
            .get(1)
            .and_then(|r| r.get("uuid"))
            .and_then(parse_atom_uuid)
            .ok_or_else(|| {
                DatapathError::OvsdbTransaction(format!(
                    "no uuid returned for new port {name}"
                ))
            })?;
        info!(port = %name, uuid = %uuid, bridge = %self.bridge, "Created OVS port");
        Ok(uuid)
    }

    async fn create_tunnel_port(
        &self,
        name: &str,
        tunnel_type: &str,
        of_port_request: i32,
        remote_ip: &str,
    ) -> Result<String> {
        // remote_ip=flow defers the tunnel destination to the flow table.
        let remote = if remote_ip.is_empty() { "flow" } else { remote_ip };
        let row = json!({
            "name": name,
            "type": tunnel_type,
            "ofport_request": of_port_request,
            "options": ["map", [["key", "flow"], ["remote_ip", remote]]],
        });
        self.insert_port(name, row, &HashMap::new()).await
    }
}

#[async_trait]
impl OvsBridgeClient for OvsBridge {
    async fn create(&self) -> Result<()> {
        let results = self
            .db
            .transact(vec![select_op(
                "Bridge",
                json!([["name", "==", self.bridge]]),
                &["_uuid"],
            )])
            .await?;
        if first_row(&results[0]).is_some() {
            debug!(bridge = %self.bridge, "OVS bridge already exists");
            return Ok(());
        }

        let ops = vec![
            json!({
                "op": "insert",
                "table": "Bridge",
                "row": {
                    "name": self.bridge,
                    "datapath_type": self.datapath_type,
                },
                "uuid-name": "bridge_row",
            }),
            json!({
                "op": "mutate",
                "table": "Open_vSwitch",
                "where": [],
                "mutations": [["bridges", "insert", ["set", [["named-uuid", "bridge_row"]]]]],
            }),
        ];
        self.db.transact(ops).await?;
        info!(bridge = %self.bridge, datapath = %self.datapath_type, "Created OVS bridge");
        Ok(())
    }

    async fn create_port(
        &self,
        name: &str,
        if_dev: &str,
        external_ids: &HashMap<String, String>,
    ) -> Result<String> {
        let row = json!({ "name": if_dev });
        self.insert_port(name, row, external_ids).await
    }

    async fn create_internal_port(&self, name: &str, of_port_request: i32) -> Result<String> {
        let row = json!({
            "name": name,
            "type": "internal",
            "ofport_request": of_port_request,
        });
        self.insert_port(name, row, &HashMap::new()).await
    }

    async fn create_vxlan_port(
        &self,
        name: &str,
        of_port_request: i32,
        remote_ip: &str,
    ) -> Result<String> {
        self.create_tunnel_port(name, TUNNEL_TYPE_VXLAN, of_port_request, remote_ip)
            .await
    }

    async fn create_geneve_port(
        &self,
        name: &str,
        of_port_request: i32,
        remote_ip: &str,
    ) -> Result<String> {
        self.create_tunnel_port(name, TUNNEL_TYPE_GENEVE, of_port_request, remote_ip)
            .await
    }

    async fn delete_port(&self, port_uuid: &str) -> Result<()> {
        let ops = vec![
            json!({
                "op": "mutate",
                "table": "Bridge",
                "where": [["name", "==", self.bridge]],
                "mutations": [["ports", "delete", ["set", [["uuid", port_uuid]]]]],
            }),
            json!({
                "op": "delete",
                "table": "Port",
                "where": [["_uuid", "==", ["uuid", port_uuid]]],
            }),
        ];
        // A count of zero means the port was already gone, which is fine.
        self.db.transact(ops).await?;
        debug!(uuid = %port_uuid, "Deleted OVS port");
        Ok(())
    }

    async fn get_of_port(&self, if_name: &str) -> Result<i32> {
        let results = self
            .db
            .transact(vec![select_op(
                "Interface",
                json!([["name", "==", if_name]]),
                &["ofport"],
            )])
            .await?;
        let row = first_row(&results[0]).ok_or_else(|| {
            DatapathError::OvsdbTransaction(format!("interface {if_name} not found"))
        })?;
        match row.get("ofport").and_then(parse_optional_i64) {
            Some(ofport) if ofport > 0 => Ok(ofport as i32),
            _ => Err(DatapathError::OfPortNotAssigned(if_name.to_string())),
        }
    }

    async fn get_port_list(&self) -> Result<Vec<OvsPortData>> {
        let ops = vec![
            select_op("Bridge", json!([["name", "==", self.bridge]]), &["ports"]),
            select_op("Port", json!([]), &["_uuid", "name", "interfaces", "external_ids"]),
            select_op("Interface", json!([]), &["_uuid", "name", "ofport"]),
        ];
        let results = self.db.transact(ops).await?;
        Ok(join_port_list(&results))
    }

    async fn set_interface_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        let ops = vec![json!({
            "op": "update",
            "table": "Interface",
            "where": [["name", "==", name]],
            "row": { "mtu_request": mtu },
        })];
        self.db.transact(ops).await?;
        Ok(())
    }
}

// ============================================================================
// OVSDB value helpers
// ============================================================================

fn select_op(table: &str, where_clause: Value, columns: &[&str]) -> Value {
    json!({
        "op": "select",
        "table": table,
        "where": where_clause,
        "columns": columns,
    })
}

fn first_row(result: &Value) -> Option<&Value> {
    result.get("rows").and_then(Value::as_array)?.first()
}

fn rows(result: &Value) -> &[Value] {
    result
        .get("rows")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// `["uuid", "<id>"]` → `<id>`
fn parse_atom_uuid(value: &Value) -> Option<String> {
    let pair = value.as_array()?;
    if pair.len() == 2 && pair[0] == "uuid" {
        pair[1].as_str().map(str::to_string)
    } else {
        None
    }
}

/// A column holding either one uuid atom or `["set", [...]]` of them.
fn parse_uuid_set(value: &Value) -> Vec<String> {
    if let Some(uuid) = parse_atom_uuid(value) {
        return vec![uuid];
    }
    let Some(pair) = value.as_array() else {
        return Vec::new();
    };
    if pair.len() == 2 && pair[0] == "set" {
        pair[1]
            .as_array()
            .map(|atoms| atoms.iter().filter_map(parse_atom_uuid).collect())
            .unwrap_or_default()
    } else {
        Vec::new()
    }
}

/// `["map", [[k, v], ...]]` → HashMap
fn parse_map(value: &Value) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if let Some(pair) = value.as_array() {
        if pair.len() == 2 && pair[0] == "map" {
            if let Some(entries) = pair[1].as_array() {
                for entry in entries {
                    if let Some(kv) = entry.as_array() {
                        if let (Some(k), Some(v)) =
                            (kv.first().and_then(Value::as_str), kv.get(1).and_then(Value::as_str))
                        {
                            out.insert(k.to_string(), v.to_string());
                        }
                    }
                }
            }
        }
    }
    out
}

/// An integer column that reads `["set", []]` while unset.
fn parse_optional_i64(value: &Value) -> Option<i64> {
    value.as_i64()
}

fn map_value(map: &HashMap<String, String>) -> Value {
    let mut entries: Vec<Value> = map
        .iter()
        .map(|(k, v)| json!([k, v]))
        .collect();
    // Deterministic order keeps transactions reproducible in tests.
    entries.sort_by_key(|e| e[0].as_str().map(str::to_string));
    json!(["map", entries])
}

/// Join the three selects of `get_port_list` into per-port data.
fn join_port_list(results: &[Value]) -> Vec<OvsPortData> {
    let bridge_ports: Vec<String> = first_row(&results[0])
        .and_then(|row| row.get("ports"))
        .map(parse_uuid_set)
        .unwrap_or_default();

    let mut interfaces: HashMap<String, (String, i32)> = HashMap::new();
    for row in rows(&results[2]) {
        let Some(uuid) = row.get("_uuid").and_then(parse_atom_uuid) else {
            continue;
        };
        let name = row
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let of_port = row
            .get("ofport")
            .and_then(parse_optional_i64)
            .unwrap_or(-1) as i32;
        interfaces.insert(uuid, (name, of_port));
    }

    let mut ports = Vec::new();
    for row in rows(&results[1]) {
        let Some(uuid) = row.get("_uuid").and_then(parse_atom_uuid) else {
            continue;
        };
        if !bridge_ports.contains(&uuid) {
            continue;
        }
        let name = row
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let external_ids = row.get("external_ids").map(parse_map).unwrap_or_default();
        let of_port = row
            .get("interfaces")
            .map(parse_uuid_set)
            .unwrap_or_default()
            .first()
            .and_then(|iface_uuid| interfaces.get(iface_uuid))
            .map(|(_, of_port)| *of_port)
            .unwrap_or(-1);
        ports.push(OvsPortData {
            name,
            uuid,
            of_port,
            external_ids,
        });
    }
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_atom_and_set() {
        let atom = json!(["uuid", "aa-bb"]);
        assert_eq!(parse_atom_uuid(&atom).as_deref(), Some("aa-bb"));

        let single = json!(["uuid", "aa-bb"]);
        assert_eq!(parse_uuid_set(&single), vec!["aa-bb".to_string()]);

        let set = json!(["set", [["uuid", "a"], ["uuid", "b"]]]);
        assert_eq!(parse_uuid_set(&set), vec!["a".to_string(), "b".to_string()]);

        let empty = json!(["set", []]);
        assert!(parse_uuid_set(&empty).is_empty());
    }

    #[test]
    fn parse_external_ids_map() {
        let value = json!(["map", [["container-id", "c-1"], ["pod-name", "web-0"]]]);
        let map = parse_map(&value);
        assert_eq!(map["container-id"], "c-1");
        assert_eq!(map["pod-name"], "web-0");
    }

    #[test]
    fn unassigned_ofport_reads_as_none() {
        assert_eq!(parse_optional_i64(&json!(["set", []])), None);
        assert_eq!(parse_optional_i64(&json!(7)), Some(7));
    }

    #[test]
    fn join_port_list_links_ports_to_interfaces() {
        let results = vec![
            json!({"rows": [{"ports": ["set", [["uuid", "p1"], ["uuid", "p2"]]]}]}),
            json!({"rows": [
                {"_uuid": ["uuid", "p1"], "name": "tun0",
                 "interfaces": ["uuid", "i1"], "external_ids": ["map", []]},
                {"_uuid": ["uuid", "p2"], "name": "veth-ab",
                 "interfaces": ["uuid", "i2"],
                 "external_ids": ["map", [["container-id", "c-1"]]]},
                {"_uuid": ["uuid", "p3"], "name": "other-bridge-port",
                 "interfaces": ["uuid", "i3"], "external_ids": ["map", []]},
            ]}),
            json!({"rows": [
                {"_uuid": ["uuid", "i1"], "name": "tun0", "ofport": 1},
                {"_uuid": ["uuid", "i2"], "name": "veth-ab", "ofport": 12},
            ]}),
        ];
        let ports = join_port_list(&results);
        assert_eq!(ports.len(), 2);

        let tun = ports.iter().find(|p| p.name == "tun0").unwrap();
        assert_eq!(tun.of_port, 1);
        assert!(tun.external_ids.is_empty());

        let veth = ports.iter().find(|p| p.name == "veth-ab").unwrap();
        assert_eq!(veth.of_port, 12);
        assert_eq!(veth.external_ids["container-id"], "c-1");
    }

    #[test]
    fn map_value_is_sorted() {
        let mut ids = HashMap::new();
        ids.insert("b".to_string(), "2".to_string());
        ids.insert("a".to_string(), "1".to_string());
        assert_eq!(map_value(&ids), json!(["map", [["a", "1"], ["b", "2"]]]));
    }
}
