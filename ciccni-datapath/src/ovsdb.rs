//! OVSDB JSON-RPC client for Open vSwitch integration.
//!
//! Direct JSON-RPC 1.0 client for the ovsdb-server UNIX socket. Only the
//! `transact` method is used; each call opens a fresh connection, so there
//! is no idle stream for the server's `echo` keepalives to arrive on.
//!
//! Transactional semantics: every [`OvsdbConnection::transact`] call is a
//! single OVSDB transaction; callers that need multi-operation atomicity
//! batch their operations into one call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::{DatapathError, Result};

/// Default ovsdb-server control socket.
pub const DEFAULT_OVSDB_SOCKET: &str = "/run/openvswitch/db.sock";

/// Database holding the switch configuration.
const OVSDB_DATABASE: &str = "Open_vSwitch";

/// OVSDB JSON-RPC client.
#[derive(Debug)]
pub struct OvsdbConnection {
    socket_path: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl OvsdbConnection {
    /// Create a client for the default socket path.
    pub fn new() -> Self {
        Self::with_socket(DEFAULT_OVSDB_SOCKET)
    }

    /// Create a client for a custom socket path.
    pub fn with_socket(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(30),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probe the server. Used at startup so a missing ovsdb-server fails
    /// bootstrap with a connection error instead of a late transaction error.
    pub async fn check_connection(&self) -> Result<()> {
        self.rpc_call("list_dbs", json!([])).await.map(|_| ())
    }

    /// Execute a transaction against Open_vSwitch.
    ///
    /// Returns one result object per operation. Per-operation `error`
    /// members are surfaced as [`DatapathError::OvsdbTransaction`].
    pub async fn transact(&self, operations: Vec<Value>) -> Result<Vec<Value>> {
        let mut params = vec![json!(OVSDB_DATABASE)];
        params.extend(operations);

        let result = self.rpc_call("transact", Value::Array(params)).await?;
        let results = match result {
            Value::Array(results) => results,
            other => {
                return Err(DatapathError::OvsdbTransaction(format!(
                    "unexpected transact result: {other}"
                )))
            }
        };

        for op_result in &results {
            if let Some(error) = op_result.get("error").and_then(Value::as_str) {
                let details = op_result
                    .get("details")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                return Err(DatapathError::OvsdbTransaction(format!(
                    "{error}: {details}"
                )));
            }
        }
        Ok(results)
    }

    /// Send one JSON-RPC request and wait for the matching response.
    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "method": method,
            "params": params,
            "id": id,
        });

        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| {
                DatapathError::OvsdbConnection(format!("{}: {e}", self.socket_path))
            })?;

        let payload = serde_json::to_vec(&request)
            .map_err(|e| DatapathError::Internal(e.to_string()))?;
        debug!(method, id, "OVSDB request");

        let response = tokio::time::timeout(self.timeout, async {
            stream.write_all(&payload).await?;
            read_json_value(&mut stream).await
        })
        .await
        .map_err(|_| DatapathError::OvsdbConnection("OVSDB response timeout".to_string()))?
        .map_err(DatapathError::from)?;

        if response.get("id").and_then(Value::as_u64) != Some(id) {
            return Err(DatapathError::OvsdbTransaction(
                "OVSDB response id mismatch".to_string(),
            ));
        }
        if let Some(error) = response.get("error") {
            if !error.is_null() {
                return Err(DatapathError::OvsdbTransaction(error.to_string()));
            }
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}

impl Default for OvsdbConnection {
    fn default() -> Self {
        Self::new()
    }
}

/// Read bytes until the buffer parses as one complete JSON value.
///
/// ovsdb-server does not newline-frame its responses, so the stream is read
/// incrementally and re-parsed as it grows.
async fn read_json_value(stream: &mut UnixStream) -> std::io::Result<Value> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "OVSDB closed the connection mid-response",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        match serde_json::from_slice::<Value>(&buf) {
            Ok(value) => return Ok(value),
            // Incomplete JSON so far; keep reading.
            Err(e) if e.is_eof() => continue,
            Err(e) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("malformed OVSDB response: {e}"),
                ))
            }
        }
    }
}
