//! Delegated IPAM.
//!
//! Address management is delegated to a standard CNI IPAM plugin executed
//! as a subprocess with the inherited CNI environment contract: stdin is the
//! network-config JSON, `CNI_COMMAND`/`CNI_CONTAINERID`/`CNI_NETNS`/
//! `CNI_IFNAME`/`CNI_PATH`/`CNI_ARGS` describe the call, stdout carries the
//! result JSON, exit 0 is success.
//!
//! Drivers are looked up in an [`IpamRegistry`] that is built explicitly at
//! startup and handed to the RPC server, so tests can construct their own
//! registries with fake drivers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, warn};

use ciccni_proto::CniCmdArgs;

use crate::netconf::CniResult;

/// The delegated plugin supported out of the box.
pub const IPAM_HOST_LOCAL: &str = "host-local";

#[derive(Error, Debug)]
pub enum IpamError {
    #[error("IPAM plugin {0} not found in CNI_PATH")]
    PluginNotFound(String),

    #[error("IPAM plugin failed: {0}")]
    PluginFailed(String),

    #[error("failed to decode IPAM result: {0}")]
    Decode(String),

    #[error("I/O error running IPAM plugin: {0}")]
    Io(#[from] std::io::Error),

    #[error("IPAM driver already registered for type {0}")]
    AlreadyRegistered(String),

    #[error("no IPAM driver registered for type {0}")]
    UnknownDriver(String),
}

/// One IPAM backend. `add` owns its own rollback: if anything after the
/// subprocess succeeds fails inside the driver, the allocation is released
/// before the error surfaces.
#[async_trait]
pub trait IpamDriver: Send + Sync {
    async fn add(&self, args: &CniCmdArgs, network_config: &[u8]) -> Result<CniResult, IpamError>;
    async fn del(&self, args: &CniCmdArgs, network_config: &[u8]) -> Result<(), IpamError>;
    async fn check(&self, args: &CniCmdArgs, network_config: &[u8]) -> Result<(), IpamError>;
}

/// Explicit driver registry, keyed by the `ipam.type` config field.
#[derive(Default)]
pub struct IpamRegistry {
    drivers: HashMap<String, Arc<dyn IpamDriver>>,
}

impl IpamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry the agent ships with: host-local delegation.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(IPAM_HOST_LOCAL, Arc::new(IpamDelegator::new(IPAM_HOST_LOCAL)))
            .expect("empty registry accepts the first driver");
        registry
    }

    pub fn register(
        &mut self,
        ipam_type: &str,
        driver: Arc<dyn IpamDriver>,
    ) -> Result<(), IpamError> {
        if self.drivers.contains_key(ipam_type) {
            return Err(IpamError::AlreadyRegistered(ipam_type.to_string()));
        }
        self.drivers.insert(ipam_type.to_string(), driver);
        Ok(())
    }

    pub fn driver(&self, ipam_type: &str) -> Result<Arc<dyn IpamDriver>, IpamError> {
        self.drivers
            .get(ipam_type)
            .cloned()
            .ok_or_else(|| IpamError::UnknownDriver(ipam_type.to_string()))
    }

    pub fn is_valid_type(&self, ipam_type: &str) -> bool {
        self.drivers.contains_key(ipam_type)
    }
}

/// Subprocess delegator for standard CNI IPAM plugins.
pub struct IpamDelegator {
    plugin_type: String,
}

impl IpamDelegator {
    pub fn new(plugin_type: impl Into<String>) -> Self {
        Self {
            plugin_type: plugin_type.into(),
        }
    }

    /// Search CNI_PATH for the plugin executable.
    fn find_plugin(&self, cni_path: &str) -> Result<PathBuf, IpamError> {
        for dir in cni_path.split(':').filter(|dir| !dir.is_empty()) {
            let candidate = PathBuf::from(dir).join(&self.plugin_type);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(IpamError::PluginNotFound(self.plugin_type.clone()))
    }

    async fn exec(
        &self,
        command: &str,
        args: &CniCmdArgs,
        network_config: &[u8],
    ) -> Result<Vec<u8>, IpamError> {
        let plugin = self.find_plugin(&args.path)?;
        debug!(
            plugin = %plugin.display(),
            command,
            container_id = %args.container_id,
            "Invoking IPAM plugin"
        );

        let mut child = Command::new(&plugin)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &args.container_id)
            .env("CNI_NETNS", &args.netns)
            .env("CNI_IFNAME", &args.ifname)
            .env("CNI_PATH", &args.path)
            .env("CNI_ARGS", &args.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(network_config).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            // A failing plugin reports a CNI error object on stdout.
            let detail = if output.stdout.is_empty() {
                String::from_utf8_lossy(&output.stderr).trim().to_string()
            } else {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            };
            return Err(IpamError::PluginFailed(format!(
                "{} {command} exited {}: {detail}",
                self.plugin_type, output.status
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl IpamDriver for IpamDelegator {
    async fn add(&self, args: &CniCmdArgs, network_config: &[u8]) -> Result<CniResult, IpamError> {
        let stdout = self.exec("ADD", args, network_config).await?;
        match serde_json::from_slice::<CniResult>(&stdout) {
            Ok(result) => Ok(result),
            Err(e) => {
                // The plugin allocated an address but handed back something
                // unusable; release the allocation before failing the ADD.
                if let Err(del_err) = self.del(args, network_config).await {
                    error!(error = %del_err, "Failed to roll back IPAM allocation");
                }
                Err(IpamError::Decode(e.to_string()))
            }
        }
    }

    async fn del(&self, args: &CniCmdArgs, network_config: &[u8]) -> Result<(), IpamError> {
        match self.exec("DEL", args, network_config).await {
            Ok(_) => Ok(()),
            // DEL is idempotent: releasing an unknown allocation succeeds.
            Err(IpamError::PluginFailed(message)) if message.contains("not found") => {
                warn!(message, "IPAM DEL for unknown allocation, ignoring");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn check(&self, args: &CniCmdArgs, network_config: &[u8]) -> Result<(), IpamError> {
        self.exec("CHECK", args, network_config).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopDriver;

    #[async_trait]
    impl IpamDriver for NoopDriver {
        async fn add(&self, _: &CniCmdArgs, _: &[u8]) -> Result<CniResult, IpamError> {
            Ok(CniResult::default())
        }
        async fn del(&self, _: &CniCmdArgs, _: &[u8]) -> Result<(), IpamError> {
            Ok(())
        }
        async fn check(&self, _: &CniCmdArgs, _: &[u8]) -> Result<(), IpamError> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut registry = IpamRegistry::new();
        registry.register("host-local", Arc::new(NoopDriver)).unwrap();
        let err = registry
            .register("host-local", Arc::new(NoopDriver))
            .unwrap_err();
        assert!(matches!(err, IpamError::AlreadyRegistered(_)));
    }

    #[test]
    fn unknown_driver_lookup_fails() {
        let registry = IpamRegistry::with_defaults();
        assert!(registry.is_valid_type(IPAM_HOST_LOCAL));
        assert!(!registry.is_valid_type("dhcp"));
        assert!(matches!(
            registry.driver("dhcp"),
            Err(IpamError::UnknownDriver(_))
        ));
    }

    #[test]
    fn plugin_search_walks_cni_path() {
        let delegator = IpamDelegator::new("definitely-not-installed");
        let err = delegator
            .find_plugin("/nonexistent-a:/nonexistent-b")
            .unwrap_err();
        assert!(matches!(err, IpamError::PluginNotFound(_)));
    }
}
