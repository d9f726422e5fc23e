//! The top-level configuration for a running helper process.

use crate::{NetworkConfig, RpcConfig};
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// The configuration for the helper process.
///
/// Every field has a default so a partial YAML file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Configuration for the libp2p host.
    pub network: NetworkConfig,
    /// Configuration for RPC framing and delivery.
    pub rpc: RpcConfig,
}

impl HelperConfig {
    /// Load the configuration from a YAML file.
    ///
    /// A missing file is not an error: the default configuration is returned instead.
    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(target: "helper-config", ?path, "config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&contents)
            .wrap_err_with(|| format!("failed to parse config file {}", path.display()))?;
        debug!(target: "helper-config", ?config, "loaded config");
        Ok(config)
    }

    /// Write the configuration to a YAML file, creating parent directories as needed.
    pub fn store(&self, path: impl AsRef<Path>) -> eyre::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_yaml::to_string(self)?;
        std::fs::write(path, contents)
            .wrap_err_with(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }
}
