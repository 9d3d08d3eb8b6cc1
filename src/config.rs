//! IPAM configuration
//!
//! Layered the usual way: built-in defaults, then an optional TOML file, then
//! `IPAM__*` environment variables (`IPAM__BLOCK_SIZING__IPV4_PREFIX_LEN=24`).

use crate::cidr::BlockSizing;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "IPAM";

/// Read-modify-write attempts before giving up
pub const DEFAULT_MAX_RETRIES: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpamConfig {
    /// Newly claimed blocks only serve auto-assignment to their host
    pub strict_affinity: bool,
    pub max_retries: u32,
    pub block_sizing: BlockSizing,
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            strict_affinity: false,
            max_retries: DEFAULT_MAX_RETRIES,
            block_sizing: BlockSizing::default(),
        }
    }
}

impl IpamConfig {
    /// Load from defaults, `path` if given and present, and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Like [`IpamConfig::load`] with a custom environment prefix
    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "Reading config file");
            builder = builder.add_source(
                config::File::new(&path.to_string_lossy(), config::FileFormat::Toml).required(false),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config: IpamConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        self.block_sizing.validate()
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to render config: {}", e)))
    }
}
