//! Mount configuration.
//!
//! A TOML file with three blocks:
//!
//! ```toml
//! [[datastore]]
//! fstype = "ext4"
//! mountpoint = "/mnt/a"
//!
//! [parameter]
//! backing_store = "/var/lib/svfs/index.img"
//! capacity = 4096
//! delay_alloc = true
//!
//! [tracing]
//! filter = "svfs_kernel=debug"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::vfs::FsKind;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One backing-store mount to register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatastoreConfig {
    pub fstype: FsKind,
    pub mountpoint: PathBuf,
    /// Check the mount table before registering.
    #[serde(default = "default_true")]
    pub verify: bool,
}

/// Mount parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParameterConfig {
    /// Index image; absent means the index lives only in memory.
    pub backing_store: Option<PathBuf>,
    pub capacity: u32,
    pub delay_alloc: bool,
    pub default_fstype: FsKind,
}

impl Default for ParameterConfig {
    fn default() -> Self {
        Self {
            backing_store: None,
            capacity: 4096,
            delay_alloc: false,
            default_fstype: FsKind::Any,
        }
    }
}

/// Logging setup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SvfsConfig {
    pub datastore: Vec<DatastoreConfig>,
    pub parameter: ParameterConfig,
    pub tracing: TracingConfig,
}

fn default_true() -> bool {
    true
}

impl SvfsConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: SvfsConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.parameter.capacity < 2 {
            return Err(ConfigError::Invalid(
                "parameter.capacity must leave room beside the root".into(),
            ));
        }
        for ds in &self.datastore {
            if ds.fstype.is_wildcard() {
                return Err(ConfigError::Invalid(format!(
                    "datastore {} needs a concrete fstype",
                    ds.mountpoint.display()
                )));
            }
        }
        Ok(())
    }
}
