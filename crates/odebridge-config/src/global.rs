//! Global Configuration (~/.odebridge/config.toml)
//!
//! Handles user-level configuration stored in `~/.odebridge/config.toml`.

use crate::project::LoggingConfig;
use crate::{validate_int_width, ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Global user configuration from ~/.odebridge/config.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Default diagnostic output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    /// Kernel defaults shared by all projects
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<GlobalKernelConfig>,
}

/// Kernel defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct GlobalKernelConfig {
    /// Extra directories searched for kernel libraries
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<PathBuf>,

    /// Default native integer width
    #[serde(skip_serializing_if = "Option::is_none")]
    pub int_width: Option<u32>,
}

impl GlobalConfig {
    /// Parse a TOML file; a missing file is `NotFound`
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject unknown topics, sinks and integer widths
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(logging) = &self.logging {
            logging.validate("logging")?;
        }
        if let Some(width) = self.kernel.as_ref().and_then(|k| k.int_width) {
            validate_int_width("kernel.int_width", width)?;
        }
        Ok(())
    }

    /// Get the global config file path (~/.odebridge/config.toml)
    pub fn global_config_path() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".odebridge").join("config.toml"))
    }

    /// Get the extra library search paths
    pub fn search_paths(&self) -> &[PathBuf] {
        self.kernel
            .as_ref()
            .map(|k| k.search_paths.as_slice())
            .unwrap_or(&[])
    }
}
