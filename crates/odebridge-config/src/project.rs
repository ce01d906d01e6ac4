//! Project Configuration (odebridge.toml)
//!
//! Handles project-level configuration stored in `odebridge.toml` at the project root.

use crate::{validate_int_width, validate_sink, validate_topics, ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Project configuration from odebridge.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Diagnostic output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    /// Foreign kernel location and ABI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<KernelConfig>,
}

/// Diagnostic output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Enabled topics ("general", "rhs", "jacobian", "mass", "output", "dense", "all")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,

    /// Where diagnostics go ("tracing" or "stderr")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink: Option<String>,
}

/// Foreign kernel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct KernelConfig {
    /// Shared library name or path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<PathBuf>,

    /// Exported integrator symbol (default: "radau5_")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrator_symbol: Option<String>,

    /// Exported continuous-extension symbol (default: "contr5_")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_symbol: Option<String>,

    /// Native integer width the kernel was compiled with (32 or 64)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub int_width: Option<u32>,
}

impl ProjectConfig {
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

        if let Some(kernel) = &self.kernel {
            if let Some(width) = kernel.int_width {
                validate_int_width("kernel.int_width", width)?;
            }
            for (field, symbol) in [
                ("kernel.integrator_symbol", &kernel.integrator_symbol),
                ("kernel.continuation_symbol", &kernel.continuation_symbol),
            ] {
                if matches!(symbol, Some(s) if s.trim().is_empty()) {
                    return Err(ConfigError::InvalidValue {
                        field: field.to_string(),
                        reason: "symbol name cannot be empty".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Get the configured kernel library
    pub fn kernel_library(&self) -> Option<&Path> {
        self.kernel.as_ref().and_then(|k| k.library.as_deref())
    }

    /// Get the configured integer width
    pub fn int_width(&self) -> Option<u32> {
        self.kernel.as_ref().and_then(|k| k.int_width)
    }
}

impl LoggingConfig {
    pub(crate) fn validate(&self, section: &str) -> ConfigResult<()> {
        if let Some(topics) = &self.topics {
            validate_topics(&format!("{}.topics", section), topics)?;
        }
        if let Some(sink) = &self.sink {
            validate_sink(&format!("{}.sink", section), sink)?;
        }
        Ok(())
    }
}
