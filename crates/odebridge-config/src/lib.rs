//! odebridge configuration
//!
//! Provides configuration for the integrator bridge:
//! - Project configuration (odebridge.toml)
//! - Global user configuration (~/.odebridge/config.toml)
//! - Configuration precedence and merging
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Global config (~/.odebridge/config.toml)
//! 2. Project config (./odebridge.toml)
//! 3. Environment variables (ODEBRIDGE_*)
//! 4. Explicit values set by the caller
//!
//! # Example
//!
//! ```no_run
//! use odebridge_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! println!("kernel width: {}", config.int_width());
//! ```

pub mod global;
pub mod loader;
pub mod project;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Diagnostic topics understood by the runtime
pub const LOG_TOPICS: &[&str] = &["general", "rhs", "jacobian", "mass", "output", "dense"];

/// Log sinks understood by the runtime
pub const LOG_SINKS: &[&str] = &["tracing", "stderr"];

/// Native integer widths the kernel may be compiled with
pub const INT_WIDTHS: &[u32] = &[32, 64];

pub(crate) fn validate_topics(field: &str, topics: &[String]) -> ConfigResult<()> {
    for topic in topics {
        if topic != "all" && !LOG_TOPICS.contains(&topic.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: field.to_string(),
                reason: format!("unknown topic '{}'", topic),
            });
        }
    }
    Ok(())
}

pub(crate) fn validate_sink(field: &str, sink: &str) -> ConfigResult<()> {
    if !LOG_SINKS.contains(&sink) {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("must be 'tracing' or 'stderr', got '{}'", sink),
        });
    }
    Ok(())
}

pub(crate) fn validate_int_width(field: &str, width: u32) -> ConfigResult<()> {
    if !INT_WIDTHS.contains(&width) {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("must be 32 or 64, got {}", width),
        });
    }
    Ok(())
}

// Re-export main types
pub use global::GlobalConfig;
pub use loader::{Config, ConfigLoader};
pub use project::{KernelConfig, LoggingConfig, ProjectConfig};
