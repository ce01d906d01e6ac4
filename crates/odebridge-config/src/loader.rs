//! Layered configuration for kernel runs
//!
//! Later layers win: global file, project file, then `ODEBRIDGE_*` variables.

use crate::global::GlobalConfig;
use crate::project::{KernelConfig, LoggingConfig, ProjectConfig};
use crate::{validate_int_width, validate_sink, validate_topics, ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Project configuration file name
pub const PROJECT_CONFIG_FILE: &str = "odebridge.toml";

const DEFAULT_INTEGRATOR_SYMBOL: &str = "radau5_";
const DEFAULT_CONTINUATION_SYMBOL: &str = "contr5_";
const DEFAULT_INT_WIDTH: u32 = 64;

/// Configuration loader
///
/// Layers, lowest first:
/// 1. Global config (~/.odebridge/config.toml) - lowest priority
/// 2. Project config (./odebridge.toml) - overrides global
/// 3. Environment variables (ODEBRIDGE_*) - overrides project
/// 4. Explicit values - highest priority (handled by caller)
pub struct ConfigLoader {
    /// Override for the global file location
    global_config_path: Option<PathBuf>,
}

/// Configuration after all layers are applied
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Project configuration
    pub project: ProjectConfig,

    /// Global configuration
    pub global: GlobalConfig,

    /// Project root directory (where odebridge.toml was found)
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Create a loader that reads the global config from an explicit path
    pub fn with_global_path(path: PathBuf) -> Self {
        Self {
            global_config_path: Some(path),
        }
    }

    /// Resolve configuration for a run started in `start_dir`
    ///
    /// Walks up the directory tree to find odebridge.toml, then loads and merges
    /// global config if it exists.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project_config) = self.find_project_config(start_dir)?;

        let global_config = self.global_or_default();

        let project_config = self.apply_env_overrides(project_config)?;

        Ok(Config {
            project: project_config,
            global: global_config,
            project_root,
        })
    }

    /// Resolve configuration with an explicit project file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let project_config = ProjectConfig::load_from_file(config_path)?;
        let global_config = self.global_or_default();
        let project_config = self.apply_env_overrides(project_config)?;

        let project_root = config_path.parent().map(|p| p.to_path_buf());

        Ok(Config {
            project: project_config,
            global: global_config,
            project_root,
        })
    }

    /// Walk up from `start_dir` until an `odebridge.toml` turns up
    fn find_project_config(
        &self,
        start_dir: &Path,
    ) -> ConfigResult<(Option<PathBuf>, ProjectConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_CONFIG_FILE);

            if config_path.exists() {
                let project_config = ProjectConfig::load_from_file(&config_path)?;
                return Ok((Some(current), project_config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, ProjectConfig::default())),
            }
        }
    }

    /// Load global configuration from ~/.odebridge/config.toml
    fn load_global_config(&mut self) -> ConfigResult<GlobalConfig> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => {
                let path = GlobalConfig::global_config_path()?;
                self.global_config_path = Some(path.clone());
                path
            }
        };

        if !path.exists() {
            return Ok(GlobalConfig::default());
        }

        GlobalConfig::load_from_file(&path)
    }

    /// Global layer; an unreadable global file is reported and skipped
    fn global_or_default(&mut self) -> GlobalConfig {
        self.load_global_config().unwrap_or_else(|err| {
            tracing::warn!(
                target: "odebridge::config",
                path = ?self.global_config_path,
                error = %err,
                "ignoring unusable global configuration"
            );
            GlobalConfig::default()
        })
    }

    /// Environment layer
    ///
    /// - ODEBRIDGE_LOG: comma separated topic list
    /// - ODEBRIDGE_LOG_SINK: "tracing" or "stderr"
    /// - ODEBRIDGE_KERNEL_LIBRARY: library name or path
    /// - ODEBRIDGE_INT_WIDTH: 32 or 64
    fn apply_env_overrides(&self, mut config: ProjectConfig) -> ConfigResult<ProjectConfig> {
        if let Ok(topics) = env::var("ODEBRIDGE_LOG") {
            let topics: Vec<String> = topics
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            validate_topics("ODEBRIDGE_LOG", &topics)?;
            config
                .logging
                .get_or_insert_with(LoggingConfig::default)
                .topics = Some(topics);
        }

        if let Ok(sink) = env::var("ODEBRIDGE_LOG_SINK") {
            validate_sink("ODEBRIDGE_LOG_SINK", &sink)?;
            config.logging.get_or_insert_with(LoggingConfig::default).sink = Some(sink);
        }

        if let Ok(library) = env::var("ODEBRIDGE_KERNEL_LIBRARY") {
            config.kernel.get_or_insert_with(KernelConfig::default).library =
                Some(PathBuf::from(library));
        }

        if let Ok(width) = env::var("ODEBRIDGE_INT_WIDTH") {
            let width: u32 = width.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: "ODEBRIDGE_INT_WIDTH".to_string(),
                reason: format!("'{}' is not an integer", width),
            })?;
            validate_int_width("ODEBRIDGE_INT_WIDTH", width)?;
            config.kernel.get_or_insert_with(KernelConfig::default).int_width = Some(width);
        }

        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Enabled log topics (project > global > ["general"])
    pub fn log_topics(&self) -> Vec<String> {
        self.project
            .logging
            .as_ref()
            .and_then(|l| l.topics.clone())
            .or_else(|| self.global.logging.as_ref().and_then(|l| l.topics.clone()))
            .unwrap_or_else(|| vec!["general".to_string()])
    }

    /// Log sink name (project > global > "tracing")
    pub fn log_sink(&self) -> &str {
        self.project
            .logging
            .as_ref()
            .and_then(|l| l.sink.as_deref())
            .or_else(|| self.global.logging.as_ref().and_then(|l| l.sink.as_deref()))
            .unwrap_or("tracing")
    }

    /// Kernel library name or path, if configured
    pub fn kernel_library(&self) -> Option<&Path> {
        self.project.kernel_library()
    }

    /// Native integer width (project > global > 64)
    pub fn int_width(&self) -> u32 {
        self.project
            .int_width()
            .or_else(|| self.global.kernel.as_ref().and_then(|k| k.int_width))
            .unwrap_or(DEFAULT_INT_WIDTH)
    }

    /// Integrator symbol name
    pub fn integrator_symbol(&self) -> &str {
        self.project
            .kernel
            .as_ref()
            .and_then(|k| k.integrator_symbol.as_deref())
            .unwrap_or(DEFAULT_INTEGRATOR_SYMBOL)
    }

    /// Continuous-extension symbol name
    pub fn continuation_symbol(&self) -> &str {
        self.project
            .kernel
            .as_ref()
            .and_then(|k| k.continuation_symbol.as_deref())
            .unwrap_or(DEFAULT_CONTINUATION_SYMBOL)
    }

    /// Extra library search paths; the project root comes first when present
    pub fn search_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.project_root.iter().cloned().collect();
        paths.extend(self.global.search_paths().iter().cloned());
        paths
    }

    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if this is a project (has odebridge.toml)
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn create_config_file(dir: &Path, content: &str) -> PathBuf {
        let config_path = dir.join(PROJECT_CONFIG_FILE);
        fs::write(&config_path, content).unwrap();
        config_path
    }

    fn isolated_loader(dir: &TempDir) -> ConfigLoader {
        ConfigLoader::with_global_path(dir.path().join("no-global.toml"))
    }

    #[test]
    #[serial]
    fn test_find_config_in_parent() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(
            temp_dir.path(),
            r#"
[kernel]
int_width = 32
"#,
        );

        let sub_dir = temp_dir.path().join("subdir");
        fs::create_dir(&sub_dir).unwrap();

        let mut loader = isolated_loader(&temp_dir);
        let config = loader.load_from_directory(&sub_dir).unwrap();

        assert_eq!(config.int_width(), 32);
        assert_eq!(config.project_root(), Some(temp_dir.path()));
    }

    #[test]
    #[serial]
    fn test_env_override_int_width() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(
            temp_dir.path(),
            r#"
[kernel]
int_width = 64
"#,
        );

        env::set_var("ODEBRIDGE_INT_WIDTH", "32");
        let mut loader = isolated_loader(&temp_dir);
        let config = loader.load_from_directory(temp_dir.path());
        env::remove_var("ODEBRIDGE_INT_WIDTH");

        assert_eq!(config.unwrap().int_width(), 32);
    }

    #[test]
    #[serial]
    fn test_env_override_rejects_bad_width() {
        let temp_dir = TempDir::new().unwrap();

        env::set_var("ODEBRIDGE_INT_WIDTH", "48");
        let mut loader = isolated_loader(&temp_dir);
        let result = loader.load_from_directory(temp_dir.path());
        env::remove_var("ODEBRIDGE_INT_WIDTH");

        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    #[serial]
    fn test_malformed_global_config_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let global = temp_dir.path().join("global.toml");
        fs::write(&global, "[kernel\nint_width = ").unwrap();
        create_config_file(
            temp_dir.path(),
            r#"
[kernel]
library = "radau5"
"#,
        );

        let mut loader = ConfigLoader::with_global_path(global);
        let config = loader.load_from_directory(temp_dir.path()).unwrap();

        assert_eq!(config.global, GlobalConfig::default());
        assert_eq!(config.kernel_library(), Some(Path::new("radau5")));
    }

    #[test]
    fn test_defaults_without_any_file() {
        let config = Config::default();

        assert_eq!(config.int_width(), 64);
        assert_eq!(config.log_sink(), "tracing");
        assert_eq!(config.log_topics(), vec!["general".to_string()]);
        assert_eq!(config.integrator_symbol(), "radau5_");
        assert_eq!(config.continuation_symbol(), "contr5_");
        assert!(!config.is_project());
    }
}
