use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "ARI_WEB_DATA_DIR";
const ENV_OUTPUT_DIR: &str = "ARI_OUTPUT_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Where the scripts drop their reports; served by the outputs endpoints.
    pub output_dir: PathBuf,
    /// Scratch directory for the per-job script files.
    pub scripts_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Sqlite,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobsConfig {
    pub store: StoreBackend,
    pub persist_interval_secs: u64,
    pub settle_delay_secs: u64,
    pub shell: String,
    pub pwsh: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            server: ServerConfig::default(),
            jobs: JobsConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("reports"),
            scripts_dir: PathBuf::from("scripts"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Sqlite,
            persist_interval_secs: 10,
            settle_delay_secs: 2,
            shell: "/bin/bash".to_string(),
            pwsh: "pwsh".to_string(),
        }
    }
}

impl JobsConfig {
    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Report directory, honouring `ARI_OUTPUT_DIR` over the configured value.
    pub fn output_dir(&self, data_dir: &Path) -> PathBuf {
        let configured = env::var_os(ENV_OUTPUT_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.paths.output_dir.clone());
        resolve_relative_to(data_dir, &configured)
    }

    pub fn scripts_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.scripts_dir)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. ARI_WEB_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and a default config.toml on first run.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.output_dir, PathBuf::from("reports"));
        assert_eq!(cfg.paths.scripts_dir, PathBuf::from("scripts"));
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.jobs.store, StoreBackend::Sqlite);
        assert_eq!(cfg.jobs.persist_interval(), Duration::from_secs(10));
        assert_eq!(cfg.jobs.settle_delay(), Duration::from_secs(2));
        assert_eq!(cfg.jobs.shell, "/bin/bash");
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_fields() {
        let cfg: AppConfig = toml::from_str(
            "[jobs]\nstore = \"json\"\nsettle_delay_secs = 0\n\n[server]\nport = 9100\n",
        )
        .expect("parse partial config");

        assert_eq!(cfg.jobs.store, StoreBackend::Json);
        assert_eq!(cfg.jobs.settle_delay_secs, 0);
        assert_eq!(cfg.jobs.persist_interval_secs, 10);
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.paths, PathsConfig::default());
    }

    #[test]
    fn unknown_store_backend_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[jobs]\nstore = \"redis\"\n").unwrap();

        assert!(AppConfig::load_from_path(&path).is_err());
    }

    #[test]
    fn load_from_missing_or_empty_file_returns_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.toml");
        assert_eq!(AppConfig::load_from_path(&path).unwrap(), AppConfig::default());

        fs::write(&path, "  \n").unwrap();
        assert_eq!(AppConfig::load_from_path(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        assert_eq!(
            config_path(Path::new("/data")),
            PathBuf::from("/data/config.toml")
        );
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().unwrap();
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[server]\nport = 9999\n";
        fs::write(&cfg_path, custom_content).unwrap();

        initialize_data_dir(temp.path()).expect("initialize data dir");

        assert_eq!(fs::read_to_string(&cfg_path).unwrap(), custom_content);
    }

    #[test]
    fn initialize_writes_default_config_once() {
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("nested");

        initialize_data_dir(&data).expect("initialize data dir");

        let loaded = AppConfig::load_from_path(&config_path(&data)).unwrap();
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn relative_paths_resolve_under_data_dir() {
        let cfg = AppConfig::default();
        assert_eq!(
            cfg.scripts_dir(Path::new("/srv/ari")),
            PathBuf::from("/srv/ari/scripts")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
    }
}
