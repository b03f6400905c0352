//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/docsync/config.toml)
//! 3. Environment variables (DOCSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::PeerConfig;

/// Environment variable prefix
const ENV_PREFIX: &str = "DOCSYNC";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for local data (document store, root document ID)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory of a remote document store to sync with (optional)
    #[serde(default)]
    pub remote_dir: Option<PathBuf>,

    /// Seconds to wait before retrying a failed sync attempt
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            remote_dir: None,
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (DOCSYNC_DATA_DIR, DOCSYNC_REMOTE_DIR,
    ///    DOCSYNC_RETRY_DELAY_SECS)
    /// 2. Config file (~/.config/docsync/config.toml or DOCSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        // DOCSYNC_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // DOCSYNC_REMOTE_DIR
        if let Ok(val) = std::env::var(format!("{}_REMOTE_DIR", ENV_PREFIX)) {
            self.remote_dir = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        // DOCSYNC_RETRY_DELAY_SECS
        if let Ok(val) = std::env::var(format!("{}_RETRY_DELAY_SECS", ENV_PREFIX)) {
            self.retry_delay_secs = val
                .parse()
                .with_context(|| format!("Invalid {}_RETRY_DELAY_SECS: {:?}", ENV_PREFIX, val))?;
        }

        Ok(())
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with DOCSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docsync")
            .join("config.toml")
    }

    /// Directory holding one file per local document
    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir.join("docs")
    }

    /// Get the path to the root document ID file
    pub fn root_doc_id_path(&self) -> PathBuf {
        self.data_dir.join("root_doc_id")
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            retry_delay: self.retry_delay(),
        }
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docsync")
}

fn default_retry_delay_secs() -> u64 {
    crate::sync::DEFAULT_RETRY_DELAY.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "DOCSYNC_DATA_DIR",
        "DOCSYNC_REMOTE_DIR",
        "DOCSYNC_RETRY_DELAY_SECS",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.remote_dir.is_none());
        assert_eq!(config.retry_delay_secs, 5);
        assert!(config.data_dir.ends_with("docsync"));
    }

    #[test]
    fn test_file_paths() {
        let config = Config {
            data_dir: PathBuf::from("/data/docsync"),
            ..Config::default()
        };

        assert_eq!(config.storage_dir(), PathBuf::from("/data/docsync/docs"));
        assert!(config.root_doc_id_path().ends_with("root_doc_id"));
    }

    #[test]
    fn test_peer_config() {
        let config = Config {
            retry_delay_secs: 2,
            ..Config::default()
        };
        assert_eq!(config.peer_config().retry_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("DOCSYNC_DATA_DIR", "/tmp/docsync-test");
        config.apply_env_overrides().unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/docsync-test"));
    }

    #[test]
    fn test_env_override_remote_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("DOCSYNC_REMOTE_DIR", "/mnt/shared/docs");
        config.apply_env_overrides().unwrap();
        assert_eq!(config.remote_dir, Some(PathBuf::from("/mnt/shared/docs")));

        // Empty string clears it
        env::set_var("DOCSYNC_REMOTE_DIR", "");
        config.apply_env_overrides().unwrap();
        assert!(config.remote_dir.is_none());
    }

    #[test]
    fn test_env_override_retry_delay() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("DOCSYNC_RETRY_DELAY_SECS", "30");
        config.apply_env_overrides().unwrap();
        assert_eq!(config.retry_delay(), Duration::from_secs(30));

        env::set_var("DOCSYNC_RETRY_DELAY_SECS", "soon");
        assert!(config.apply_env_overrides().is_err());
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/docsync"),
            remote_dir: Some(PathBuf::from("/mnt/remote")),
            retry_delay_secs: 10,
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("remote_dir"));
        assert!(toml_str.contains("retry_delay_secs"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.remote_dir, config.remote_dir);
        assert_eq!(parsed.retry_delay_secs, 10);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            remote_dir = "/custom/remote"
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.remote_dir, Some(PathBuf::from("/custom/remote")));
        assert_eq!(config.retry_delay_secs, 5);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("data");
        env::set_var("DOCSYNC_DATA_DIR", &data_dir);

        let path = temp_dir.path().join("missing.toml");
        let config = Config::load_from_path(&path).unwrap();

        assert!(config.remote_dir.is_none());
        assert_eq!(config.data_dir, data_dir);
        assert!(data_dir.exists());
    }

    #[test]
    fn test_load_from_path_reads_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("data");
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            format!("data_dir = {:?}\nretry_delay_secs = 1\n", data_dir),
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.data_dir, data_dir);
        assert_eq!(config.retry_delay_secs, 1);
    }
}
