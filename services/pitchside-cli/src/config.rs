//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Only the API base URL can be overridden from the environment
//! (`PITCHSIDE_BASE_URL`); tokens never appear in configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use transport::HeaderInjection;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub session: SessionConfig,
    #[serde(default)]
    pub headers: Vec<HeaderInjection>,
}

/// Backend connection settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Session persistence and refresh settings
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    pub storage_path: PathBuf,
    /// Refresh JWT access tokens this close to expiry
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
    /// Proactive refresh check interval; 0 disables the background task
    #[serde(default)]
    pub background_refresh_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

fn default_refresh_threshold() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("PITCHSIDE_BASE_URL") {
            config.api.base_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.session.storage_path.as_os_str().is_empty() {
            return Err(common::Error::Config(
                "storage_path must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("pitchside.toml")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.session.refresh_threshold_secs)
    }

    /// `None` when the background refresh task is disabled.
    pub fn background_refresh_interval(&self) -> Option<Duration> {
        match self.session.background_refresh_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
