//! Configuration loading.
//!
//! Settings come from a TOML file (explicit path or
//! `~/.glovebox/config.toml`), with sane defaults for everything so an
//! empty file works. Values mirror the knobs of the automation core:
//! provider, display stack, retry policy, challenge signatures, and
//! session timing.

use crate::detector::ChallengeSignature;
use crate::display::DisplayConfig;
use crate::provider::DockerProviderConfig;
use crate::retry::RetryPolicy;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Session timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle budget applied when the caller does not pass one.
    #[serde(default = "default_idle_timeout_secs")]
    pub default_idle_timeout_secs: u64,
    /// Interval of the background idle sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Bounded wait applied to every driver action.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    1800
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_step_timeout_secs() -> u64 {
    120
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl SessionConfig {
    pub fn default_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.default_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: DockerProviderConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub session: SessionConfig,
    /// Known challenge-page signatures, per target site.
    #[serde(default)]
    pub challenges: Vec<ChallengeSignature>,
}

impl Config {
    fn default_path() -> PathBuf {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_dir.join(".glovebox").join("config.toml")
    }

    /// Load configuration from a file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path.unwrap_or_else(Self::default_path);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: Option<PathBuf>) -> Result<()> {
        let config_path = path.unwrap_or_else(Self::default_path);
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(Some(dir.path().join("nope.toml"))).unwrap();
        assert_eq!(config.session.default_idle_timeout_secs, 1800);
        assert_eq!(config.display.vnc_port_base, 5901);
        assert!(config.challenges.is_empty());
    }

    #[test]
    fn roundtrip_preserves_challenges() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.challenges.push(ChallengeSignature {
            name: "captcha".into(),
            title_markers: vec!["(?i)verify".into()],
            url_markers: vec!["/challenge".into()],
        });
        config.save(Some(path.clone())).unwrap();

        let loaded = Config::load(Some(path)).unwrap();
        assert_eq!(loaded.challenges.len(), 1);
        assert_eq!(loaded.challenges[0].name, "captcha");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nsweep_interval_secs = 5\n").unwrap();

        let config = Config::load(Some(path)).unwrap();
        assert_eq!(config.session.sweep_interval_secs, 5);
        assert_eq!(config.session.step_timeout_secs, 120);
    }
}
