//! Client configuration at `~/.ciphertalk/client.toml`.
//!
//! Provides default host, port, identity, framing and request timeout.
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use ciphertalk_client::{random_user, ClientConfig};
use ciphertalk_core::Framing;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default connection settings.
    #[serde(default)]
    pub default: DefaultConfig,
}

/// Default connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Identity to claim (empty = a random `user-N`).
    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub framing: Framing,

    /// Seconds a request waits for its reply (0 = forever).
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: String::new(),
            framing: Framing::default(),
            request_timeout: default_request_timeout(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6978
}

fn default_request_timeout() -> u64 {
    30
}

/// Values given on the command line.
#[derive(Debug, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub framing: Option<Framing>,
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &str) -> Result<Self> {
        let path = expand_tilde(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Connection settings after applying `overrides`.
    pub fn client_config(&self, overrides: Overrides) -> ClientConfig {
        let d = &self.default;
        let user = overrides
            .user
            .or_else(|| Some(d.user.clone()).filter(|u| !u.is_empty()))
            .unwrap_or_else(random_user);
        ClientConfig {
            host: overrides.host.unwrap_or_else(|| d.host.clone()),
            port: overrides.port.unwrap_or(d.port),
            user,
            framing: overrides.framing.unwrap_or(d.framing),
            request_timeout: (d.request_timeout > 0)
                .then(|| Duration::from_secs(d.request_timeout)),
            ..ClientConfig::default()
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(path),
        },
        None => Path::new(path).to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.default.host, "127.0.0.1");
        assert_eq!(cfg.default.port, 6978);
        assert_eq!(cfg.default.framing, Framing::LengthPrefixed);
        assert_eq!(cfg.default.request_timeout, 30);
        assert!(cfg.default.user.is_empty());
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[default]
host = "chat.example.com"
port = 7000
user = "alice"
framing = "raw"
request_timeout = 5
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.default.host, "chat.example.com");
        assert_eq!(cfg.default.port, 7000);
        assert_eq!(cfg.default.user, "alice");
        assert_eq!(cfg.default.framing, Framing::Raw);
        assert_eq!(cfg.default.request_timeout, 5);
    }

    #[test]
    fn parse_partial_toml_config() {
        let cfg: Config = toml::from_str("[default]\nport = 7001\n").unwrap();
        assert_eq!(cfg.default.port, 7001);
        assert_eq!(cfg.default.host, "127.0.0.1"); // default
        assert_eq!(cfg.default.request_timeout, 30); // default
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        let cfg = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.default.port, 6978);
    }

    #[test]
    fn load_reads_file_and_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");

        std::fs::write(&path, "[default]\nuser = \"bob\"\n").unwrap();
        let cfg = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.default.user, "bob");

        std::fs::write(&path, "[default]\nport = \"not a port\"\n").unwrap();
        assert!(Config::load(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn overrides_win_over_file_values() {
        let cfg: Config = toml::from_str(
            "[default]\nhost = \"a.example\"\nport = 7000\nuser = \"alice\"\nrequest_timeout = 0\n",
        )
        .unwrap();
        let client = cfg.client_config(Overrides {
            port: Some(7100),
            user: Some("carol".into()),
            ..Overrides::default()
        });
        assert_eq!(client.host, "a.example");
        assert_eq!(client.port, 7100);
        assert_eq!(client.user, "carol");
        assert_eq!(client.request_timeout, None);
    }

    #[test]
    fn blank_user_gets_a_random_identity() {
        let client = Config::default().client_config(Overrides::default());
        assert!(client.user.starts_with("user-"));
        assert_eq!(client.request_timeout, Some(Duration::from_secs(30)));
    }
}
