//! Server configuration: TOML file + CLI overrides.

use ciphertalk_core::{Framing, TalkError, TalkResult, MIN_VERIFICATION_LEN, SEAL_OVERHEAD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Smallest accepted frame ceiling: an armored public key and a sealed
/// handshake envelope must both fit.
const MIN_FRAME_LEN: usize = 1024;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub identity: IdentitySection,
    #[serde(default)]
    pub keys: KeysSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub framing: Framing,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            framing: Framing::default(),
            max_frame_len: default_max_frame_len(),
            handshake_timeout: default_handshake_timeout(),
            send_queue_depth: default_send_queue_depth(),
        }
    }
}

/// `[identity]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentitySection {
    #[serde(default = "default_min_len")]
    pub min_len: usize,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default = "default_alphabet")]
    pub alphabet: String,
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            min_len: default_min_len(),
            max_len: default_max_len(),
            alphabet: default_alphabet(),
        }
    }
}

/// `[keys]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct KeysSection {
    #[serde(default = "default_verification_len")]
    pub verification_len: usize,
    #[serde(default)]
    pub key_file: String,
}

impl Default for KeysSection {
    fn default() -> Self {
        Self {
            verification_len: default_verification_len(),
            key_file: String::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6978
}
fn default_max_frame_len() -> usize {
    ciphertalk_core::DEFAULT_MAX_FRAME_LEN
}
fn default_handshake_timeout() -> u64 {
    30
}
fn default_send_queue_depth() -> usize {
    256
}
fn default_min_len() -> usize {
    3
}
fn default_max_len() -> usize {
    16
}
fn default_alphabet() -> String {
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_".to_string()
}
fn default_verification_len() -> usize {
    ciphertalk_core::DEFAULT_VERIFICATION_LEN
}

/// Which identity strings the handshake accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRules {
    pub min_len: usize,
    pub max_len: usize,
    pub alphabet: String,
}

impl IdentityRules {
    /// Length in characters within bounds, every character in the alphabet.
    pub fn accepts(&self, identity: &str) -> bool {
        let len = identity.chars().count();
        len >= self.min_len
            && len <= self.max_len
            && identity.chars().all(|c| self.alphabet.contains(c))
    }
}

impl Default for IdentityRules {
    fn default() -> Self {
        let section = IdentitySection::default();
        Self {
            min_len: section.min_len,
            max_len: section.max_len,
            alphabet: section.alphabet,
        }
    }
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub framing: Option<Framing>,
    pub handshake_timeout: Option<u64>,
    pub key_file: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub framing: Framing,
    pub max_frame_len: usize,
    /// `None` disables the handshake deadline.
    pub handshake_timeout: Option<Duration>,
    pub send_queue_depth: usize,
    pub identity: IdentityRules,
    pub verification_len: usize,
    pub key_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            framing: Framing::default(),
            max_frame_len: default_max_frame_len(),
            handshake_timeout: Some(Duration::from_secs(default_handshake_timeout())),
            send_queue_depth: default_send_queue_depth(),
            identity: IdentityRules::default(),
            verification_len: default_verification_len(),
            key_file: None,
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> TalkResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    pub fn parse(content: &str) -> TalkResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| TalkError::Config(format!("config parse error: {e}")))
    }

    /// Merge CLI overrides into a parsed file and validate the result.
    pub fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> TalkResult<Self> {
        let server = file.server;
        let handshake_secs = overrides.handshake_timeout.unwrap_or(server.handshake_timeout);
        let key_file = overrides.key_file.unwrap_or(file.keys.key_file);

        let config = Self {
            host: overrides.host.unwrap_or(server.host),
            port: overrides.port.unwrap_or(server.port),
            framing: overrides.framing.unwrap_or(server.framing),
            max_frame_len: server.max_frame_len,
            handshake_timeout: (handshake_secs > 0).then(|| Duration::from_secs(handshake_secs)),
            send_queue_depth: server.send_queue_depth,
            identity: IdentityRules {
                min_len: file.identity.min_len,
                max_len: file.identity.max_len,
                alphabet: file.identity.alphabet,
            },
            verification_len: file.keys.verification_len,
            key_file: (!key_file.trim().is_empty()).then(|| expand_tilde_str(key_file.trim())),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> TalkResult<()> {
        if self.verification_len < MIN_VERIFICATION_LEN {
            return Err(TalkError::Config(format!(
                "keys.verification_len must be at least {MIN_VERIFICATION_LEN}, got {}",
                self.verification_len
            )));
        }
        if self.identity.min_len == 0 || self.identity.min_len > self.identity.max_len {
            return Err(TalkError::Config(format!(
                "identity bounds invalid: min_len {} max_len {}",
                self.identity.min_len, self.identity.max_len
            )));
        }
        if self.identity.alphabet.is_empty() {
            return Err(TalkError::Config("identity.alphabet is empty".into()));
        }
        if self.max_frame_len < MIN_FRAME_LEN + SEAL_OVERHEAD {
            return Err(TalkError::Config(format!(
                "server.max_frame_len must be at least {}, got {}",
                MIN_FRAME_LEN + SEAL_OVERHEAD,
                self.max_frame_len
            )));
        }
        if self.send_queue_depth == 0 {
            return Err(TalkError::Config("server.send_queue_depth must be positive".into()));
        }
        Ok(())
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "127.0.0.1:6978");
        assert_eq!(config.framing, Framing::LengthPrefixed);
        assert_eq!(config.handshake_timeout, Some(Duration::from_secs(30)));
        // Any envelope a client may seal has to fit.
        assert_eq!(config.max_frame_len, ciphertalk_core::DEFAULT_MAX_FRAME_LEN);
        assert_eq!(config.verification_len, 32);
        assert_eq!(config.identity.min_len, 3);
        assert_eq!(config.identity.max_len, 16);
        assert!(config.key_file.is_none());
    }

    #[test]
    fn parse_partial_file() {
        let file = ServerConfig::parse(
            r#"
[server]
port = 7000
framing = "raw"

[identity]
max_len = 8
"#,
        )
        .unwrap();
        let config = ServerConfig::resolve(file, ConfigOverrides::default()).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.framing, Framing::Raw);
        assert_eq!(config.identity.max_len, 8);
        assert_eq!(config.identity.min_len, 3);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn cli_overrides_win() {
        let file = ServerConfig::parse("[server]\nport = 7000\nhandshake_timeout = 5\n").unwrap();
        let config = ServerConfig::resolve(
            file,
            ConfigOverrides {
                port: Some(9000),
                host: Some("0.0.0.0".into()),
                handshake_timeout: Some(0),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
        assert_eq!(config.handshake_timeout, None);
    }

    #[test]
    fn short_verification_token_is_rejected() {
        let file = ServerConfig::parse("[keys]\nverification_len = 8\n").unwrap();
        let err = ServerConfig::resolve(file, ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, TalkError::Config(_)));
    }

    #[test]
    fn inverted_identity_bounds_are_rejected() {
        let file = ServerConfig::parse("[identity]\nmin_len = 10\nmax_len = 4\n").unwrap();
        assert!(ServerConfig::resolve(file, ConfigOverrides::default()).is_err());

        let file = ServerConfig::parse("[identity]\nalphabet = \"\"\n").unwrap();
        assert!(ServerConfig::resolve(file, ConfigOverrides::default()).is_err());
    }

    #[test]
    fn tiny_frame_limit_is_rejected() {
        let file = ServerConfig::parse("[server]\nmax_frame_len = 100\n").unwrap();
        assert!(ServerConfig::resolve(file, ConfigOverrides::default()).is_err());
    }

    #[test]
    fn unknown_framing_fails_to_parse() {
        assert!(ServerConfig::parse("[server]\nframing = \"cbor\"\n").is_err());
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = ServerConfig::load(Some(&path), ConfigOverrides::default()).unwrap();
        assert_eq!(config.port, 6978);
    }

    #[test]
    fn load_reads_key_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "[keys]\nkey_file = \"/tmp/ciphertalk.key\"\n").unwrap();
        let config = ServerConfig::load(Some(&path), ConfigOverrides::default()).unwrap();
        assert_eq!(config.key_file, Some(PathBuf::from("/tmp/ciphertalk.key")));
    }

    #[test]
    fn identity_rules() {
        let rules = IdentityRules::default();
        assert!(rules.accepts("alice"));
        assert!(rules.accepts("a-b_c"));
        assert!(!rules.accepts("al"));
        assert!(!rules.accepts("seventeen-chars-x"));
        assert!(!rules.accepts("bob smith"));
        assert!(!rules.accepts("élise"));
    }
}
