//! Configuration module

mod tls;

pub use tls::load_tls_acceptor;

use crate::crypto::{CipherRegistry, PasswordDigest};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level
    #[serde(rename = "log-level")]
    pub log_level: String,

    /// Handshake deadline in seconds, 0 disables it
    #[serde(rename = "handshake-timeout")]
    pub handshake_timeout: u64,

    /// Inbound listeners
    pub inbounds: Vec<InboundConfig>,
}

impl Config {
    /// Load configuration from file (synchronous)
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::config(format!("read {}: {}", path, e)))?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| Error::config(format!("read {}: {}", path.display(), e)))?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate against the builtin cipher suites
    pub fn validate(&self) -> Result<()> {
        self.validate_with(&CipherRegistry::with_builtin())
    }

    /// Validate configuration
    pub fn validate_with(&self, registry: &CipherRegistry) -> Result<()> {
        let mut listens = HashSet::new();
        for inbound in &self.inbounds {
            if !listens.insert(inbound.listen()) {
                return Err(Error::config(format!("duplicate listen address {}", inbound.listen())));
            }
            inbound.validate(registry)?;
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_string(),
            handshake_timeout: 10,
            inbounds: Vec::new(),
        }
    }
}

/// One listener, tagged by protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundConfig {
    Shadowsocks(ShadowsocksInboundConfig),
    Socks5(Socks5InboundConfig),
    Trojan(TrojanInboundConfig),
}

impl InboundConfig {
    pub fn listen(&self) -> &str {
        match self {
            InboundConfig::Shadowsocks(c) => &c.listen,
            InboundConfig::Socks5(c) => &c.listen,
            InboundConfig::Trojan(c) => &c.listen,
        }
    }

    fn validate(&self, registry: &CipherRegistry) -> Result<()> {
        if self.listen().is_empty() {
            return Err(Error::config("Inbound listen address cannot be empty"));
        }
        match self {
            InboundConfig::Shadowsocks(c) => {
                if !registry.contains(&c.cipher) {
                    return Err(Error::UnsupportedMethod(c.cipher.clone()));
                }
            }
            InboundConfig::Socks5(_) => {}
            InboundConfig::Trojan(c) => {
                if c.passwords.is_empty() && c.digests.is_empty() {
                    return Err(Error::config(format!("trojan inbound {} has no passwords", c.listen)));
                }
                for digest in &c.digests {
                    PasswordDigest::from_hex(digest.as_bytes())
                        .map_err(|e| Error::config(format!("trojan inbound {} has a bad digest: {}", c.listen, e)))?;
                }
            }
        }
        Ok(())
    }
}

/// Shadowsocks inbound configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowsocksInboundConfig {
    /// Listen address
    pub listen: String,

    /// Cipher suite name
    pub cipher: String,

    pub password: String,
}

/// SOCKS5 inbound configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Socks5InboundConfig {
    /// Listen address
    pub listen: String,

    /// Username to password; empty means no authentication
    #[serde(default)]
    pub users: HashMap<String, String>,

    /// Send a failure status before closing on bad credentials
    #[serde(rename = "reply-on-auth-failure", default = "default_true")]
    pub reply_on_auth_failure: bool,
}

/// Trojan inbound configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrojanInboundConfig {
    /// Listen address
    pub listen: String,

    #[serde(default)]
    pub passwords: Vec<String>,

    /// Hex SHA-224 digests of passwords kept out of the file
    #[serde(default)]
    pub digests: Vec<String>,

    /// PEM certificate chain
    pub cert: PathBuf,

    /// PEM private key
    pub key: PathBuf,

    /// Where to relay clients that fail authentication
    pub fallback: Option<String>,
}

fn default_true() -> bool {
    true
}
