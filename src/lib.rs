//! Tunnel Proto - secure proxy protocol layer
//!
//! Client and server handshakes for three proxy protocol families:
//! - Shadowsocks: AEAD chunked framing or legacy stream ciphers, with the
//!   destination carried as the first encrypted bytes
//! - SOCKS5: method negotiation, username/password auth and CONNECT
//! - Trojan: password digest authentication over an outer TLS channel
//!
//! # Architecture
//!
//! ```text
//!        +-------------+                 +-------------+
//!        |  outbound/  |                 |  inbound/   |
//!        |  (clients)  |                 |  (servers)  |
//!        +------+------+                 +------+------+
//!               |                               |
//!               +---------------+---------------+
//!                               |
//!        +-------------+-------v-------+-------------+
//!        |             |               |             |
//! +------v------+ +----v-----+ +-------v-----+ +-----v------+
//! | transport/  | |  auth/   | |  common/    | |  config/   |
//! | (ss stream) | | (methods)| | (codecs)    | |  (yaml)    |
//! +------+------+ +----------+ +-------------+ +------------+
//!        |
//! +------v------+
//! |   crypto/   |
//! | (cryptors)  |
//! +-------------+
//! ```

pub mod auth;
pub mod common;
pub mod config;
pub mod crypto;
pub mod inbound;
pub mod outbound;
pub mod transport;

pub use common::error::{Error, Result};
pub use config::Config;

use auth::{AuthPassword, NoAuth, Socks5Auth, UserPasswordServer};
use common::error::IoContext;
use common::net::Destination;
use config::{load_tls_acceptor, InboundConfig};
use crypto::kdf::DigestCache;
use crypto::CipherRegistry;
use inbound::{
    InboundListener, ShadowsocksAcceptor, ShadowsocksInbound, Socks5Acceptor, Socks5Inbound, TrojanAcceptor,
    TrojanInbound,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Gateway instance running every configured inbound
pub struct Gateway {
    config: Config,
    registry: Arc<CipherRegistry>,
    inbounds: Vec<Arc<dyn InboundListener>>,
}

impl Gateway {
    /// Create a new Gateway from configuration
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing Tunnel Proto v{}", VERSION);

        let registry = Arc::new(CipherRegistry::with_builtin());
        config.validate_with(&registry)?;

        let digests = DigestCache::new();
        let timeout = config.handshake_timeout();

        let mut inbounds: Vec<Arc<dyn InboundListener>> = Vec::new();
        for inbound in &config.inbounds {
            inbounds.push(build_inbound(inbound, &registry, &digests, timeout)?);
            info!("Inbound configured on {}", inbound.listen());
        }

        Ok(Gateway {
            config,
            registry,
            inbounds,
        })
    }

    /// Start all inbound listeners and wait for ctrl-c
    pub async fn run(&self) -> Result<()> {
        info!("Starting gateway...");

        let mut handles = Vec::new();
        for inbound in &self.inbounds {
            let inbound = inbound.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = inbound.start().await {
                    warn!("{} inbound error: {}", inbound.name(), e);
                }
            });
            handles.push(handle);
        }

        tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
        info!("Received shutdown signal");

        for inbound in &self.inbounds {
            inbound.stop().await?;
        }
        for handle in handles {
            handle.abort();
        }

        info!("Gateway stopped");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CipherRegistry> {
        &self.registry
    }

    pub fn inbounds(&self) -> &[Arc<dyn InboundListener>] {
        &self.inbounds
    }
}

fn build_inbound(
    inbound: &InboundConfig,
    registry: &Arc<CipherRegistry>,
    digests: &DigestCache,
    timeout: Duration,
) -> Result<Arc<dyn InboundListener>> {
    let listener: Arc<dyn InboundListener> = match inbound {
        InboundConfig::Shadowsocks(c) => {
            let acceptor = ShadowsocksAcceptor::new(registry.clone(), &c.cipher, &c.password, timeout)?;
            Arc::new(ShadowsocksInbound::new(&c.listen, acceptor))
        }
        InboundConfig::Socks5(c) => {
            let auth: Arc<dyn Socks5Auth> = if c.users.is_empty() {
                Arc::new(NoAuth)
            } else {
                Arc::new(UserPasswordServer::new(c.users.clone()).reply_on_failure(c.reply_on_auth_failure))
            };
            Arc::new(Socks5Inbound::new(&c.listen, Socks5Acceptor::new(vec![auth], timeout)))
        }
        InboundConfig::Trojan(c) => {
            // Passwords shared between inbounds are hashed once
            let hashed = c.passwords.iter().map(|p| digests.get_or_hash(p).as_bytes().to_vec());
            let configured = c.digests.iter().map(|d| d.as_bytes().to_vec());
            let auth = AuthPassword::from_digests(hashed.chain(configured))?;

            let tls = load_tls_acceptor(&c.cert, &c.key)?;
            let mut trojan = TrojanInbound::new(&c.listen, TrojanAcceptor::new(tls, Arc::new(auth), timeout));
            if let Some(fallback) = &c.fallback {
                trojan = trojan.with_fallback(Destination::parse(fallback)?);
            }
            Arc::new(trojan)
        }
    };
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_gateway_builds_plain_inbounds() {
        let yaml = r#"
inbounds:
  - type: shadowsocks
    listen: 127.0.0.1:0
    cipher: aes-128-gcm
    password: secret
  - type: socks5
    listen: 127.0.0.1:1
    users:
      alice: wonderland
"#;
        let gateway = Gateway::new(Config::from_str(yaml).unwrap()).unwrap();
        let names: Vec<&str> = gateway.inbounds().iter().map(|i| i.name()).collect();
        assert_eq!(names, vec!["Shadowsocks", "SOCKS5"]);
        assert!(gateway.inbounds().iter().all(|i| !i.is_running()));
    }

    #[test]
    fn test_gateway_reports_missing_tls_files() {
        let yaml = r#"
inbounds:
  - type: trojan
    listen: 127.0.0.1:0
    passwords: [p1]
    cert: /nonexistent/server.crt
    key: /nonexistent/server.key
"#;
        let err = Gateway::new(Config::from_str(yaml).unwrap()).err().unwrap();
        assert!(matches!(err, Error::Tls(_)));
    }
}
