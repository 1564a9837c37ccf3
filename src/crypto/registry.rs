//! Cipher registry
//!
//! Maps a suite name to its key size, IV or salt size and constructor. A
//! registry is built once at startup and shared by `Arc`; custom suites may
//! be registered next to the built-in ones.

use super::aead::{AeadCryptor, AeadKind};
use super::kdf::KeyCache;
use super::stream::{StreamCryptor, StreamKind};
use super::Cryptor;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Builds a cryptor from a stretched key of the suite's key size
pub type CryptorFactory = Arc<dyn Fn(Arc<[u8]>) -> Result<Box<dyn Cryptor>> + Send + Sync>;

/// Cipher suite descriptor
#[derive(Clone)]
pub struct CipherSuite {
    name: String,
    key_size: usize,
    iv_size: usize,
    factory: CryptorFactory,
}

impl CipherSuite {
    pub fn new<F>(name: impl Into<String>, key_size: usize, iv_size: usize, factory: F) -> Self
    where
        F: Fn(Arc<[u8]>) -> Result<Box<dyn Cryptor>> + Send + Sync + 'static,
    {
        CipherSuite {
            name: name.into(),
            key_size,
            iv_size,
            factory: Arc::new(factory),
        }
    }

    pub fn aead(kind: AeadKind) -> Self {
        Self::new(kind.name(), kind.key_size(), kind.salt_size(), move |key| {
            Ok(Box::new(AeadCryptor::new(kind, key)?) as Box<dyn Cryptor>)
        })
    }

    pub fn stream(kind: StreamKind) -> Self {
        Self::new(kind.name(), kind.key_size(), kind.iv_size(), move |key| {
            Ok(Box::new(StreamCryptor::new(kind, key)?) as Box<dyn Cryptor>)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn iv_size(&self) -> usize {
        self.iv_size
    }

    /// Construct a cryptor from already derived key material
    pub fn build(&self, key: Arc<[u8]>) -> Result<Box<dyn Cryptor>> {
        (self.factory)(key)
    }
}

impl fmt::Debug for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSuite")
            .field("name", &self.name)
            .field("key_size", &self.key_size)
            .field("iv_size", &self.iv_size)
            .finish()
    }
}

/// Name to suite map plus the shared password key cache
pub struct CipherRegistry {
    suites: RwLock<HashMap<String, CipherSuite>>,
    keys: KeyCache,
}

impl Default for CipherRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl CipherRegistry {
    /// Registry with no suites at all
    pub fn empty() -> Self {
        CipherRegistry {
            suites: RwLock::new(HashMap::new()),
            keys: KeyCache::new(),
        }
    }

    /// Registry holding every built-in AEAD and stream suite
    pub fn with_builtin() -> Self {
        let registry = Self::empty();
        for kind in AeadKind::ALL {
            registry.register(CipherSuite::aead(kind));
        }
        for kind in StreamKind::ALL {
            registry.register(CipherSuite::stream(kind));
        }
        registry
    }

    /// Add or replace a suite. Lookup is case-insensitive.
    pub fn register(&self, suite: CipherSuite) {
        debug!(cipher = suite.name(), "registering cipher suite");
        self.suites.write().insert(suite.name.to_lowercase(), suite);
    }

    pub fn get(&self, method: &str) -> Option<CipherSuite> {
        self.suites.read().get(&method.to_lowercase()).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.suites.read().contains_key(&method.to_lowercase())
    }

    /// Registered suite names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.suites.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stretch `password` to the suite's key size and build a cryptor
    pub fn new_cryptor(&self, method: &str, password: &str) -> Result<Box<dyn Cryptor>> {
        let suite = self
            .get(method)
            .ok_or_else(|| Error::UnsupportedMethod(method.to_string()))?;
        let key = self.keys.get_or_derive(password, suite.key_size());
        suite.build(key)
    }

    pub fn key_cache(&self) -> &KeyCache {
        &self.keys
    }
}
