//! Key derivation: password stretching, AEAD subkeys and Trojan digests

use crate::{Error, Result};
use dashmap::DashMap;
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha224;
use std::fmt;
use std::sync::Arc;

/// Context tag binding AEAD subkeys to this protocol
const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Length of a hex encoded SHA-224 password digest
pub const DIGEST_LEN: usize = 56;

/// Derive key from password using EVP_BytesToKey (MD5, one iteration per round)
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }

    key.truncate(key_len);
    key
}

/// Derive a per-direction subkey using HKDF-SHA1 keyed by the master key
/// and salted with the connection salt
pub fn derive_subkey(master_key: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut subkey = vec![0u8; master_key.len()];
    hk.expand(SUBKEY_INFO, &mut subkey)
        .map_err(|e| Error::crypto(format!("subkey expansion: {}", e)))?;
    Ok(subkey)
}

/// Increment a little-endian counter in place, wrapping on overflow
pub fn increment_nonce(nonce: &mut [u8]) {
    for byte in nonce.iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

/// Cache of stretched keys, keyed by (password, length)
///
/// Shared by every connection using the same password. Concurrent first
/// insertions of the same entry compute identical bytes, so either wins.
#[derive(Default)]
pub struct KeyCache {
    keys: DashMap<(String, usize), Arc<[u8]>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_derive(&self, password: &str, key_len: usize) -> Arc<[u8]> {
        let lookup = (password.to_string(), key_len);
        if let Some(key) = self.keys.get(&lookup) {
            return key.clone();
        }

        let key: Arc<[u8]> = evp_bytes_to_key(password.as_bytes(), key_len).into();
        self.keys.entry(lookup).or_insert(key).clone()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Hex encoded SHA-224 digest of a Trojan password
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PasswordDigest([u8; DIGEST_LEN]);

impl PasswordDigest {
    pub fn new(password: &str) -> Self {
        let hash = Sha224::digest(password.as_bytes());
        let mut out = [0u8; DIGEST_LEN];
        // 28 bytes always encode to exactly 56 hex characters
        out.copy_from_slice(hex::encode(hash).as_bytes());
        PasswordDigest(out)
    }

    /// Accept an already hashed digest, checking its length and alphabet
    pub fn from_hex(digest: &[u8]) -> Result<Self> {
        let bytes: [u8; DIGEST_LEN] = digest
            .try_into()
            .map_err(|_| Error::InvalidLength("trojan digest must be 56 hex characters"))?;
        if !bytes.iter().all(u8::is_ascii_hexdigit) {
            return Err(Error::config("trojan digest is not hex encoded"));
        }
        Ok(PasswordDigest(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Debug for PasswordDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordDigest(<redacted>)")
    }
}

/// Cache of Trojan password digests, keyed by password
#[derive(Default)]
pub struct DigestCache {
    digests: DashMap<String, PasswordDigest>,
}

impl DigestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_hash(&self, password: &str) -> PasswordDigest {
        if let Some(digest) = self.digests.get(password) {
            return *digest;
        }
        *self
            .digests
            .entry(password.to_string())
            .or_insert_with(|| PasswordDigest::new(password))
    }
}
