//! Trojan password digest authentication

use crate::crypto::kdf::{PasswordDigest, DIGEST_LEN};
use crate::Result;
use std::collections::HashSet;
use std::fmt;
use subtle::{Choice, ConstantTimeEq};

/// Checks the 56 byte digest a Trojan client opens with
pub trait Authenticator: Send + Sync {
    /// Short label used in logs
    fn method(&self) -> &'static str;

    fn verify(&self, digest: &[u8]) -> bool;
}

/// Set of accepted password digests
///
/// Passwords are hashed once at setup. A connection's digest is compared
/// against every entry in constant time.
#[derive(Clone, Default)]
pub struct AuthPassword {
    digests: HashSet<[u8; DIGEST_LEN]>,
}

impl AuthPassword {
    pub fn from_passwords<I, S>(passwords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let digests = passwords
            .into_iter()
            .map(|p| *PasswordDigest::new(p.as_ref()).as_bytes())
            .collect();
        AuthPassword { digests }
    }

    /// Build from digests that were hashed elsewhere
    pub fn from_digests<I, D>(digests: I) -> Result<Self>
    where
        I: IntoIterator<Item = D>,
        D: AsRef<[u8]>,
    {
        let digests = digests
            .into_iter()
            .map(|d| PasswordDigest::from_hex(d.as_ref()).map(|d| *d.as_bytes()))
            .collect::<Result<HashSet<_>>>()?;
        Ok(AuthPassword { digests })
    }

    pub fn add_password(&mut self, password: &str) {
        self.digests.insert(*PasswordDigest::new(password).as_bytes());
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

impl fmt::Debug for AuthPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthPassword")
            .field("digests", &self.digests.len())
            .finish()
    }
}

impl Authenticator for AuthPassword {
    fn method(&self) -> &'static str {
        "password"
    }

    fn verify(&self, digest: &[u8]) -> bool {
        if digest.len() != DIGEST_LEN {
            return false;
        }
        self.digests
            .iter()
            .fold(Choice::from(0), |found, known| found | known[..].ct_eq(digest))
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_passwords() {
        let auth = AuthPassword::from_passwords(["p1", "p2"]);
        assert_eq!(auth.len(), 2);
        assert!(auth.verify(PasswordDigest::new("p1").as_bytes()));
        assert!(auth.verify(PasswordDigest::new("p2").as_bytes()));
        assert!(!auth.verify(PasswordDigest::new("p3").as_bytes()));
        assert!(!auth.verify(&PasswordDigest::new("p1").as_bytes()[..10]));
    }

    #[test]
    fn test_from_digests() {
        let digest = PasswordDigest::new("secret");
        let auth = AuthPassword::from_digests([digest.as_bytes()]).unwrap();
        assert!(auth.verify(digest.as_bytes()));

        assert!(AuthPassword::from_digests([&b"short"[..]]).is_err());
    }

    #[test]
    fn test_add_password() {
        let mut auth = AuthPassword::default();
        assert!(auth.is_empty());
        auth.add_password("late");
        assert!(auth.verify(PasswordDigest::new("late").as_bytes()));
        assert_eq!(auth.method(), "password");
    }

    #[test]
    fn test_verify_compares_whole_digest() {
        let digest = PasswordDigest::new("secret");
        let auth = AuthPassword::from_passwords(["other", "secret"]);

        let mut near = *digest.as_bytes();
        near[DIGEST_LEN - 1] = if near[DIGEST_LEN - 1] == b'0' { b'1' } else { b'0' };
        assert!(!auth.verify(&near));
        assert!(auth.verify(digest.as_bytes()));
        assert!(!auth.verify(&[]));
    }
}
