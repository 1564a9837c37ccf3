//! SOCKS5 authentication methods
//!
//! A method is selected during negotiation and then runs its own
//! sub-protocol over the connection. Client and server roles implement the
//! same [`Socks5Auth`] trait so either side can hold a list of methods.

use super::ProxyStream;
use crate::common::socks::{
    read_auth_status, write_auth_status, UsernamePasswordRequest, AUTH_NO_AUTH, AUTH_USERNAME_PASSWORD,
    USER_PASSWORD_FAILURE, USER_PASSWORD_SUCCESS,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// A SOCKS5 authentication method
#[async_trait]
pub trait Socks5Auth: Send + Sync {
    /// Method identifier sent during negotiation
    fn method(&self) -> u8;

    /// Run the method's sub-negotiation over `stream`
    async fn authenticate(&self, stream: &mut dyn ProxyStream) -> Result<()>;
}

/// Method 0x00, nothing to exchange
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

#[async_trait]
impl Socks5Auth for NoAuth {
    fn method(&self) -> u8 {
        AUTH_NO_AUTH
    }

    async fn authenticate(&self, _stream: &mut dyn ProxyStream) -> Result<()> {
        Ok(())
    }
}

/// Method 0x02, client role: send credentials and check the status
#[derive(Clone)]
pub struct UserPassword {
    username: String,
    password: String,
}

impl UserPassword {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let (username, password) = (username.into(), password.into());
        if username.len() > 255 || password.len() > 255 {
            return Err(Error::InvalidLength("username or password longer than 255 bytes"));
        }
        Ok(UserPassword { username, password })
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for UserPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPassword")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Socks5Auth for UserPassword {
    fn method(&self) -> u8 {
        AUTH_USERNAME_PASSWORD
    }

    async fn authenticate(&self, stream: &mut dyn ProxyStream) -> Result<()> {
        UsernamePasswordRequest {
            username: self.username.as_bytes().to_vec(),
            password: self.password.as_bytes().to_vec(),
        }
        .write_to(stream)
        .await?;

        match read_auth_status(stream).await? {
            USER_PASSWORD_SUCCESS => {
                debug!(protocol = "socks5", username = %self.username, "credentials accepted");
                Ok(())
            }
            USER_PASSWORD_FAILURE => Err(Error::auth("username/password rejected by server")),
            status => Err(Error::UnknownStatus(status)),
        }
    }
}

/// Method 0x02, server role: check credentials against a user table
#[derive(Clone, Default)]
pub struct UserPasswordServer {
    users: HashMap<String, String>,
    reply_on_failure: bool,
}

impl UserPasswordServer {
    pub fn new(users: HashMap<String, String>) -> Self {
        UserPasswordServer {
            users,
            reply_on_failure: true,
        }
    }

    /// Whether a failure status is written before the error is returned
    pub fn reply_on_failure(mut self, reply: bool) -> Self {
        self.reply_on_failure = reply;
        self
    }

    pub fn add_user(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.users.insert(username.into(), password.into());
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    fn verify(&self, username: &[u8], password: &[u8]) -> bool {
        let Ok(username) = std::str::from_utf8(username) else {
            return false;
        };
        match self.users.get(username) {
            Some(expected) => expected.as_bytes().ct_eq(password).into(),
            None => false,
        }
    }
}

impl fmt::Debug for UserPasswordServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPasswordServer")
            .field("users", &self.users.len())
            .field("reply_on_failure", &self.reply_on_failure)
            .finish()
    }
}

#[async_trait]
impl Socks5Auth for UserPasswordServer {
    fn method(&self) -> u8 {
        AUTH_USERNAME_PASSWORD
    }

    async fn authenticate(&self, stream: &mut dyn ProxyStream) -> Result<()> {
        let request = UsernamePasswordRequest::read_from(stream).await?;
        let username = String::from_utf8_lossy(&request.username).into_owned();

        if self.verify(&request.username, &request.password) {
            write_auth_status(stream, true).await?;
            debug!(protocol = "socks5", username = %username, "credentials accepted");
            return Ok(());
        }

        warn!(protocol = "socks5", username = %username, "rejected credentials");
        if self.reply_on_failure {
            write_auth_status(stream, false).await?;
        }
        Err(Error::auth(format!("invalid credentials for user {:?}", username)))
    }
}
