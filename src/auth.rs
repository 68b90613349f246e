//! Client authentication
//!
//! Listeners construct an `Authentication` record from protocol-specific
//! inputs (Proxy-Authorization header, SOCKS5 user/pass sub-negotiation,
//! or just the source address) and the dispatcher hands it to the shared
//! `Authenticator`. The credential store behind the authenticator is an
//! external concern; this module only defines the callable surface plus
//! the minimal in-memory store the configuration file can populate.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::common::Address;
use crate::error::{Error, Result};

/// How the client credential was presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// No explicit credential; trust is based on the source address.
    Source,
    /// `user:pass`, from HTTP Basic or SOCKS5 RFC 1929 sub-negotiation.
    Basic,
    /// Bearer token from an HTTP `Proxy-Authorization` header.
    Bearer,
    /// Raw header value with no recognized prefix.
    Token,
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scheme::Source => write!(f, "Source"),
            Scheme::Basic => write!(f, "Basic"),
            Scheme::Bearer => write!(f, "Bearer"),
            Scheme::Token => write!(f, "Token"),
        }
    }
}

/// Credential record built once by the listener, never mutated after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authentication {
    pub source: Address,
    pub scheme: Scheme,
    pub credential: Vec<u8>,
}

impl Authentication {
    pub fn new(source: Address, scheme: Scheme, credential: Vec<u8>) -> Self {
        Self {
            source,
            scheme,
            credential,
        }
    }

    /// The source-trust record used when a protocol carries no credential.
    pub fn source_only(source: Address) -> Self {
        Self {
            source,
            scheme: Scheme::Source,
            credential: Vec::new(),
        }
    }
}

/// Decides whether a client may use the proxy.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, auth: &Authentication) -> Result<()>;
}

/// Accepts every client. Used when no credential store is configured.
pub struct AllowAllAuthenticator;

#[async_trait]
impl Authenticator for AllowAllAuthenticator {
    async fn authenticate(&self, _auth: &Authentication) -> Result<()> {
        Ok(())
    }
}

/// In-memory `user -> password` store checking Basic credentials.
///
/// Source-scheme records pass: protocols running without an explicit
/// credential exchange (raw TCP/UDP, SOCKS5 with auth disabled) fall back
/// to source trust.
pub struct StaticUserAuthenticator {
    users: HashMap<String, String>,
}

impl StaticUserAuthenticator {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl Authenticator for StaticUserAuthenticator {
    async fn authenticate(&self, auth: &Authentication) -> Result<()> {
        match auth.scheme {
            Scheme::Source => Ok(()),
            Scheme::Basic => {
                let credential = std::str::from_utf8(&auth.credential)
                    .map_err(|_| Error::Unauthorized)?;
                let (user, pass) = credential.split_once(':').ok_or(Error::Unauthorized)?;
                match self.users.get(user) {
                    Some(expected) if expected == pass => Ok(()),
                    _ => Err(Error::Unauthorized),
                }
            }
            Scheme::Bearer | Scheme::Token => Err(Error::Unauthorized),
        }
    }
}
