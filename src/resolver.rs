//! Name resolution
//!
//! The dispatcher only needs a `name -> IP list` capability; how names are
//! actually resolved (system stub, DoH, caching) is an external concern.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::{Error, Result};

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Vec<IpAddr>>;
}

/// Resolves through the operating system's stub resolver.
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, name: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((name, 0))
            .await
            .map_err(|e| Error::ResolveFailed(format!("{}: {}", name, e)))?;
        let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        if ips.is_empty() {
            return Err(Error::ResolveFailed(format!("{}: no addresses", name)));
        }
        Ok(ips)
    }
}

/// Fixed name table, used in tests and for pinned hosts.
pub struct StaticResolver {
    table: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new(table: HashMap<String, Vec<IpAddr>>) -> Self {
        Self { table }
    }

    pub fn single(name: impl Into<String>, ip: IpAddr) -> Self {
        let mut table = HashMap::new();
        table.insert(name.into(), vec![ip]);
        Self { table }
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, name: &str) -> Result<Vec<IpAddr>> {
        match self.table.get(name) {
            Some(ips) if !ips.is_empty() => Ok(ips.clone()),
            _ => Err(Error::ResolveFailed(name.to_string())),
        }
    }
}
