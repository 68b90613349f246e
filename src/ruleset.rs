//! Destination policy
//!
//! The ruleset decides whether an authenticated client may reach the
//! destination it asked for. The rule store format is external; the core
//! consumes the predicate surface. `NoRulesetMatched` is the "no rule had
//! an opinion" outcome and the dispatcher treats it as allow.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::common::{Address, Destination};
use crate::error::{Error, Result};

/// Policy predicate over `(source, destination)`.
#[async_trait]
pub trait Ruleset: Send + Sync {
    /// `Ok(())` allows, `Err(Forbidden)` denies, `Err(NoRulesetMatched)`
    /// means no rule applied (treated as allow downstream).
    async fn evaluate(&self, source: &Address, destination: &Destination) -> Result<()>;
}

/// The empty ruleset: nothing ever matches.
pub struct NoRuleset;

#[async_trait]
impl Ruleset for NoRuleset {
    async fn evaluate(&self, _source: &Address, _destination: &Destination) -> Result<()> {
        Err(Error::NoRulesetMatched)
    }
}

/// Denies destinations whose host matches an entry; everything else is a
/// non-match. Entries are exact IPs or domain suffixes (`example.com`
/// also covers `www.example.com`).
pub struct DenyListRuleset {
    entries: Vec<String>,
}

impl DenyListRuleset {
    pub fn new(entries: Vec<String>) -> Self {
        Self { entries }
    }

    fn matches(&self, destination: &Destination) -> bool {
        match &destination.address {
            Address::Socket(addr) => self
                .entries
                .iter()
                .any(|e| e.parse::<IpAddr>().map(|ip| ip == addr.ip()).unwrap_or(false)),
            Address::Domain(domain, _) => self.entries.iter().any(|e| {
                domain.eq_ignore_ascii_case(e)
                    || domain
                        .to_ascii_lowercase()
                        .ends_with(&format!(".{}", e.to_ascii_lowercase()))
            }),
        }
    }
}

#[async_trait]
impl Ruleset for DenyListRuleset {
    async fn evaluate(&self, _source: &Address, destination: &Destination) -> Result<()> {
        if self.matches(destination) {
            Err(Error::Forbidden)
        } else {
            Err(Error::NoRulesetMatched)
        }
    }
}
