//! Address and destination types for proxied connections

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::{Error, Result};

/// Network type a connection or destination is carried over.
///
/// `Hrtp` is the internal tag for plain-HTTP relay upstreams: the request
/// was consumed by the HTTP listener and is re-emitted towards an HTTP
/// origin instead of being tunneled as raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
    Hrtp,
}

impl Default for Network {
    fn default() -> Self {
        Network::Tcp
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
            Network::Hrtp => write!(f, "hrtp"),
        }
    }
}

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create an unspecified address (0.0.0.0:0)
    pub fn unspecified() -> Self {
        Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Create from IP and port
    pub fn ip_port(ip: IpAddr, port: u16) -> Self {
        Address::Socket(SocketAddr::new(ip, port))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// An address is resolved when it is IP-typed; domain addresses must
    /// go through the resolver before they can be dialed.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Address::Socket(_))
    }

    /// Try to get as socket address (fails for domain)
    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            Address::Domain(_, _) => None,
        }
    }

    /// Get domain if this is a domain address
    pub fn as_domain(&self) -> Option<(&str, u16)> {
        match self {
            Address::Domain(domain, port) => Some((domain, *port)),
            Address::Socket(_) => None,
        }
    }

    /// Parse a `host[:port]` string into an Address, applying the default
    /// port when none is present. Accepts bracketed IPv6 literals.
    pub fn parse_host_port(s: &str, default_port: u16) -> Result<Address> {
        if let Ok(addr) = s.parse() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = match s.rsplit_once(':') {
            // Reject "host:" and a bare-IPv6 colon split like "::1".
            Some((h, p)) if !h.is_empty() && !p.is_empty() && !p.contains(':') => {
                let port: u16 = p
                    .parse()
                    .map_err(|_| Error::Protocol(format!("invalid port: {}", p)))?;
                (h, port)
            }
            _ => (s, default_port),
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::Protocol(format!("invalid host address: {}", s)));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Address::Socket(SocketAddr::new(ip, port)));
        }
        Ok(Address::Domain(host.to_string(), port))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl From<(String, u16)> for Address {
    fn from((domain, port): (String, u16)) -> Self {
        Address::Domain(domain, port)
    }
}

impl From<(&str, u16)> for Address {
    fn from((domain, port): (&str, u16)) -> Self {
        Address::Domain(domain.to_string(), port)
    }
}

/// Where a connection is going: the egress network tag plus the address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub network: Network,
    pub address: Address,
}

impl Destination {
    pub fn tcp(address: Address) -> Self {
        Self {
            network: Network::Tcp,
            address,
        }
    }

    pub fn hrtp(address: Address) -> Self {
        Self {
            network: Network::Hrtp,
            address,
        }
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.network, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domain_with_port() {
        let addr = Address::parse_host_port("example.com:443", 80).unwrap();
        assert_eq!(addr, Address::domain("example.com", 443));
    }

    #[test]
    fn test_parse_domain_default_port() {
        let addr = Address::parse_host_port("example.com", 80).unwrap();
        assert_eq!(addr, Address::domain("example.com", 80));
    }

    #[test]
    fn test_parse_ipv4() {
        let addr = Address::parse_host_port("10.0.0.1:8080", 80).unwrap();
        assert_eq!(addr, Address::Socket("10.0.0.1:8080".parse().unwrap()));
        assert!(addr.is_resolved());
    }

    #[test]
    fn test_parse_ipv6_bracketed() {
        let addr = Address::parse_host_port("[::1]:9000", 80).unwrap();
        assert_eq!(addr.port(), 9000);
        assert!(addr.is_resolved());
    }

    #[test]
    fn test_parse_bare_ipv6() {
        let addr = Address::parse_host_port("::1", 443).unwrap();
        assert_eq!(addr, Address::ip_port("::1".parse().unwrap(), 443));
    }

    #[test]
    fn test_parse_invalid_port() {
        assert!(Address::parse_host_port("example.com:notaport", 80).is_err());
    }

    #[test]
    fn test_domain_not_resolved() {
        assert!(!Address::domain("example.com", 80).is_resolved());
    }

    #[test]
    fn test_destination_display() {
        let dest = Destination::tcp(Address::domain("example.com", 443));
        assert_eq!(dest.to_string(), "tcp://example.com:443");
    }
}
