//! TCP connector

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::common::{apply_tcp_options, Destination, Stream, TcpOptions, TimeoutStream};
use crate::error::{DialFailure, Error, Result};

use super::Connector;

/// Upstream connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Dials raw TCP upstreams over IPv4/IPv6.
pub struct TcpConnector {
    opts: TcpOptions,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self {
            opts: TcpOptions::upstream(),
        }
    }

    pub fn with_options(opts: TcpOptions) -> Self {
        Self { opts }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

pub(super) async fn dial(destination: &Destination, opts: &TcpOptions) -> Result<Stream> {
    let addr = destination.address.as_socket().ok_or_else(|| {
        Error::ConnectFailed(DialFailure::Other(format!(
            "destination is not an ip: {}",
            destination.address
        )))
    })?;

    debug!("tcp-connector: dial {}", addr);
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::ConnectFailed(DialFailure::Timeout))?
        .map_err(Error::dial)?;

    apply_tcp_options(&stream, opts)?;
    Ok(Box::new(TimeoutStream::new(
        stream,
        opts.read_timeout,
        opts.write_timeout,
    )))
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, destination: &Destination) -> Result<Stream> {
        dial(destination, &self.opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let dest = Destination::tcp(Address::Socket(addr));
        let mut stream = TcpConnector::new().connect(&dest).await.unwrap();
        stream.write_all(b"echo").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_classified() {
        // Bind then drop to find a port that is very likely closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dest = Destination::tcp(Address::Socket(addr));
        let out = TcpConnector::new().connect(&dest).await;
        assert!(matches!(
            out,
            Err(Error::ConnectFailed(DialFailure::Refused))
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_domain_destination() {
        let dest = Destination::tcp(Address::domain("example.com", 80));
        let out = TcpConnector::new().connect(&dest).await;
        assert!(matches!(out, Err(Error::ConnectFailed(_))));
    }
}
