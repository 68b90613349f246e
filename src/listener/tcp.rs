//! Raw TCP listener
//!
//! No client-facing handshake: every accepted socket is handed to the
//! dispatcher as-is. The destination must come from configuration (a
//! forward target); without one the dispatcher rejects the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::auth::Authentication;
use crate::common::{Address, Connection, Destination, IngressEvent, Network, TcpOptions};
use crate::dispatcher::Dispatch;
use crate::error::Result;

use super::{serve_tcp, ConnHandler, Listener};

pub struct RawTcpListener {
    listen: SocketAddr,
    forward: Option<Destination>,
}

impl RawTcpListener {
    pub fn new(listen: SocketAddr, forward: Option<Destination>) -> Self {
        Self { listen, forward }
    }
}

#[async_trait]
impl Listener for RawTcpListener {
    fn network(&self) -> Network {
        Network::Tcp
    }

    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn serve(&self, cancel: CancellationToken, dispatcher: Arc<dyn Dispatch>) -> Result<()> {
        let handler = Arc::new(RawTcpHandler {
            forward: self.forward.clone(),
            dispatcher,
        });
        serve_tcp("tcp", self.listen, &TcpOptions::ingress(), cancel, handler).await
    }
}

struct RawTcpHandler {
    forward: Option<Destination>,
    dispatcher: Arc<dyn Dispatch>,
}

#[async_trait]
impl ConnHandler for RawTcpHandler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) -> Result<()> {
        let source = Address::Socket(peer);
        let mut conn = Connection::new(Network::Tcp, source.clone(), Box::new(stream), cancel);
        conn.destination = self.forward.clone();
        self.dispatcher
            .dispatch(IngressEvent::new(conn, Authentication::source_only(source)))
            .await
    }
}
