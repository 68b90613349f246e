//! Raw UDP listener
//!
//! One receive loop, no deadline. Each datagram spawns an independent
//! handler over a one-shot stream: reading yields the datagram once then
//! EOF, writing sends a reply back to the datagram's source. That gives
//! UDP the same connection-shaped contract the TCP listeners produce.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Authentication;
use crate::common::{Address, Connection, Destination, IngressEvent, Network};
use crate::dispatcher::Dispatch;
use crate::error::Result;

use super::Listener;

/// Largest datagram accepted; longer packets truncate (32KB)
pub const MAX_DATAGRAM_SIZE: usize = 32 * 1024;

pub struct UdpListener {
    listen: SocketAddr,
    forward: Option<Destination>,
}

impl UdpListener {
    pub fn new(listen: SocketAddr, forward: Option<Destination>) -> Self {
        Self { listen, forward }
    }
}

#[async_trait]
impl Listener for UdpListener {
    fn network(&self) -> Network {
        Network::Udp
    }

    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn serve(&self, cancel: CancellationToken, dispatcher: Arc<dyn Dispatch>) -> Result<()> {
        let socket = Arc::new(UdpSocket::bind(self.listen).await?);
        info!("udp: listen: {}", socket.local_addr()?);

        loop {
            // One fresh buffer per packet keeps the ownership story of the
            // one-shot stream simple; a pool would change that contract.
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("udp: terminated");
                    return Ok(());
                }
                r = socket.recv_from(&mut buffer) => r?,
            };
            buffer.truncate(len);

            let socket = socket.clone();
            let dispatcher = dispatcher.clone();
            let forward = self.forward.clone();
            let conn_cancel = cancel.child_token();
            tokio::spawn(async move {
                let source = Address::Socket(peer);
                let stream = DatagramStream::new(buffer, socket, peer);
                let mut conn =
                    Connection::new(Network::Udp, source.clone(), Box::new(stream), conn_cancel);
                conn.destination = forward;
                let event = IngressEvent::new(conn, Authentication::source_only(source));
                match dispatcher.dispatch(event).await {
                    Ok(()) => {}
                    Err(e) if e.is_benign() => debug!("udp: datagram from {}: {}", peer, e),
                    Err(e) => warn!("udp: datagram from {} error: {}", peer, e),
                }
            });
        }
    }
}

/// One-shot duplex view over a single datagram: `read` drains the payload
/// then reports EOF, `write` sends back to the source address.
pub struct DatagramStream {
    data: Vec<u8>,
    pos: usize,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl DatagramStream {
    pub fn new(data: Vec<u8>, socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self {
            data,
            pos: 0,
            socket,
            peer,
        }
    }
}

impl AsyncRead for DatagramStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.data.len() {
            let to_copy = (self.data.len() - self.pos).min(buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.data[start..start + to_copy]);
            self.pos += to_copy;
        }
        // Once drained, every read is EOF.
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for DatagramStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let peer = self.peer;
        self.socket.poll_send_to(cx, buf, peer)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
