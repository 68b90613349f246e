//! Listeners - protocol ingress
//!
//! One listener per client-facing protocol. A listener accepts sockets,
//! runs the protocol-specific handshake and emits a neutral `IngressEvent`
//! to the dispatcher. Everything protocol-flavored (wire replies, hook
//! bodies, credential extraction) lives here.

pub mod http;
pub mod socks5;
pub mod tcp;
pub mod udp;

pub use http::{HttpListener, HttpOptions};
pub use socks5::{SocksListener, SocksOptions};
pub use tcp::RawTcpListener;
pub use udp::UdpListener;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::{apply_tcp_options, Network, TcpOptions};
use crate::dispatcher::Dispatch;
use crate::error::Result;

/// A protocol ingress bound to one local port.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Protocol type of the listening socket
    fn network(&self) -> Network;

    /// Validate options and prepare resources (e.g. TLS material)
    async fn init(&mut self) -> Result<()>;

    /// Serve until the token is cancelled. Handshake results are handed to
    /// the dispatcher; a fatal listening error terminates the server.
    async fn serve(&self, cancel: CancellationToken, dispatcher: Arc<dyn Dispatch>)
        -> Result<()>;
}

/// Per-connection entry point the shared accept loop drives.
#[async_trait]
pub(crate) trait ConnHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Shared TCP accept loop: applies the socket option profile, spawns one
/// worker per connection, captures worker panics, and bounds connection
/// lifetime by the parent token (dropping the worker future closes the
/// socket).
pub(crate) async fn serve_tcp(
    tag: &'static str,
    listen: SocketAddr,
    opts: &TcpOptions,
    cancel: CancellationToken,
    handler: Arc<dyn ConnHandler>,
) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!("{}: listen: {}", tag, listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("{}: terminated", tag);
                return Ok(());
            }
            r = listener.accept() => match r {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("{}: accept error: {}", tag, e);
                    return Err(e.into());
                }
            },
        };

        if let Err(e) = apply_tcp_options(&stream, opts) {
            error!("{}: set socket options: {}", tag, e);
            continue;
        }

        let conn_cancel = cancel.child_token();
        let handler = handler.clone();
        tokio::spawn(async move {
            let worker = std::panic::AssertUnwindSafe(handler.handle(
                stream,
                peer,
                conn_cancel.clone(),
            ))
            .catch_unwind();

            tokio::select! {
                _ = conn_cancel.cancelled() => {
                    debug!("{}: connection from {} cancelled", tag, peer);
                }
                out = worker => match out {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) if e.is_benign() => {
                        debug!("{}: connection from {} closed: {}", tag, peer, e);
                    }
                    Ok(Err(e)) => {
                        warn!("{}: connection from {} error: {}", tag, peer, e);
                    }
                    Err(panic) => {
                        error!("{}: handler panic: {}", tag, panic_message(panic.as_ref()));
                    }
                },
            }
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
