//! TCP socket option profiles

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::error::Result;

/// Socket option profile applied to accepted and dialed TCP sockets.
///
/// Read/write timeouts are not kernel deadlines; they are consumed by the
/// `TimeoutStream` wrapper on the upstream side of a pipe.
#[derive(Debug, Clone)]
pub struct TcpOptions {
    pub no_delay: bool,
    /// `None` disables keepalive probes entirely.
    pub keep_alive: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub read_buffer: Option<usize>,
    pub write_buffer: Option<usize>,
}

impl TcpOptions {
    /// Profile for client-facing sockets.
    pub fn ingress() -> Self {
        Self {
            no_delay: true,
            keep_alive: Some(Duration::from_secs(10)),
            read_timeout: None,
            write_timeout: None,
            read_buffer: Some(32 * 1024),
            write_buffer: Some(32 * 1024),
        }
    }

    /// Profile for dialed upstream sockets. Keepalive stays off: the
    /// upstream may be ephemeral and probes only delay teardown.
    pub fn upstream() -> Self {
        Self {
            no_delay: true,
            keep_alive: None,
            read_timeout: Some(Duration::from_secs(30)),
            write_timeout: Some(Duration::from_secs(10)),
            read_buffer: Some(32 * 1024),
            write_buffer: Some(32 * 1024),
        }
    }
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self::ingress()
    }
}

/// Apply the profile to a live socket.
pub fn apply_tcp_options(stream: &TcpStream, opts: &TcpOptions) -> Result<()> {
    stream.set_nodelay(opts.no_delay)?;

    let sock = SockRef::from(stream);
    if let Some(interval) = opts.keep_alive {
        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(interval))?;
    } else {
        sock.set_keepalive(false)?;
    }
    if let Some(size) = opts.read_buffer {
        sock.set_recv_buffer_size(size)?;
    }
    if let Some(size) = opts.write_buffer {
        sock.set_send_buffer_size(size)?;
    }
    Ok(())
}
