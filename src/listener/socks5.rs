//! SOCKS5 listener (RFC 1928, RFC 1929)
//!
//! State machine:
//!
//! ```text
//! INIT → METHOD_NEG → [AUTH_NEG] → REQUEST → COMMAND_DISPATCH → DONE | ERROR
//! ```
//!
//! Only CONNECT is supported; BIND and UDP ASSOCIATE answer
//! `CommandNotSupported`. By default the success reply is written before
//! the upstream dial completes (parity with the proxy lineage this wire
//! behavior comes from); a later dial failure is answered with an advisory
//! error reply. Set `reply_before_dial` to `false` to hold the reply until
//! the dial outcome is known, as RFC 1928 intends.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::auth::{Authentication, Authenticator, Scheme};
use crate::common::{hook, Address, Connection, Destination, Hooks, IngressEvent, Network, Stream, TcpOptions};
use crate::dispatcher::Dispatch;
use crate::error::{DialFailure, Error, Result};

use super::{serve_tcp, ConnHandler, Listener};

const SOCKS_VERSION: u8 = 0x05;
const USERPASS_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;

const AUTH_SUCCESS: u8 = 0x00;
const AUTH_FAILURE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Clone)]
pub struct SocksOptions {
    /// Require RFC 1929 username/password sub-negotiation
    pub auth_enabled: bool,
    /// Send the success reply before the upstream dial completes
    pub reply_before_dial: bool,
}

impl Default for SocksOptions {
    fn default() -> Self {
        Self {
            auth_enabled: false,
            reply_before_dial: true,
        }
    }
}

pub struct SocksListener {
    listen: SocketAddr,
    opts: SocksOptions,
    authenticator: Arc<dyn Authenticator>,
}

impl SocksListener {
    pub fn new(listen: SocketAddr, opts: SocksOptions, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            listen,
            opts,
            authenticator,
        }
    }
}

#[async_trait]
impl Listener for SocksListener {
    fn network(&self) -> Network {
        Network::Tcp
    }

    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn serve(&self, cancel: CancellationToken, dispatcher: Arc<dyn Dispatch>) -> Result<()> {
        let handler = Arc::new(SocksHandler {
            opts: self.opts.clone(),
            authenticator: self.authenticator.clone(),
            dispatcher,
        });
        serve_tcp("socks", self.listen, &TcpOptions::ingress(), cancel, handler).await
    }
}

pub(crate) struct SocksHandler {
    pub(crate) opts: SocksOptions,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) dispatcher: Arc<dyn Dispatch>,
}

#[async_trait]
impl ConnHandler for SocksHandler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) -> Result<()> {
        let bind_addr = stream.local_addr()?;
        self.serve_conn(Box::new(stream), peer, bind_addr, cancel).await
    }
}

impl SocksHandler {
    pub(crate) async fn serve_conn(
        &self,
        mut stream: Stream,
        peer: SocketAddr,
        bind_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<()> {
        // METHOD_NEG
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(Error::NotSupportedVersion(head[0]));
        }
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await?;

        let method = if self.opts.auth_enabled {
            METHOD_USER_PASS
        } else {
            METHOD_NO_AUTH
        };
        stream.write_all(&[SOCKS_VERSION, method]).await?;

        // AUTH_NEG
        let source = Address::Socket(peer);
        let auth = if self.opts.auth_enabled {
            let (user, pass) = read_userpass(&mut stream).await?;
            let credentials = Authentication::new(
                source.clone(),
                Scheme::Basic,
                format!("{}:{}", user, pass).into_bytes(),
            );
            match self.authenticator.authenticate(&credentials).await {
                Ok(()) => {
                    stream.write_all(&[USERPASS_VERSION, AUTH_SUCCESS]).await?;
                    credentials
                }
                Err(e) => {
                    stream.write_all(&[USERPASS_VERSION, AUTH_FAILURE]).await?;
                    return Err(e);
                }
            }
        } else {
            Authentication::source_only(source.clone())
        };

        // REQUEST
        let (cmd, address) = match read_request(&mut stream).await {
            Ok(parsed) => parsed,
            Err(Error::Protocol(msg)) if msg.contains("address type") => {
                stream
                    .write_all(&encode_reply(REP_ATYP_NOT_SUPPORTED, None))
                    .await?;
                return Err(Error::Protocol(msg));
            }
            Err(e) => return Err(e),
        };

        // COMMAND_DISPATCH
        match cmd {
            CMD_CONNECT => {}
            CMD_BIND | CMD_UDP_ASSOCIATE => {
                stream
                    .write_all(&encode_reply(REP_CMD_NOT_SUPPORTED, None))
                    .await?;
                return Err(Error::Protocol(format!("unsupported command: {}", cmd)));
            }
            other => {
                stream
                    .write_all(&encode_reply(REP_CMD_NOT_SUPPORTED, None))
                    .await?;
                return Err(Error::Protocol(format!("invalid command: {}", other)));
            }
        }

        let sent_success = self.opts.reply_before_dial;
        if sent_success {
            stream
                .write_all(&encode_reply(REP_SUCCESS, Some(bind_addr)))
                .await?;
            stream.flush().await?;
        }

        let mut hooks = Hooks::default();
        hooks.after_dialed = Some(hook(move |s, e| {
            Box::pin(dial_reply(s, e, bind_addr, sent_success))
        }));

        let conn = Connection::new(Network::Tcp, source, stream, cancel)
            .with_destination(Destination::tcp(address))
            .with_hooks(hooks);
        self.dispatcher.dispatch(IngressEvent::new(conn, auth)).await
    }
}

/// Hook body for the dial outcome. A dial failure is answered with the
/// mapped reply code even after an early success reply (advisory).
async fn dial_reply(
    stream: &mut Stream,
    err: Option<&Error>,
    bind_addr: SocketAddr,
    sent_success: bool,
) -> Result<()> {
    match err {
        None if sent_success => Ok(()),
        None => {
            stream
                .write_all(&encode_reply(REP_SUCCESS, Some(bind_addr)))
                .await?;
            stream.flush().await?;
            Ok(())
        }
        Some(e) => {
            stream.write_all(&encode_reply(reply_code(e), None)).await?;
            Ok(())
        }
    }
}

/// Map a dispatch failure to a SOCKS reply code. Structured dial kinds
/// take precedence; message text is the last-resort fallback.
fn reply_code(err: &Error) -> u8 {
    match err {
        Error::ConnectFailed(DialFailure::Refused) => REP_CONNECTION_REFUSED,
        Error::ConnectFailed(DialFailure::NetworkUnreachable) => REP_NETWORK_UNREACHABLE,
        Error::ConnectFailed(_) => REP_HOST_UNREACHABLE,
        other => {
            let msg = other.to_string();
            if msg.contains("refused") {
                REP_CONNECTION_REFUSED
            } else if msg.contains("network is unreachable") {
                REP_NETWORK_UNREACHABLE
            } else {
                REP_HOST_UNREACHABLE
            }
        }
    }
}

async fn read_userpass(stream: &mut Stream) -> Result<(String, String)> {
    let mut ver = [0u8; 1];
    stream.read_exact(&mut ver).await?;
    if ver[0] != USERPASS_VERSION {
        return Err(Error::Protocol(format!(
            "invalid auth version: {}",
            ver[0]
        )));
    }

    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut user = vec![0u8; len[0] as usize];
    stream.read_exact(&mut user).await?;

    stream.read_exact(&mut len).await?;
    let mut pass = vec![0u8; len[0] as usize];
    stream.read_exact(&mut pass).await?;

    Ok((
        String::from_utf8_lossy(&user).into_owned(),
        String::from_utf8_lossy(&pass).into_owned(),
    ))
}

async fn read_request(stream: &mut Stream) -> Result<(u8, Address)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(Error::Protocol(format!(
            "invalid version in request: {}",
            header[0]
        )));
    }

    let cmd = header[1];
    let address = match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            Address::ip_port(Ipv4Addr::from(addr).into(), port)
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let port = read_port(stream).await?;
            Address::domain(String::from_utf8_lossy(&domain).into_owned(), port)
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            Address::ip_port(Ipv6Addr::from(addr).into(), port)
        }
        other => {
            return Err(Error::Protocol(format!(
                "unsupported address type: {}",
                other
            )));
        }
    };

    Ok((cmd, address))
}

async fn read_port(stream: &mut Stream) -> Result<u16> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

/// Encode a reply. The bound address is only meaningful on success;
/// failure replies carry the zero IPv4 address.
pub fn encode_reply(rep: u8, bind: Option<SocketAddr>) -> Vec<u8> {
    let mut out = vec![SOCKS_VERSION, rep, 0x00];
    match bind.filter(|_| rep == REP_SUCCESS) {
        Some(SocketAddr::V4(v4)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
        Some(SocketAddr::V6(v6)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
        }
        None => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    out
}

/// Decode a reply produced by `encode_reply` (ATYP 1 and 4).
pub fn decode_reply(buf: &[u8]) -> Result<(u8, SocketAddr)> {
    if buf.len() < 4 || buf[0] != SOCKS_VERSION {
        return Err(Error::Protocol("malformed reply".into()));
    }
    let rep = buf[1];
    let addr = match buf[3] {
        ATYP_IPV4 if buf.len() == 10 => {
            let mut ip = [0u8; 4];
            ip.copy_from_slice(&buf[4..8]);
            let port = u16::from_be_bytes([buf[8], buf[9]]);
            SocketAddr::new(Ipv4Addr::from(ip).into(), port)
        }
        ATYP_IPV6 if buf.len() == 22 => {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&buf[4..20]);
            let port = u16::from_be_bytes([buf[20], buf[21]]);
            SocketAddr::new(Ipv6Addr::from(ip).into(), port)
        }
        other => {
            return Err(Error::Protocol(format!(
                "unsupported address type: {}",
                other
            )));
        }
    };
    Ok((rep, addr))
}
