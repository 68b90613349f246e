//! HTTP(S) proxy listener
//!
//! Two ingress shapes over one accept loop:
//!
//! - `CONNECT host:port` tunnels: the socket is kept after the handshake
//!   and becomes a raw byte pipe. `200 Connection established` is written
//!   by the after-dial hook, so it cannot precede a successful upstream
//!   dial.
//! - Plain requests in absolute form (RFC 2068 §5.1.2): the request head
//!   is consumed, hop-by-hop headers are stripped, and the rebuilt head is
//!   queued ahead of the remaining client bytes towards an HTTP origin
//!   (the `hrtp` egress). Non-absolute targets answer `400`.
//!
//! The HTTPS flavor is the same listener behind a TLS acceptor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::BytesMut;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::{Authentication, Scheme};
use crate::common::{
    hook, Address, Connection, Destination, Hooks, IngressEvent, Network, PrependStream, Stream,
    TcpOptions,
};
use crate::dispatcher::Dispatch;
use crate::error::{Error, Result};

use super::{serve_tcp, ConnHandler, Listener};

const RESPONSE_200_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const RESPONSE_401: &[u8] = b"HTTP/1.1 401 Unauthorized\r\n\r\n";
const RESPONSE_403: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Upper bound on request line + headers
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Hop-by-hop headers a proxy must not forward (RFC 2616 §13.5.1), on top
/// of any name listed in the `Connection` header.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "Proxy-Connection",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailers",
    "Transfer-Encoding",
    "Upgrade",
    "Keep-Alive",
];

#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    /// Log each request line
    pub verbose: bool,
}

/// TLS material for the HTTPS flavor, loaded at init.
#[derive(Debug, Clone)]
struct TlsFiles {
    cert_file: String,
    key_file: String,
}

pub struct HttpListener {
    tag: &'static str,
    listen: SocketAddr,
    opts: HttpOptions,
    tls: Option<TlsFiles>,
    acceptor: Option<TlsAcceptor>,
}

impl HttpListener {
    pub fn new(listen: SocketAddr, opts: HttpOptions) -> Self {
        Self {
            tag: "http",
            listen,
            opts,
            tls: None,
            acceptor: None,
        }
    }

    pub fn with_tls(
        listen: SocketAddr,
        opts: HttpOptions,
        cert_file: impl Into<String>,
        key_file: impl Into<String>,
    ) -> Self {
        Self {
            tag: "https",
            listen,
            opts,
            tls: Some(TlsFiles {
                cert_file: cert_file.into(),
                key_file: key_file.into(),
            }),
            acceptor: None,
        }
    }

    fn build_acceptor(files: &TlsFiles) -> Result<TlsAcceptor> {
        // A path shorter than 3 chars is the "empty/unset" sentinel.
        if files.cert_file.len() < 3 {
            return Err(Error::Config(
                "https.tls_cert_file is required in config".into(),
            ));
        }
        if files.key_file.len() < 3 {
            return Err(Error::Config(
                "https.tls_key_file is required in config".into(),
            ));
        }

        let certs = load_certs(&files.cert_file)?;
        let key = load_private_key(&files.key_file)?;
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Config(format!("tls material rejected: {}", e)))?;
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("open certificate file {}: {}", path, e)))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("parse certificates: {}", e)))
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("open key file {}: {}", path, e)))?;
    let mut reader = std::io::BufReader::new(file);
    let items = rustls_pemfile::read_all(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("parse private key: {}", e)))?;
    for item in items {
        match item {
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }
    Err(Error::Config(format!("no private key found in {}", path)))
}

#[async_trait]
impl Listener for HttpListener {
    fn network(&self) -> Network {
        Network::Tcp
    }

    async fn init(&mut self) -> Result<()> {
        if let Some(files) = &self.tls {
            self.acceptor = Some(Self::build_acceptor(files)?);
        }
        Ok(())
    }

    async fn serve(&self, cancel: CancellationToken, dispatcher: Arc<dyn Dispatch>) -> Result<()> {
        let handler = Arc::new(HttpConnHandler {
            tag: self.tag,
            opts: self.opts.clone(),
            acceptor: self.acceptor.clone(),
            dispatcher,
        });
        serve_tcp(self.tag, self.listen, &TcpOptions::ingress(), cancel, handler).await
    }
}

pub(crate) struct HttpConnHandler {
    pub(crate) tag: &'static str,
    pub(crate) opts: HttpOptions,
    pub(crate) acceptor: Option<TlsAcceptor>,
    pub(crate) dispatcher: Arc<dyn Dispatch>,
}

#[async_trait]
impl ConnHandler for HttpConnHandler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) -> Result<()> {
        let stream: Stream = match &self.acceptor {
            Some(acceptor) => Box::new(
                acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| Error::Protocol(format!("tls handshake: {}", e)))?,
            ),
            None => Box::new(stream),
        };
        self.serve_conn(stream, peer, cancel).await
    }
}

impl HttpConnHandler {
    pub(crate) async fn serve_conn(
        &self,
        stream: Stream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<()> {
        let start = Instant::now();
        let mut reader = BufReader::new(stream);
        let head = read_request_head(&mut reader).await?;
        if self.opts.verbose {
            info!("{}: {} {}", self.tag, head.method, head.target);
        }

        let target = head.target.clone();
        let source = Address::Socket(peer);
        let auth = parse_proxy_authorization(&head, source.clone());

        let result = if head.method.eq_ignore_ascii_case("CONNECT") {
            self.tunnel(reader, head, source, auth, cancel).await
        } else {
            self.forward(reader, head, source, auth, cancel).await
        };

        info!("{}: finish {} in {:?}", self.tag, target, start.elapsed());
        result
    }

    /// CONNECT: keep the socket, dispatch a raw TCP tunnel.
    async fn tunnel(
        &self,
        reader: BufReader<Stream>,
        head: RequestHead,
        source: Address,
        auth: Authentication,
        cancel: CancellationToken,
    ) -> Result<()> {
        let dest_addr = Address::parse_host_port(&head.target, 80)?;
        debug!("{}: tunnel to {}", self.tag, dest_addr);

        let mut hooks = Hooks::default();
        hooks.after_authenticated = Some(hook(|s, e| Box::pin(auth_reply(s, e))));
        hooks.after_ruleset = Some(hook(|s, e| Box::pin(ruleset_reply(s, e))));
        hooks.after_dialed = Some(hook(|s, e| Box::pin(established_reply(s, e))));

        let conn = Connection::new(Network::Tcp, source, Box::new(reader), cancel)
            .with_destination(Destination::tcp(dest_addr))
            .with_hooks(hooks);
        self.dispatcher.dispatch(IngressEvent::new(conn, auth)).await
    }

    /// Plain request: rebuild the head without hop-by-hop headers and
    /// relay towards the HTTP origin.
    async fn forward(
        &self,
        mut reader: BufReader<Stream>,
        mut head: RequestHead,
        source: Address,
        auth: Authentication,
        cancel: CancellationToken,
    ) -> Result<()> {
        // RFC 2068 requires the request-target of a proxied request to be
        // an absolute URL.
        let Some(rest) = head.target.strip_prefix("http://") else {
            reader.write_all(RESPONSE_400).await?;
            reader.flush().await?;
            return Err(Error::Protocol(format!(
                "non-absolute request target: {}",
                head.target
            )));
        };
        let (authority, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            reader.write_all(RESPONSE_400).await?;
            reader.flush().await?;
            return Err(Error::Protocol("empty authority in request target".into()));
        }
        let dest_addr = Address::parse_host_port(authority, 80)?;
        debug!("{}: forward to {}", self.tag, dest_addr);

        strip_hop_by_hop(&mut head.headers);
        // A missing User-Agent is forced to the explicit empty string so
        // the origin cannot fingerprint the proxy.
        if header_get(&head.headers, "User-Agent").is_none() {
            head.headers.push(("User-Agent".to_string(), String::new()));
        }

        let rebuilt = head.rebuild(path);
        let stream: Stream = Box::new(PrependStream::new(rebuilt, Box::new(reader)));

        let mut hooks = Hooks::default();
        hooks.after_authenticated = Some(hook(|s, e| Box::pin(auth_reply(s, e))));
        hooks.after_ruleset = Some(hook(|s, e| Box::pin(ruleset_reply(s, e))));
        hooks.after_dialed = Some(hook(|s, e| Box::pin(forward_dial_reply(s, e))));

        let conn = Connection::new(Network::Tcp, source, stream, cancel)
            .with_destination(Destination::hrtp(dest_addr))
            .with_hooks(hooks);
        self.dispatcher.dispatch(IngressEvent::new(conn, auth)).await
    }
}

// ============================================================================
// Hook bodies
// ============================================================================

async fn auth_reply(stream: &mut Stream, err: Option<&Error>) -> Result<()> {
    if err.is_none() {
        return Ok(());
    }
    stream.write_all(RESPONSE_401).await?;
    stream.flush().await?;
    Err(Error::Unauthorized)
}

async fn ruleset_reply(stream: &mut Stream, err: Option<&Error>) -> Result<()> {
    match err {
        None | Some(Error::NoRulesetMatched) => Ok(()),
        Some(_) => {
            stream.write_all(RESPONSE_403).await?;
            stream.flush().await?;
            Err(Error::Forbidden)
        }
    }
}

/// Tunnel dial outcome: the 200 reply is only legal here, after the
/// upstream socket exists.
async fn established_reply(stream: &mut Stream, err: Option<&Error>) -> Result<()> {
    match err {
        None => {
            stream.write_all(RESPONSE_200_ESTABLISHED).await?;
            stream.flush().await?;
            Ok(())
        }
        Some(_) => {
            stream.write_all(RESPONSE_502).await?;
            stream.flush().await?;
            Ok(())
        }
    }
}

/// Forward dial outcome: on success the origin's own response bytes are
/// relayed, so nothing is written here.
async fn forward_dial_reply(stream: &mut Stream, err: Option<&Error>) -> Result<()> {
    match err {
        None => Ok(()),
        Some(_) => {
            stream.write_all(RESPONSE_502).await?;
            stream.flush().await?;
            Ok(())
        }
    }
}

// ============================================================================
// Request head parsing
// ============================================================================

struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Rebuild the head in origin form for forwarding.
    fn rebuild(&self, path: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(self.method.as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(path.as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.version.as_bytes());
        buf.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

async fn read_request_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<RequestHead> {
    let mut line = String::new();
    let mut total = reader.read_line(&mut line).await?;
    if total == 0 {
        return Err(Error::Protocol("empty request".into()));
    }

    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
        _ => return Err(Error::Protocol(format!("invalid request line: {}", line.trim()))),
    };

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Protocol("unexpected eof in headers".into()));
        }
        total += n;
        if total > MAX_HEAD_BYTES {
            return Err(Error::Protocol("request head too large".into()));
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Remove hop-by-hop headers: the fixed RFC set plus every name listed in
/// a `Connection` header. Idempotent.
pub fn strip_hop_by_hop(headers: &mut Vec<(String, String)>) {
    let mut drop: Vec<String> = HOP_BY_HOP_HEADERS.iter().map(|s| s.to_string()).collect();
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("Connection") {
            for token in value.split(',') {
                let token = token.trim();
                if !token.is_empty() {
                    drop.push(token.to_string());
                }
            }
        }
    }
    drop.push("Connection".to_string());
    headers.retain(|(name, _)| !drop.iter().any(|d| d.eq_ignore_ascii_case(name)));
}

// ============================================================================
// Proxy-Authorization parsing
// ============================================================================

/// Build the credential record from the `Proxy-Authorization` header.
/// Prefix matching is ASCII-case-insensitive; an unrecognized or missing
/// header becomes a raw `Token` credential.
fn parse_proxy_authorization(head: &RequestHead, source: Address) -> Authentication {
    let token = header_get(&head.headers, "Proxy-Authorization").unwrap_or_default();
    if let Some(rest) = strip_prefix_fold(token, "Basic ") {
        let credential = match BASE64.decode(rest.trim()) {
            Ok(decoded) => match String::from_utf8(decoded) {
                Ok(s) if s.contains(':') => s,
                _ => ":".to_string(),
            },
            Err(_) => ":".to_string(),
        };
        Authentication::new(source, Scheme::Basic, credential.into_bytes())
    } else if let Some(rest) = strip_prefix_fold(token, "Bearer ") {
        Authentication::new(source, Scheme::Bearer, rest.as_bytes().to_vec())
    } else {
        Authentication::new(source, Scheme::Token, token.as_bytes().to_vec())
    }
}

fn strip_prefix_fold<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAllAuthenticator, StaticUserAuthenticator};
    use crate::dispatcher::Dispatcher;
    use crate::resolver::StaticResolver;
    use crate::ruleset::NoRuleset;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Dispatcher stand-in recording the event it receives.
    struct CaptureDispatch {
        tx: mpsc::UnboundedSender<Option<Destination>>,
    }

    #[async_trait]
    impl Dispatch for CaptureDispatch {
        async fn dispatch(&self, event: IngressEvent) -> Result<()> {
            let _ = self.tx.send(event.conn.destination.clone());
            Ok(())
        }
    }

    fn capture_handler() -> (HttpConnHandler, mpsc::UnboundedReceiver<Option<Destination>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = HttpConnHandler {
            tag: "http",
            opts: HttpOptions::default(),
            acceptor: None,
            dispatcher: Arc::new(CaptureDispatch { tx }),
        };
        (handler, rx)
    }

    fn real_handler(
        resolver: StaticResolver,
        authenticator: Arc<dyn crate::auth::Authenticator>,
    ) -> HttpConnHandler {
        HttpConnHandler {
            tag: "http",
            opts: HttpOptions::default(),
            acceptor: None,
            dispatcher: Arc::new(Dispatcher::new(
                authenticator,
                Arc::new(NoRuleset),
                Arc::new(resolver),
            )),
        }
    }

    fn spawn_conn(
        handler: HttpConnHandler,
    ) -> (DuplexStream, tokio::task::JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let task = tokio::spawn(async move {
            handler
                .serve_conn(Box::new(server), peer, CancellationToken::new())
                .await
        });
        (client, task)
    }

    #[tokio::test]
    async fn test_connect_happy_path_establishes_after_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let handler = real_handler(
            StaticResolver::single("example.com", addr.ip()),
            Arc::new(AllowAllAuthenticator),
        );
        let (mut client, task) = spawn_conn(handler);

        let request = format!(
            "CONNECT example.com:{} HTTP/1.1\r\nHost: example.com:{}\r\n\r\n",
            addr.port(),
            addr.port()
        );
        client.write_all(request.as_bytes()).await.unwrap();

        // The first bytes back must be exactly the established reply.
        let mut reply = vec![0u8; RESPONSE_200_ESTABLISHED.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, RESPONSE_200_ESTABLISHED);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);
        assert!(task.await.unwrap().is_ok());
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_default_port_is_80() {
        let (handler, mut rx) = capture_handler();
        let (mut client, task) = spawn_conn(handler);

        client
            .write_all(b"CONNECT example.com HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        task.await.unwrap().unwrap();

        let dest = rx.recv().await.unwrap().unwrap();
        assert_eq!(dest.network, Network::Tcp);
        assert_eq!(dest.address, Address::domain("example.com", 80));
    }

    #[tokio::test]
    async fn test_connect_bad_auth_replies_401_without_dialing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialed = Arc::new(AtomicBool::new(false));
        let dialed_flag = dialed.clone();
        tokio::spawn(async move {
            if listener.accept().await.is_ok() {
                dialed_flag.store(true, Ordering::SeqCst);
            }
        });

        let mut users = HashMap::new();
        users.insert("alice".to_string(), "secret".to_string());
        let handler = real_handler(
            StaticResolver::single("example.com", addr.ip()),
            Arc::new(StaticUserAuthenticator::new(users)),
        );
        let (mut client, task) = spawn_conn(handler);

        // "foo:bad" credentials against a store that rejects them
        let request = format!(
            "CONNECT example.com:{} HTTP/1.1\r\nHost: example.com\r\nProxy-Authorization: Basic Zm9vOmJhZA==\r\n\r\n",
            addr.port()
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut reply = vec![0u8; RESPONSE_401.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, RESPONSE_401);

        let out = task.await.unwrap();
        assert!(matches!(out, Err(Error::Unauthorized)));
        assert!(!dialed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_plain_forward_strips_hop_by_hop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let upstream = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        let handler = real_handler(
            StaticResolver::single("example.com", addr.ip()),
            Arc::new(AllowAllAuthenticator),
        );
        let (mut client, task) = spawn_conn(handler);

        let request = format!(
            "GET http://example.com:{}/a HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n",
            addr.port()
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = vec![0u8; 27];
        client.read_exact(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 204"));

        drop(client);
        let _ = task.await.unwrap();

        let forwarded = upstream.await.unwrap();
        assert!(forwarded.starts_with("GET /a HTTP/1.1\r\n"));
        assert!(!forwarded.to_ascii_lowercase().contains("proxy-connection"));
        assert!(forwarded.contains("Accept: */*"));
        // blanked User-Agent keeps the proxy anonymous
        assert!(forwarded.contains("User-Agent: \r\n"));
    }

    #[tokio::test]
    async fn test_plain_non_absolute_target_replies_400() {
        let (handler, mut rx) = capture_handler();
        let (mut client, task) = spawn_conn(handler);

        client
            .write_all(b"GET /a HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut reply = vec![0u8; RESPONSE_400.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, RESPONSE_400);

        let out = task.await.unwrap();
        assert!(matches!(out, Err(Error::Protocol(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_plain_forward_targets_hrtp_network() {
        let (handler, mut rx) = capture_handler();
        let (mut client, task) = spawn_conn(handler);

        client
            .write_all(b"GET http://example.com/a HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        task.await.unwrap().unwrap();

        let dest = rx.recv().await.unwrap().unwrap();
        assert_eq!(dest.network, Network::Hrtp);
        assert_eq!(dest.address, Address::domain("example.com", 80));
    }

    #[test]
    fn test_strip_hop_by_hop_casing_and_connection_tokens() {
        let mut headers = vec![
            ("Host".to_string(), "example.com".to_string()),
            ("PROXY-CONNECTION".to_string(), "keep-alive".to_string()),
            ("transfer-encoding".to_string(), "chunked".to_string()),
            ("Connection".to_string(), "X-Custom, Keep-Alive".to_string()),
            ("X-Custom".to_string(), "1".to_string()),
            ("Accept".to_string(), "*/*".to_string()),
        ];
        strip_hop_by_hop(&mut headers);
        let names: Vec<&str> = headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Host", "Accept"]);
    }

    #[test]
    fn test_strip_hop_by_hop_is_idempotent() {
        let mut headers = vec![
            ("Host".to_string(), "example.com".to_string()),
            ("Upgrade".to_string(), "websocket".to_string()),
        ];
        strip_hop_by_hop(&mut headers);
        let once = headers.clone();
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers, once);
    }

    fn head_with_auth(value: &str) -> RequestHead {
        RequestHead {
            method: "GET".to_string(),
            target: "http://example.com/".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![("Proxy-Authorization".to_string(), value.to_string())],
        }
    }

    #[test]
    fn test_parse_authorization_basic() {
        // base64("alice:secret")
        let head = head_with_auth("Basic YWxpY2U6c2VjcmV0");
        let auth = parse_proxy_authorization(&head, Address::unspecified());
        assert_eq!(auth.scheme, Scheme::Basic);
        assert_eq!(auth.credential, b"alice:secret");
    }

    #[test]
    fn test_parse_authorization_basic_case_insensitive_prefix() {
        let head = head_with_auth("bAsIc YWxpY2U6c2VjcmV0");
        let auth = parse_proxy_authorization(&head, Address::unspecified());
        assert_eq!(auth.scheme, Scheme::Basic);
        assert_eq!(auth.credential, b"alice:secret");
    }

    #[test]
    fn test_parse_authorization_bearer() {
        let head = head_with_auth("Bearer tok-123");
        let auth = parse_proxy_authorization(&head, Address::unspecified());
        assert_eq!(auth.scheme, Scheme::Bearer);
        assert_eq!(auth.credential, b"tok-123");
    }

    #[test]
    fn test_parse_authorization_fallback_token() {
        let head = head_with_auth("Custom opaque-value");
        let auth = parse_proxy_authorization(&head, Address::unspecified());
        assert_eq!(auth.scheme, Scheme::Token);
        assert_eq!(auth.credential, b"Custom opaque-value");

        let head = RequestHead {
            headers: Vec::new(),
            ..head_with_auth("")
        };
        let auth = parse_proxy_authorization(&head, Address::unspecified());
        assert_eq!(auth.scheme, Scheme::Token);
        assert!(auth.credential.is_empty());
    }
}
