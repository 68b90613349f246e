//! Dispatcher - per-connection phase chain
//!
//! The dispatcher owns the transition from parsed ingress to live upstream
//! pipe:
//!
//! ```text
//! authenticate → ruleset → resolve → select connector → dial → copy
//! ```
//!
//! Phases run strictly in order and each one checks cancellation before
//! proceeding. Hooks installed by the listener are invoked at their fixed
//! points so protocol replies land exactly where the wire format allows
//! them; a hook returning an error short-circuits the chain.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::auth::Authenticator;
use crate::common::{run_hook, Address, Connection, Destination, IngressEvent, Network};
use crate::connector::{Connector, HrtpConnector, TcpConnector};
use crate::copier;
use crate::error::{Error, Result};
use crate::resolver::Resolver;
use crate::ruleset::Ruleset;

/// The listener-facing surface of the dispatcher.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, event: IngressEvent) -> Result<()>;
}

pub struct Dispatcher {
    authenticator: Arc<dyn Authenticator>,
    ruleset: Arc<dyn Ruleset>,
    resolver: Arc<dyn Resolver>,
    tcp: TcpConnector,
    hrtp: HrtpConnector,
}

impl Dispatcher {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        ruleset: Arc<dyn Ruleset>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            authenticator,
            ruleset,
            resolver,
            tcp: TcpConnector::new(),
            hrtp: HrtpConnector::new(),
        }
    }

    async fn run(&self, event: IngressEvent) -> Result<()> {
        let IngressEvent { mut conn, auth } = event;
        let start = Instant::now();

        // Phase 1: authenticate
        ensure_live(&conn)?;
        let credentials = auth();
        if let Err(state) = self.authenticator.authenticate(&credentials).await {
            debug!("[{}] auth rejected ({})", conn.id, credentials.scheme);
            run_hook(
                &conn.hooks.after_authenticated,
                &mut conn.stream,
                Some(&state),
            )
            .await?;
            return Err(state);
        }
        run_hook(&conn.hooks.after_authenticated, &mut conn.stream, None).await?;

        // Phase 2: ruleset
        ensure_live(&conn)?;
        let destination = conn.destination.clone().ok_or(Error::DestinationRequired)?;
        let verdict = self.ruleset.evaluate(&conn.source, &destination).await;
        let state = verdict.err();
        run_hook(&conn.hooks.after_ruleset, &mut conn.stream, state.as_ref()).await?;
        match state {
            None | Some(Error::NoRulesetMatched) => {}
            Some(denied) => return Err(denied),
        }

        // Phase 3: resolve
        ensure_live(&conn)?;
        let destination = self.resolve(destination).await?;
        conn.destination = Some(destination.clone());

        // Phase 4: select connector
        ensure_live(&conn)?;
        let connector: &dyn Connector = match destination.network {
            Network::Tcp => &self.tcp,
            Network::Hrtp => &self.hrtp,
            other => return Err(Error::NoConnector(other)),
        };

        // Phase 5: dial
        ensure_live(&conn)?;
        let upstream = match connector.connect(&destination).await {
            Ok(stream) => stream,
            Err(e) => {
                // The advisory failure reply is best effort; the dial
                // error is what the listener needs to see.
                let _ = run_hook(&conn.hooks.after_dialed, &mut conn.stream, Some(&e)).await;
                return Err(e);
            }
        };
        run_hook(&conn.hooks.on_dialer, &mut conn.stream, None).await?;
        run_hook(&conn.hooks.after_dialed, &mut conn.stream, None).await?;

        info!("[{}] {} -> {}", conn.id, conn.source, destination);

        // Phase 6: copy
        let (up, down) = copier::pump(conn.stream, upstream, conn.cancel.clone()).await?;

        info!(
            "[{}] closed: {} -> {} (up {} down {} in {:?})",
            conn.id,
            conn.source,
            destination,
            format_bytes(up),
            format_bytes(down),
            start.elapsed()
        );

        Ok(())
    }

    async fn resolve(&self, destination: Destination) -> Result<Destination> {
        let Address::Domain(name, port) = &destination.address else {
            return Ok(destination);
        };

        let ips = self.resolver.resolve(name).await?;
        let ip = *ips
            .first()
            .ok_or_else(|| Error::ResolveFailed(name.clone()))?;
        debug!("resolved {} -> {}", name, ip);
        Ok(Destination {
            network: destination.network,
            address: Address::ip_port(ip, *port),
        })
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(&self, event: IngressEvent) -> Result<()> {
        self.run(event).await
    }
}

fn ensure_live(conn: &Connection) -> Result<()> {
    if conn.cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Format bytes in human-readable form
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAllAuthenticator, Authentication, Scheme, StaticUserAuthenticator};
    use crate::common::{hook, Stream};
    use crate::resolver::StaticResolver;
    use crate::ruleset::{DenyListRuleset, NoRuleset};
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn allow_all() -> Dispatcher {
        Dispatcher::new(
            Arc::new(AllowAllAuthenticator),
            Arc::new(NoRuleset),
            Arc::new(StaticResolver::new(HashMap::new())),
        )
    }

    fn make_conn(dest: Option<Destination>) -> (Connection, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let mut conn = Connection::new(
            Network::Tcp,
            Address::unspecified(),
            Box::new(near),
            CancellationToken::new(),
        );
        conn.destination = dest;
        (conn, far)
    }

    fn source_event(conn: Connection) -> IngressEvent {
        IngressEvent::new(conn, Authentication::source_only(Address::unspecified()))
    }

    async fn mark_reply(stream: &mut Stream, err: Option<&Error>) -> Result<()> {
        if err.is_some() {
            stream.write_all(b"NAK").await?;
        } else {
            stream.write_all(b"ACK").await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_auth_failure_runs_hook_and_stops() {
        let dispatcher = Dispatcher::new(
            Arc::new(StaticUserAuthenticator::new(HashMap::new())),
            Arc::new(NoRuleset),
            Arc::new(StaticResolver::new(HashMap::new())),
        );

        let (mut conn, mut client) = make_conn(Some(Destination::tcp(Address::unspecified())));
        conn.hooks.after_authenticated = Some(hook(|s, e| Box::pin(mark_reply(s, e))));

        let auth = Authentication::new(Address::unspecified(), Scheme::Basic, b"foo:bad".to_vec());
        let out = dispatcher.dispatch(IngressEvent::new(conn, auth)).await;
        assert!(matches!(out, Err(Error::Unauthorized)));

        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"NAK");
    }

    #[tokio::test]
    async fn test_missing_destination_is_rejected() {
        let (conn, _client) = make_conn(None);
        let out = allow_all().dispatch(source_event(conn)).await;
        assert!(matches!(out, Err(Error::DestinationRequired)));
    }

    #[tokio::test]
    async fn test_ruleset_deny_runs_hook_and_stops() {
        let dispatcher = Dispatcher::new(
            Arc::new(AllowAllAuthenticator),
            Arc::new(DenyListRuleset::new(vec!["blocked.test".to_string()])),
            Arc::new(StaticResolver::new(HashMap::new())),
        );

        let (mut conn, mut client) =
            make_conn(Some(Destination::tcp(Address::domain("blocked.test", 80))));
        conn.hooks.after_ruleset = Some(hook(|s, e| Box::pin(mark_reply(s, e))));

        let out = dispatcher.dispatch(source_event(conn)).await;
        assert!(matches!(out, Err(Error::Forbidden)));

        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"NAK");
    }

    #[tokio::test]
    async fn test_cancelled_connection_never_dispatches() {
        let (conn, _client) = make_conn(Some(Destination::tcp(Address::unspecified())));
        conn.cancel.cancel();
        let out = allow_all().dispatch(source_event(conn)).await;
        assert!(matches!(out, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_udp_destination_has_no_connector() {
        let (conn, _client) = make_conn(Some(Destination {
            network: Network::Udp,
            address: Address::unspecified(),
        }));
        let out = allow_all().dispatch(source_event(conn)).await;
        assert!(matches!(out, Err(Error::NoConnector(Network::Udp))));
    }

    #[tokio::test]
    async fn test_resolve_failure_surfaces() {
        let (conn, _client) = make_conn(Some(Destination::tcp(Address::domain("nope.test", 80))));
        let out = allow_all().dispatch(source_event(conn)).await;
        assert!(matches!(out, Err(Error::ResolveFailed(_))));
    }

    #[tokio::test]
    async fn test_happy_path_resolves_dials_and_copies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let dispatcher = Dispatcher::new(
            Arc::new(AllowAllAuthenticator),
            Arc::new(NoRuleset),
            Arc::new(StaticResolver::single("echo.test", addr.ip())),
        );

        let (mut conn, mut client) =
            make_conn(Some(Destination::tcp(Address::domain("echo.test", addr.port()))));
        conn.hooks.after_dialed = Some(hook(|s, e| Box::pin(mark_reply(s, e))));

        let dispatch = tokio::spawn(async move {
            dispatcher.dispatch(source_event(conn)).await
        });

        // The success reply must arrive before any relayed bytes.
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ACK");

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);
        assert!(dispatch.await.unwrap().is_ok());
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_runs_after_dialed_hook_with_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mut conn, mut client) = make_conn(Some(Destination::tcp(Address::Socket(addr))));
        conn.hooks.after_dialed = Some(hook(|s, e| Box::pin(mark_reply(s, e))));

        let out = allow_all().dispatch(source_event(conn)).await;
        assert!(matches!(out, Err(Error::ConnectFailed(_))));

        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"NAK");
    }
}
