//! Per-connection state and the listener → dispatcher envelope

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::Authentication;
use crate::error::{Error, Result};

use super::{Address, Destination, Network, Stream};

/// Future type returned by hook closures; borrows the stream it writes to.
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A hook is a protocol-specific reply writer invoked by the dispatcher at
/// a fixed point of the handshake. `err` carries the phase outcome: `None`
/// for success, `Some` for the failure the hook may answer on the wire.
pub type HookFn =
    Box<dyn for<'a> Fn(&'a mut Stream, Option<&'a Error>) -> HookFuture<'a> + Send + Sync>;

/// Coerce a closure into a boxed hook.
pub fn hook<F>(f: F) -> HookFn
where
    F: for<'a> Fn(&'a mut Stream, Option<&'a Error>) -> HookFuture<'a> + Send + Sync + 'static,
{
    Box::new(f)
}

/// The closed set of per-connection hooks. Listeners fill the slots they
/// need before dispatch; the record is frozen afterwards.
#[derive(Default)]
pub struct Hooks {
    /// After the authenticate phase. Writes the protocol's rejection reply
    /// on failure.
    pub after_authenticated: Option<HookFn>,
    /// After the ruleset phase. `NoRulesetMatched` counts as allow.
    pub after_ruleset: Option<HookFn>,
    /// After the upstream dial. On success this is where a tunnel reply
    /// (e.g. `200 Connection established`) becomes legal; on failure it
    /// writes the protocol's advisory error reply.
    pub after_dialed: Option<HookFn>,
    /// Immediately after the connector hands back the upstream socket,
    /// before `after_dialed`.
    pub on_dialer: Option<HookFn>,
}

/// Run an optional hook slot against the connection's client stream.
pub async fn run_hook(
    slot: &Option<HookFn>,
    stream: &mut Stream,
    err: Option<&Error>,
) -> Result<()> {
    match slot {
        Some(f) => f(stream, err).await,
        None => Ok(()),
    }
}

/// Per-ingress connection record.
///
/// Invariants: `id` is immutable; `source` is set once by the listener;
/// `destination` is set at most once by the protocol parser (the
/// dispatcher may replace a domain address with its resolved IP); the
/// stream is owned exclusively by the pipeline until termination.
pub struct Connection {
    pub id: Uuid,
    pub network: Network,
    pub source: Address,
    pub destination: Option<Destination>,
    pub stream: Stream,
    pub hooks: Hooks,
    pub cancel: CancellationToken,
}

impl Connection {
    pub fn new(network: Network, source: Address, stream: Stream, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            network,
            source,
            destination: None,
            stream,
            hooks: Hooks::default(),
            cancel,
        }
    }

    /// Builder: set the parsed destination
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Builder: install the listener's hooks
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Lazy credential provider. The listener parses credentials on the accept
/// task; the authenticator consumes them on the dispatcher's task.
pub type AuthProvider = Box<dyn FnOnce() -> Authentication + Send>;

/// The envelope a listener hands to the dispatcher once the client-facing
/// handshake has progressed far enough to know where the connection goes.
pub struct IngressEvent {
    pub conn: Connection,
    pub auth: AuthProvider,
}

impl IngressEvent {
    pub fn new(conn: Connection, auth: Authentication) -> Self {
        Self {
            conn,
            auth: Box::new(move || auth),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Authentication, Scheme};
    use tokio::io::AsyncWriteExt;

    fn test_stream() -> (Stream, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(64);
        (Box::new(a), b)
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let (s1, _k1) = test_stream();
        let (s2, _k2) = test_stream();
        let token = CancellationToken::new();
        let a = Connection::new(Network::Tcp, Address::unspecified(), s1, token.clone());
        let b = Connection::new(Network::Tcp, Address::unspecified(), s2, token);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_run_hook_empty_slot_is_ok() {
        let (mut stream, _keep) = test_stream();
        assert!(run_hook(&None, &mut stream, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_hook_writes_and_propagates() {
        async fn reject(stream: &mut Stream, err: Option<&Error>) -> Result<()> {
            if err.is_some() {
                stream.write_all(b"DENIED").await?;
                return Err(Error::Unauthorized);
            }
            Ok(())
        }

        let (mut stream, mut peer) = test_stream();
        let slot = Some(hook(|s, e| Box::pin(reject(s, e))));

        assert!(run_hook(&slot, &mut stream, None).await.is_ok());

        let state = Error::Unauthorized;
        let out = run_hook(&slot, &mut stream, Some(&state)).await;
        assert!(matches!(out, Err(Error::Unauthorized)));

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 6];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"DENIED");
    }

    #[test]
    fn test_ingress_event_provider_is_lazy() {
        let (stream, _keep) = test_stream();
        let conn = Connection::new(
            Network::Tcp,
            Address::unspecified(),
            stream,
            CancellationToken::new(),
        );
        let auth = Authentication::new(Address::unspecified(), Scheme::Basic, b"u:p".to_vec());
        let event = IngressEvent::new(conn, auth);
        let produced = (event.auth)();
        assert_eq!(produced.scheme, Scheme::Basic);
        assert_eq!(produced.credential, b"u:p");
    }
}
