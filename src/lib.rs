//! Polygate - a multi-protocol forward proxy
//!
//! # Architecture (Connection Pipeline)
//!
//! ```text
//! Listener (HTTP/SOCKS5/TCP/UDP)
//! → IngressEvent
//! → Dispatcher (authenticate → ruleset → resolve → dial)
//! → Connector (TCP/HRTP)
//! → Copier (bidirectional pipe)
//! ```
//!
//! ## Core Principles
//!
//! - Listeners own the client-facing wire protocol and nothing else
//! - The dispatcher runs the same phase chain for every protocol
//! - Protocol replies are injected by hooks at fixed handshake points
//! - Everything is reachable from one cancellation token
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Address, Connection, Stream, hooks
//! ├── listener/        # Ingress: HTTP(S), SOCKS5, raw TCP, raw UDP
//! ├── connector/       # Egress dialers: TCP, HRTP
//! ├── dispatcher.rs    # Phase chain
//! ├── copier.rs        # Bidirectional byte pump
//! ├── auth.rs          # Authenticator interface + built-in stores
//! ├── ruleset.rs       # Ruleset interface + built-in rules
//! ├── resolver.rs      # Resolver interface
//! └── server.rs        # Server + Instance lifecycle
//! ```

// Core types
pub mod common;
pub mod error;

// Pipeline
pub mod connector;
pub mod copier;
pub mod dispatcher;
pub mod listener;

// Policy surfaces
pub mod auth;
pub mod resolver;
pub mod ruleset;

// Lifecycle
pub mod config;
pub mod server;

// Re-exports for convenience
pub use common::{Address, Connection, Destination, IngressEvent, Network, Stream};
pub use config::Config;
pub use error::{Error, Result};

// Architecture re-exports
pub use auth::{Authentication, Authenticator};
pub use connector::Connector;
pub use dispatcher::{Dispatch, Dispatcher};
pub use listener::Listener;
pub use resolver::Resolver;
pub use ruleset::Ruleset;
pub use server::{Instance, Server};
