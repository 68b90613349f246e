//! Connectors - upstream dialers
//!
//! A connector owns the upstream dial and hands back a duplex stream. It
//! is pure plumbing: no policy, no resolution. By the time a destination
//! reaches a connector it must be IP-typed.

mod hrtp;
mod tcp;

pub use hrtp::HrtpConnector;
pub use tcp::TcpConnector;

use async_trait::async_trait;

use crate::common::{Destination, Stream};
use crate::error::Result;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial the upstream and return the connected stream.
    async fn connect(&self, destination: &Destination) -> Result<Stream>;
}
