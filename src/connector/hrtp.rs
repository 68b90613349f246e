//! HRTP connector
//!
//! Egress for plain-HTTP requests received via the proxy: the listener has
//! already rebuilt the request head (hop-by-hop headers stripped) and
//! queued it on the ingress stream, so the copier forwards it first and
//! then relays the origin's response bytes verbatim. What remains here is
//! the dial towards the HTTP origin.

use async_trait::async_trait;

use crate::common::{Destination, Stream, TcpOptions};
use crate::error::Result;

use super::tcp::dial;
use super::Connector;

pub struct HrtpConnector {
    opts: TcpOptions,
}

impl HrtpConnector {
    pub fn new() -> Self {
        Self {
            opts: TcpOptions::upstream(),
        }
    }
}

impl Default for HrtpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for HrtpConnector {
    async fn connect(&self, destination: &Destination) -> Result<Stream> {
        dial(destination, &self.opts).await
    }
}
