//! Server and Instance lifecycle
//!
//! A `Server` pairs one listener with the shared dispatcher. The
//! `Instance` owns a set of servers and the root cancellation token:
//! `init` runs sequentially and aborts on the first failure, `serve`
//! spawns one task per server and surfaces the first serve error, and
//! cancelling the root token cascades to every server, connection and
//! pipe within bounded time.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::auth::{AllowAllAuthenticator, Authenticator, StaticUserAuthenticator};
use crate::common::{Address, Destination};
use crate::config::Config;
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::error::{Error, Result};
use crate::listener::{
    HttpListener, HttpOptions, Listener, RawTcpListener, SocksListener, SocksOptions, UdpListener,
};
use crate::resolver::SystemResolver;
use crate::ruleset::{DenyListRuleset, NoRuleset, Ruleset};

pub struct Server {
    name: &'static str,
    listener: Box<dyn Listener>,
    dispatcher: Arc<dyn Dispatch>,
}

impl Server {
    pub fn new(name: &'static str, listener: Box<dyn Listener>, dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            name,
            listener,
            dispatcher,
        }
    }

    pub async fn init(&mut self) -> Result<()> {
        self.listener.init().await
    }

    pub async fn serve(&self, cancel: CancellationToken) -> Result<()> {
        self.listener.serve(cancel, self.dispatcher.clone()).await
    }
}

pub struct Instance {
    servers: Vec<Server>,
    cancel: CancellationToken,
}

impl Instance {
    pub fn new() -> Self {
        Self {
            servers: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Assemble servers from the configuration file. Policy components
    /// (authenticator, ruleset, resolver) are shared across all servers;
    /// a reload builds a fresh instance, in-flight connections keep the
    /// references they captured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let authenticator: Arc<dyn Authenticator> = if config.auth.users.is_empty() {
            Arc::new(AllowAllAuthenticator)
        } else {
            Arc::new(StaticUserAuthenticator::new(config.auth.users.clone()))
        };
        let ruleset: Arc<dyn Ruleset> = if config.ruleset.deny.is_empty() {
            Arc::new(NoRuleset)
        } else {
            Arc::new(DenyListRuleset::new(config.ruleset.deny.clone()))
        };
        let dispatcher: Arc<dyn Dispatch> = Arc::new(Dispatcher::new(
            authenticator.clone(),
            ruleset,
            Arc::new(SystemResolver),
        ));

        let mut instance = Instance::new();

        if !config.http.disabled {
            let listener = HttpListener::new(
                config.listen_addr(config.http_port)?,
                HttpOptions {
                    verbose: config.http.verbose,
                },
            );
            instance.push(Server::new("http", Box::new(listener), dispatcher.clone()));
        }

        if let Some(https) = &config.https {
            if !https.disabled {
                let listener = HttpListener::with_tls(
                    config.listen_addr(config.https_port)?,
                    HttpOptions {
                        verbose: config.http.verbose,
                    },
                    https.tls_cert_file.clone(),
                    https.tls_key_file.clone(),
                );
                instance.push(Server::new("https", Box::new(listener), dispatcher.clone()));
            }
        }

        if !config.socks.disabled {
            let listener = SocksListener::new(
                config.listen_addr(config.socks_port)?,
                SocksOptions {
                    auth_enabled: config.socks.auth_enabled,
                    reply_before_dial: config.socks.reply_before_dial,
                },
                authenticator.clone(),
            );
            instance.push(Server::new("socks", Box::new(listener), dispatcher.clone()));
        }

        if let Some(raw) = &config.tcp {
            let listener = RawTcpListener::new(
                config.listen_addr(raw.port)?,
                parse_forward(raw.destination.as_deref())?,
            );
            instance.push(Server::new("tcp", Box::new(listener), dispatcher.clone()));
        }

        if let Some(raw) = &config.udp {
            let listener = UdpListener::new(
                config.listen_addr(raw.port)?,
                parse_forward(raw.destination.as_deref())?,
            );
            instance.push(Server::new("udp", Box::new(listener), dispatcher.clone()));
        }

        Ok(instance)
    }

    pub fn push(&mut self, server: Server) {
        self.servers.push(server);
    }

    /// Token that stops the whole instance when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Initialize all servers sequentially; the first failure aborts.
    pub async fn init(&mut self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Config("servers is required".into()));
        }
        for server in &mut self.servers {
            info!("{}: init", server.name);
            server.init().await?;
        }
        Ok(())
    }

    /// Run all servers until the first error or until the shutdown token
    /// fires. Either way the token is cancelled afterwards and every
    /// server task is awaited before returning.
    pub async fn serve(self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Config("servers is required".into()));
        }

        let cancel = self.cancel.clone();
        let (tx, mut rx) = mpsc::channel::<Error>(self.servers.len());
        let mut tasks = Vec::new();
        for server in self.servers {
            let token = cancel.clone();
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.serve(token).await {
                    error!("{}: serve error: {}", server.name, e);
                    let _ = tx.send(e).await;
                }
            }));
        }
        drop(tx);

        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            first = rx.recv() => match first {
                Some(e) => Err(e),
                None => Ok(()),
            },
        };

        cancel.cancel();
        for task in tasks {
            let _ = task.await;
        }
        result
    }
}

impl Default for Instance {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_forward(destination: Option<&str>) -> Result<Option<Destination>> {
    match destination {
        Some(s) => {
            let address = Address::parse_host_port(s, 0)?;
            if address.port() == 0 {
                return Err(Error::Config(format!(
                    "forward destination needs a port: {}",
                    s
                )));
            }
            Ok(Some(Destination::tcp(address)))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::socks5::SocksHandler;
    use crate::resolver::StaticResolver;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_init_requires_servers() {
        let mut instance = Instance::new();
        let out = instance.init().await;
        assert!(matches!(out, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_from_config_builds_default_servers() {
        let config = Config::from_toml("").unwrap();
        let instance = Instance::from_config(&config).unwrap();
        // http + socks by default; https and raw listeners need config
        assert_eq!(instance.servers.len(), 2);
    }

    #[tokio::test]
    async fn test_from_config_honors_disabled_flags() {
        let config = Config::from_toml(
            "[http]\ndisabled = true\n[socks]\ndisabled = true\n[tcp]\nport = 9000\ndestination = \"127.0.0.1:9001\"\n",
        )
        .unwrap();
        let instance = Instance::from_config(&config).unwrap();
        assert_eq!(instance.servers.len(), 1);
        assert_eq!(instance.servers[0].name, "tcp");
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown_within_bound() {
        let config = Config::from_toml(
            "http_port = 0\nsocks_port = 0\nbind = \"127.0.0.1\"\n",
        )
        .unwrap();
        let mut instance = Instance::from_config(&config).unwrap();
        instance.init().await.unwrap();
        let shutdown = instance.shutdown_handle();

        let serve = tokio::spawn(instance.serve());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let out = tokio::time::timeout(Duration::from_secs(1), serve)
            .await
            .expect("instance did not stop within 1s")
            .unwrap();
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_active_tunnel() {
        // Upstream that accepts and then just holds the socket open.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let accepted = upstream.accept().await;
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(accepted);
        });

        let dispatcher: Arc<dyn Dispatch> = Arc::new(Dispatcher::new(
            Arc::new(AllowAllAuthenticator),
            Arc::new(NoRuleset),
            Arc::new(StaticResolver::new(HashMap::new())),
        ));
        let handler = SocksHandler {
            opts: SocksOptions::default(),
            authenticator: Arc::new(AllowAllAuthenticator),
            dispatcher,
        };

        let cancel = CancellationToken::new();
        let (mut client, server_side) = tokio::io::duplex(64 * 1024);
        let conn_cancel = cancel.child_token();
        let task = tokio::spawn(async move {
            handler
                .serve_conn(
                    Box::new(server_side),
                    "127.0.0.1:4000".parse().unwrap(),
                    "127.0.0.1:1080".parse().unwrap(),
                    conn_cancel,
                )
                .await
        });

        // Handshake up to the live tunnel.
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        let mut req = vec![0x05, 0x01, 0x00, 0x01];
        match upstream_addr {
            std::net::SocketAddr::V4(v4) => {
                req.extend_from_slice(&v4.ip().octets());
                req.extend_from_slice(&v4.port().to_be_bytes());
            }
            std::net::SocketAddr::V6(_) => unreachable!(),
        }
        client.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();

        // Cancel the parent; both pipe halves must exit promptly.
        cancel.cancel();
        let out = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("tunnel did not tear down within 1s")
            .unwrap();
        assert!(out.is_ok());
    }
}
