//! Core types shared by every pipeline layer

pub mod address;
pub mod connection;
pub mod stream;
pub mod tcp;

pub use address::{Address, Destination, Network};
pub use connection::{
    hook, run_hook, AuthProvider, Connection, HookFn, HookFuture, Hooks, IngressEvent,
};
pub use stream::{AsyncReadWrite, PrependStream, Stream, TimeoutStream};
pub use tcp::{apply_tcp_options, TcpOptions};

pub use crate::error::Result;
