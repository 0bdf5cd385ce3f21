//! Byte-stream abstraction.
//!
//! The connection only needs a resolver and an async byte stream; the
//! [`Connector`] trait is that seam. [`TcpConnector`] is the stock
//! implementation; tests plug in scripted in-memory streams.

mod tcp;

pub use tcp::TcpConnector;

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Resolves endpoints and opens byte streams to them.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The connected byte stream.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin;

    /// Resolve `host:port` into one or more endpoints, in preference
    /// order.
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;

    /// Open a stream to one endpoint.
    async fn connect(&self, addr: SocketAddr) -> io::Result<Self::Stream>;
}
