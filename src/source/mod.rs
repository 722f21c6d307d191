//! Listener/dialer capability shared by both socket backends.
//!
//! Server and client logic are written once against [`ConnectionSource`];
//! the orchestrator picks [`StackConnector`] or [`HostConnector`] when it
//! builds a run.

pub mod host;
pub mod stack;

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::stack::{Family, NicId};

pub use host::HostConnector;
pub use stack::StackConnector;

/// A duplex byte stream from either backend.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxConnection = Box<dyn Connection>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("listen on port {port} failed: {source}")]
    Listen { port: u16, source: io::Error },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("dial {target} failed: {source}")]
    Dial { target: SocketAddr, source: io::Error },

    #[error("interface {nic} does not belong to this stack (it owns {owned})")]
    UnknownNic { nic: NicId, owned: NicId },

    #[error("target {target} is not reachable over {family}")]
    FamilyMismatch { target: SocketAddr, family: Family },
}

/// Which socket implementation backs a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Stack,
    Host,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Stack => write!(f, "stack"),
            Backend::Host => write!(f, "host"),
        }
    }
}

/// A bound listening endpoint.
#[async_trait::async_trait]
pub trait Listener: Send {
    /// Wait for the next inbound connection and its peer address.
    async fn accept(&mut self) -> Result<(BoxConnection, SocketAddr), SourceError>;

    /// Address the listener is bound to, with the actual port.
    fn local_addr(&self) -> SocketAddr;
}

/// Produces listening endpoints and outbound connections.
#[async_trait::async_trait]
pub trait ConnectionSource: Send + Sync {
    async fn listen(&self, port: u16) -> Result<Box<dyn Listener>, SourceError>;

    async fn dial(&self, target: SocketAddr) -> Result<BoxConnection, SourceError>;

    fn backend(&self) -> Backend;
}
