//! Host-socket backend: the operating system's own TCP stack.

use std::net::{IpAddr, SocketAddr};

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::{Backend, BoxConnection, ConnectionSource, Listener, SourceError};

/// Listens on `bind_ip` and dials through native sockets.
#[derive(Debug, Clone)]
pub struct HostConnector {
    bind_ip: IpAddr,
}

impl HostConnector {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }
}

pub struct HostListener {
    inner: TcpListener,
    local: SocketAddr,
}

#[async_trait::async_trait]
impl Listener for HostListener {
    async fn accept(&mut self) -> Result<(BoxConnection, SocketAddr), SourceError> {
        let (stream, peer) = self.inner.accept().await.map_err(SourceError::Accept)?;
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[async_trait::async_trait]
impl ConnectionSource for HostConnector {
    async fn listen(&self, port: u16) -> Result<Box<dyn Listener>, SourceError> {
        let listen_err = |source| SourceError::Listen { port, source };
        let inner = TcpListener::bind((self.bind_ip, port)).await.map_err(listen_err)?;
        let local = inner.local_addr().map_err(listen_err)?;
        debug!(%local, "host listener bound");
        Ok(Box::new(HostListener { inner, local }))
    }

    async fn dial(&self, target: SocketAddr) -> Result<BoxConnection, SourceError> {
        let stream = TcpStream::connect(target)
            .await
            .map_err(|source| SourceError::Dial { target, source })?;
        Ok(Box::new(stream))
    }

    fn backend(&self) -> Backend {
        Backend::Host
    }
}
