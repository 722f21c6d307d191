//! User-space stack backend.

use std::net::SocketAddr;

use tracing::{debug, trace};

use super::{Backend, BoxConnection, ConnectionSource, Listener, SourceError};
use crate::stack::{Family, NicId, StackInstance, StackListener};

/// Binds and dials through one [`StackInstance`] on a given interface and family.
#[derive(Debug, Clone)]
pub struct StackConnector {
    stack: StackInstance,
    nic: NicId,
    family: Family,
}

impl StackConnector {
    pub fn new(stack: StackInstance, nic: NicId, family: Family) -> Self {
        Self { stack, nic, family }
    }

    /// IPv6 connector on the stack's own interface.
    pub fn ipv6(stack: StackInstance) -> Self {
        let nic = stack.nic_id();
        Self::new(stack, nic, Family::V6)
    }

    fn check_nic(&self) -> Result<(), SourceError> {
        let owned = self.stack.nic_id();
        if self.nic != owned {
            return Err(SourceError::UnknownNic {
                nic: self.nic,
                owned,
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Listener for StackListener {
    async fn accept(&mut self) -> Result<(BoxConnection, SocketAddr), SourceError> {
        let (stream, peer) = StackListener::accept(self).await.map_err(SourceError::Accept)?;
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> SocketAddr {
        StackListener::local_addr(self)
    }
}

#[async_trait::async_trait]
impl ConnectionSource for StackConnector {
    async fn listen(&self, port: u16) -> Result<Box<dyn Listener>, SourceError> {
        self.check_nic()?;
        let listener = self
            .stack
            .listen(port)
            .map_err(|source| SourceError::Listen { port, source })?;
        debug!(nic = %self.nic, local = %listener.local_addr(), "stack listener ready");
        Ok(Box::new(listener))
    }

    async fn dial(&self, target: SocketAddr) -> Result<BoxConnection, SourceError> {
        self.check_nic()?;
        if Family::of(&target) != self.family {
            return Err(SourceError::FamilyMismatch {
                target,
                family: self.family,
            });
        }
        let stream = self
            .stack
            .connect(target)
            .await
            .map_err(|source| SourceError::Dial { target, source })?;
        trace!(local = %stream.local_addr(), peer = %stream.peer_addr(), "stack dial established");
        Ok(Box::new(stream))
    }

    fn backend(&self) -> Backend {
        Backend::Stack
    }
}
