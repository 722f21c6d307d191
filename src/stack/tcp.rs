//! TCP listeners and streams over a [`super::StackInstance`].
//!
//! smoltcp sockets accept exactly one connection each, so a listener keeps a
//! backlog of listening sockets on its port. The driver promotes sockets
//! that finished the handshake into the listener's ready queue and re-arms
//! the backlog after every poll. Streams adapt one socket to tokio's
//! `AsyncRead` / `AsyncWrite`, using smoltcp's waker registration for
//! readiness.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::poll_fn;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp::{self, RecvError, State};
use smoltcp::socket::Socket;
use smoltcp::wire::{IpEndpoint, IpListenEndpoint};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

use super::{to_ip_address, to_std_ip, ListenQueue, Shared, StackCore};

/// Local ports handed out to outbound connections.
pub(crate) const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;
pub(crate) const EPHEMERAL_SPAN: u16 = 16384;

fn not_running() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stack driver has stopped")
}

fn endpoint_addr(endpoint: IpEndpoint) -> SocketAddr {
    SocketAddr::new(to_std_ip(endpoint.addr), endpoint.port)
}

// ---------------------------------------------------------------------------
// Socket bookkeeping on the stack core
// ---------------------------------------------------------------------------

impl StackCore {
    fn new_socket(&self) -> tcp::Socket<'static> {
        let size = self.config.socket_buffer_size;
        let mut socket = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0; size]),
            tcp::SocketBuffer::new(vec![0; size]),
        );
        socket.set_nagle_enabled(false);
        socket
    }

    fn listen_endpoint(&self, port: u16) -> IpListenEndpoint {
        IpListenEndpoint {
            addr: Some(to_ip_address(IpAddr::V6(self.addr))),
            port,
        }
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.listeners.contains_key(&port)
            || self.sockets.iter().any(|(_, socket)| match socket {
                Socket::Tcp(tcp) => tcp.local_endpoint().map(|ep| ep.port) == Some(port),
                _ => false,
            })
    }

    fn allocate_port(&mut self) -> io::Result<u16> {
        for _ in 0..EPHEMERAL_SPAN {
            let port = self.next_port;
            self.next_port = if port == *EPHEMERAL_PORTS.end() {
                *EPHEMERAL_PORTS.start()
            } else {
                port + 1
            };
            if !self.port_in_use(port) {
                return Ok(port);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "ephemeral port range exhausted",
        ))
    }

    /// Add one listening socket to the backlog of `port`.
    fn arm(&mut self, port: u16) -> io::Result<SocketHandle> {
        let mut socket = self.new_socket();
        socket
            .listen(self.listen_endpoint(port))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("listen: {e}")))?;
        Ok(self.sockets.add(socket))
    }

    pub(crate) fn register_listener(&mut self, port: u16) -> io::Result<()> {
        if !self.running {
            return Err(not_running());
        }
        if port == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stack listeners need an explicit port",
            ));
        }
        if self.listeners.contains_key(&port) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("port {port} already in use"),
            ));
        }
        let mut queue = ListenQueue::default();
        for _ in 0..self.config.listen_backlog.max(1) {
            queue.armed.push(self.arm(port)?);
        }
        self.listeners.insert(port, queue);
        Ok(())
    }

    pub(crate) fn unregister_listener(&mut self, port: u16) {
        if let Some(queue) = self.listeners.remove(&port) {
            for handle in queue.armed.into_iter().chain(queue.ready) {
                self.sockets.get_mut::<tcp::Socket>(handle).abort();
                self.closing.push(handle);
            }
        }
    }

    /// Promote handshaken sockets to ready queues and re-arm every backlog.
    pub(crate) fn service_listeners(&mut self) {
        let ports: Vec<u16> = self.listeners.keys().copied().collect();
        for port in ports {
            let endpoint = self.listen_endpoint(port);
            let backlog = self.config.listen_backlog.max(1);
            let Some(mut queue) = self.listeners.remove(&port) else {
                continue;
            };

            let sockets = &mut self.sockets;
            queue.armed.retain(|&handle| {
                let socket = sockets.get_mut::<tcp::Socket>(handle);
                match socket.state() {
                    State::Listen | State::SynReceived => true,
                    State::Closed => {
                        // Reset mid-handshake; put it back to listening.
                        if socket.listen(endpoint).is_err() {
                            sockets.remove(handle);
                            return false;
                        }
                        true
                    }
                    _ => {
                        queue.ready.push_back(handle);
                        false
                    }
                }
            });

            // Half-open sockets no longer take SYNs; only `Listen` ones count.
            let mut listening = queue
                .armed
                .iter()
                .filter(|&&handle| sockets.get::<tcp::Socket>(handle).state() == State::Listen)
                .count();
            while listening < backlog {
                match self.arm(port) {
                    Ok(handle) => {
                        queue.armed.push(handle);
                        listening += 1;
                    }
                    Err(e) => {
                        debug!(port, error = %e, "failed to re-arm listening socket");
                        break;
                    }
                }
            }

            if !queue.ready.is_empty() {
                if let Some(waker) = queue.waker.take() {
                    waker.wake();
                }
            }
            self.listeners.insert(port, queue);
        }
    }

    /// Remove released sockets that have fully closed.
    pub(crate) fn reclaim_closed(&mut self) {
        let sockets = &mut self.sockets;
        self.closing.retain(|&handle| {
            if sockets.get::<tcp::Socket>(handle).state() == State::Closed {
                sockets.remove(handle);
                false
            } else {
                true
            }
        });
    }

    /// Fail everything: listeners stop accepting and every socket is reset.
    pub(crate) fn shut_down(&mut self) {
        self.running = false;
        for queue in self.listeners.values_mut() {
            if let Some(waker) = queue.waker.take() {
                waker.wake();
            }
        }
        for (_, socket) in self.sockets.iter_mut() {
            if let Socket::Tcp(tcp) = socket {
                tcp.abort();
            }
        }
    }

    fn poll_accept(
        &mut self,
        port: u16,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<(SocketHandle, SocketAddr)>> {
        if !self.running {
            return Poll::Ready(Err(not_running()));
        }
        let Some(queue) = self.listeners.get_mut(&port) else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener closed",
            )));
        };
        match queue.ready.pop_front() {
            Some(handle) => {
                let socket = self.sockets.get::<tcp::Socket>(handle);
                let peer = socket
                    .remote_endpoint()
                    .map(endpoint_addr)
                    .unwrap_or_else(|| SocketAddr::new(IpAddr::V6(self.addr), 0));
                Poll::Ready(Ok((handle, peer)))
            }
            None => {
                queue.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    fn open(&mut self, remote: SocketAddr) -> io::Result<SocketHandle> {
        if !self.running {
            return Err(not_running());
        }
        let local_port = self.allocate_port()?;
        let local = self.listen_endpoint(local_port);
        let mut socket = self.new_socket();
        socket
            .connect(
                self.iface.context(),
                IpEndpoint::new(to_ip_address(remote.ip()), remote.port()),
                local,
            )
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("connect: {e}")))?;
        Ok(self.sockets.add(socket))
    }

    fn poll_established(&mut self, handle: SocketHandle, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.running {
            return Poll::Ready(Err(not_running()));
        }
        let socket = self.sockets.get_mut::<tcp::Socket>(handle);
        match socket.state() {
            State::SynSent | State::SynReceived => {
                socket.register_recv_waker(cx.waker());
                Poll::Pending
            }
            State::Closed | State::TimeWait => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))),
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_recv(
        &mut self,
        handle: SocketHandle,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let running = self.running;
        let socket = self.sockets.get_mut::<tcp::Socket>(handle);
        match socket.recv_slice(buf.initialize_unfilled()) {
            Ok(0) if !running => Poll::Ready(Err(not_running())),
            Ok(0) => {
                socket.register_recv_waker(cx.waker());
                Poll::Pending
            }
            Ok(n) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Err(RecvError::Finished) => Poll::Ready(Ok(())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset",
            ))),
        }
    }

    fn poll_send(&mut self, handle: SocketHandle, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        if !self.running {
            return Poll::Ready(Err(not_running()));
        }
        let socket = self.sockets.get_mut::<tcp::Socket>(handle);
        if !socket.may_send() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed for sending",
            )));
        }
        match socket.send_slice(data) {
            Ok(0) => {
                socket.register_send_waker(cx.waker());
                Poll::Pending
            }
            Ok(n) => Poll::Ready(Ok(n)),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed for sending",
            ))),
        }
    }

    /// Hand a socket back for reclamation once it has closed.
    fn release(&mut self, handle: SocketHandle) {
        self.sockets.get_mut::<tcp::Socket>(handle).close();
        self.closing.push(handle);
    }
}

// ---------------------------------------------------------------------------
// StackListener
// ---------------------------------------------------------------------------

/// Listening endpoint on a stack instance. Dropping it stops accepting.
pub struct StackListener {
    shared: Arc<Shared>,
    port: u16,
    local: SocketAddr,
}

impl StackListener {
    pub(crate) fn bind(shared: Arc<Shared>, port: u16) -> io::Result<Self> {
        let local = {
            let mut core = shared.core.lock();
            core.register_listener(port)?;
            SocketAddr::new(IpAddr::V6(core.addr), port)
        };
        shared.wake_driver();
        debug!(%local, "stack listener bound");
        Ok(Self {
            shared,
            port,
            local,
        })
    }

    /// Wait for the next handshaken connection.
    pub async fn accept(&mut self) -> io::Result<(StackStream, SocketAddr)> {
        let port = self.port;
        let shared = &self.shared;
        let (handle, peer) = poll_fn(|cx| shared.core.lock().poll_accept(port, cx)).await?;
        // The backlog shrank; let the driver re-arm it.
        shared.wake_driver();
        trace!(local = %self.local, %peer, "stack connection accepted");
        Ok((StackStream::new(Arc::clone(shared), handle, self.local, peer), peer))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Drop for StackListener {
    fn drop(&mut self) {
        self.shared.core.lock().unregister_listener(self.port);
        self.shared.wake_driver();
    }
}

// ---------------------------------------------------------------------------
// StackStream
// ---------------------------------------------------------------------------

/// Duplex byte stream over one stack TCP socket.
pub struct StackStream {
    shared: Arc<Shared>,
    handle: SocketHandle,
    local: SocketAddr,
    peer: SocketAddr,
}

impl StackStream {
    fn new(shared: Arc<Shared>, handle: SocketHandle, local: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            shared,
            handle,
            local,
            peer,
        }
    }

    pub(crate) async fn connect(shared: Arc<Shared>, remote: SocketAddr) -> io::Result<Self> {
        let (handle, local) = {
            let mut core = shared.core.lock();
            let handle = core.open(remote)?;
            let local = core
                .sockets
                .get::<tcp::Socket>(handle)
                .local_endpoint()
                .map(endpoint_addr)
                .unwrap_or_else(|| SocketAddr::new(IpAddr::V6(core.addr), 0));
            (handle, local)
        };
        shared.wake_driver();

        // Owning the handle from here on means a dropped connect releases it.
        let stream = Self::new(shared, handle, local, remote);
        poll_fn(|cx| stream.shared.core.lock().poll_established(stream.handle, cx)).await?;
        Ok(stream)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl AsyncRead for StackStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let filled = buf.filled().len();
        let result = self.shared.core.lock().poll_recv(self.handle, cx, buf);
        if buf.filled().len() > filled {
            // Freed receive window needs advertising.
            self.shared.wake_driver();
        }
        result
    }
}

impl AsyncWrite for StackStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let result = self.shared.core.lock().poll_send(self.handle, cx, data);
        if matches!(result, Poll::Ready(Ok(_))) {
            self.shared.wake_driver();
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        {
            let mut core = self.shared.core.lock();
            if !core.running {
                return Poll::Ready(Err(not_running()));
            }
            // FIN goes out after whatever is still buffered.
            core.sockets.get_mut::<tcp::Socket>(self.handle).close();
        }
        self.shared.wake_driver();
        Poll::Ready(Ok(()))
    }
}

impl Drop for StackStream {
    fn drop(&mut self) {
        self.shared.core.lock().release(self.handle);
        self.shared.wake_driver();
    }
}

impl std::fmt::Debug for StackStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackStream")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}
