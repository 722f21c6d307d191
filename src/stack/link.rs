//! Emulated point-to-point link between two stack instances.
//!
//! Each half of a kernel Unix datagram socket pair carries whole IP frames,
//! one frame per datagram, so no extra framing is needed on the wire.

use std::io;
use std::os::unix::net::UnixDatagram as StdUnixDatagram;

use tokio::net::UnixDatagram;

/// One end of a frame link. Consumed by exactly one [`super::StackInstance`].
#[derive(Debug)]
pub struct LinkEndpoint {
    socket: UnixDatagram,
}

impl LinkEndpoint {
    /// Allocate a connected pair of link endpoints.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixDatagram::pair()?;
        Ok((Self { socket: a }, Self { socket: b }))
    }

    /// Wrap an already connected standard-library datagram socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_std(socket: StdUnixDatagram) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: UnixDatagram::from_std(socket)?,
        })
    }

    /// Receive one frame into `buf`, returning its length.
    pub async fn recv_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }

    /// Send one frame. Cancel safe: a frame is either sent whole or not at all.
    pub async fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        let sent = self.socket.send(frame).await?;
        if sent != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short frame write: {sent} of {} bytes", frame.len()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_carries_whole_frames() {
        let (a, b) = LinkEndpoint::pair().expect("pair");

        a.send_frame(&[1, 2, 3]).await.expect("send");
        a.send_frame(&[4; 1500]).await.expect("send");

        let mut buf = [0u8; 2048];
        let n = b.recv_frame(&mut buf).await.expect("recv");
        assert_eq!(&buf[..n], &[1, 2, 3]);
        let n = b.recv_frame(&mut buf).await.expect("recv");
        assert_eq!(n, 1500);
    }

    #[tokio::test]
    async fn test_from_std_wraps_socket_pair() {
        let (a, b) = StdUnixDatagram::pair().expect("std pair");
        let a = LinkEndpoint::from_std(a).expect("wrap a");
        let b = LinkEndpoint::from_std(b).expect("wrap b");

        b.send_frame(b"frame").await.expect("send");
        let mut buf = [0u8; 64];
        let n = a.recv_frame(&mut buf).await.expect("recv");
        assert_eq!(&buf[..n], b"frame");
    }
}
