//! Payload server: accept, write the payload, close.
//!
//! `Listening -> (Accepting <-> per-connection {Writing -> Closing})`. Each
//! accepted connection is served on its own task; a failed write or close
//! only affects that connection. The loop ends when accept fails.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::source::{BoxConnection, ConnectionSource};

/// Listen on `port` and serve `payload` to every connection.
///
/// Once bound, the listener's address is sent on `ready`. If listening
/// fails, `ready` is dropped unsent and the function returns.
pub async fn serve(
    source: Arc<dyn ConnectionSource>,
    port: u16,
    payload: &'static [u8],
    ready: oneshot::Sender<SocketAddr>,
) {
    let backend = source.backend();
    let mut listener = match source.listen(port).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%backend, port, error = %e, "listen error");
            return;
        }
    };

    let local = listener.local_addr();
    debug!(%backend, %local, "server listening");
    // The orchestrator may have given up waiting; serving continues regardless.
    let _ = ready.send(local);

    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(%backend, %local, error = %e, "accept error");
                return;
            }
        };
        tokio::spawn(write_and_close(conn, peer, payload));
    }
}

async fn write_and_close(mut conn: BoxConnection, peer: SocketAddr, payload: &'static [u8]) {
    if let Err(e) = conn.write_all(payload).await {
        warn!(%peer, error = %e, "write error");
    }
    if let Err(e) = conn.shutdown().await {
        warn!(%peer, error = %e, "close error");
    }
}

/// Spawn [`serve`] and hand back its task and readiness receiver.
pub fn spawn_server(
    source: Arc<dyn ConnectionSource>,
    port: u16,
    payload: &'static [u8],
) -> (JoinHandle<()>, oneshot::Receiver<SocketAddr>) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let handle = tokio::spawn(serve(source, port, payload, ready_tx));
    (handle, ready_rx)
}
