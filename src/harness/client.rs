//! Client driver: dial, read to end-of-stream, close, verify.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::latch::CompletionLatch;
use crate::source::{ConnectionSource, SourceError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("dial error: {0}")]
    Dial(#[source] SourceError),

    #[error("read error: {0}")]
    Read(#[source] std::io::Error),

    #[error("close error: {0}")]
    Close(#[source] std::io::Error),

    #[error("incorrect data received: expected {expected:?} but got {received:?}")]
    Mismatch { expected: String, received: String },
}

/// Run one session against `target`.
pub async fn run_session(
    source: &dyn ConnectionSource,
    target: SocketAddr,
    expected: &[u8],
) -> Result<(), SessionError> {
    let mut conn = source.dial(target).await.map_err(SessionError::Dial)?;

    let mut received = Vec::with_capacity(expected.len());
    conn.read_to_end(&mut received)
        .await
        .map_err(SessionError::Read)?;
    conn.shutdown().await.map_err(SessionError::Close)?;

    if received != expected {
        return Err(SessionError::Mismatch {
            expected: String::from_utf8_lossy(expected).into_owned(),
            received: String::from_utf8_lossy(&received).into_owned(),
        });
    }
    Ok(())
}

/// Spawn `n_conns` independent sessions against `target`.
///
/// Each session takes a latch token before it starts, so the latch counts
/// down once per session whatever the outcome.
pub fn spawn_clients(
    source: Arc<dyn ConnectionSource>,
    target: SocketAddr,
    n_conns: usize,
    expected: &'static [u8],
    latch: &CompletionLatch,
) -> Vec<JoinHandle<()>> {
    (0..n_conns)
        .map(|session| {
            let source = Arc::clone(&source);
            let token = latch.token();
            tokio::spawn(async move {
                let _token = token;
                match run_session(source.as_ref(), target, expected).await {
                    Ok(()) => debug!(session, %target, "session ok"),
                    Err(e @ SessionError::Mismatch { .. }) => error!(session, %target, "{e}"),
                    Err(e) => warn!(session, %target, backend = %source.backend(), "{e}"),
                }
            })
        })
        .collect()
}
