//! Per-instance driver task.
//!
//! One iteration: poll the interface, service listener backlogs, reclaim
//! closed sockets, collect egress frames, then wait for whichever comes
//! first of an inbound frame, room to send the next outbound frame, a socket
//! operation, or the interface's next timer. Sending and receiving are raced
//! so two drivers sharing a link never block each other on full buffers.

use std::collections::VecDeque;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;

use smoltcp::time::Instant;
use smoltcp::wire::Ipv6Packet;
use tracing::{debug, warn};

use super::link::LinkEndpoint;
use super::{Shared, StackCore};

/// Result of one poll of the stack core.
pub(crate) struct PollOutcome {
    /// Frames to put on the link, in transmit order.
    pub(crate) egress: Vec<Vec<u8>>,
    /// How long the interface can sleep; `None` means until new input.
    pub(crate) delay: Option<Duration>,
}

/// Destination of an IPv6 frame, or `None` for anything else.
fn ipv6_destination(frame: &[u8]) -> Option<Ipv6Addr> {
    if frame.first().map(|b| b >> 4) != Some(6) {
        return None;
    }
    Ipv6Packet::new_checked(frame).ok().map(|packet| packet.dst_addr())
}

impl StackCore {
    /// Queue one frame received from the link.
    pub(crate) fn ingest(&mut self, frame: Vec<u8>) {
        self.device.inject(frame);
    }

    pub(crate) fn poll(&mut self) -> PollOutcome {
        let now = Instant::now();
        self.iface.poll(now, &mut self.device, &mut self.sockets);
        self.service_listeners();
        self.reclaim_closed();

        let frames: Vec<Vec<u8>> = self.device.drain_tx().collect();
        let mut egress = Vec::with_capacity(frames.len());
        for frame in frames {
            if self.config.handle_local && ipv6_destination(&frame) == Some(self.addr) {
                self.device.inject(frame);
            } else {
                egress.push(frame);
            }
        }

        let delay = if self.device.has_rx() {
            Some(Duration::ZERO)
        } else {
            self.iface
                .poll_delay(now, &self.sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
        };
        PollOutcome { egress, delay }
    }
}

async fn idle(delay: Option<Duration>) {
    match delay {
        Some(d) if d.is_zero() => tokio::task::yield_now().await,
        Some(d) => tokio::time::sleep(d).await,
        None => futures::future::pending::<()>().await,
    }
}

/// Drive `shared` over `link` until the link fails.
pub(crate) async fn run(shared: Arc<Shared>, link: LinkEndpoint, mtu: usize) {
    let mut outbox: VecDeque<Vec<u8>> = VecDeque::new();
    let mut buf = vec![0u8; mtu];

    loop {
        let PollOutcome { egress, delay } = shared.core.lock().poll();
        outbox.extend(egress);

        tokio::select! {
            received = link.recv_frame(&mut buf) => match received {
                Ok(0) => {
                    debug!("link closed by peer");
                    break;
                }
                Ok(n) => {
                    shared.core.lock().ingest(buf[..n].to_vec());
                }
                Err(e) => {
                    warn!(error = %e, "link receive failed");
                    break;
                }
            },
            sent = link.send_frame(outbox.front().map(Vec::as_slice).unwrap_or_default()), if !outbox.is_empty() => match sent {
                Ok(()) => {
                    outbox.pop_front();
                }
                Err(e) => {
                    warn!(error = %e, "link send failed");
                    break;
                }
            },
            _ = shared.notify.notified() => {}
            _ = idle(delay) => {}
        }
    }

    shared.core.lock().shut_down();
    debug!("stack driver stopped");
}
