//! smoltcp PHY backed by in-memory frame queues.
//!
//! The driver task fills the receive queue from the link and drains the
//! transmit queue onto it; smoltcp only ever sees the queues.

use std::collections::VecDeque;

use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;

/// Queue-backed IP-medium device.
#[derive(Debug)]
pub struct FrameDevice {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
    mtu: usize,
}

impl FrameDevice {
    pub fn new(mtu: usize) -> Self {
        Self {
            rx: VecDeque::new(),
            tx: VecDeque::new(),
            mtu,
        }
    }

    /// Queue a frame for the interface to receive on its next poll.
    pub fn inject(&mut self, frame: Vec<u8>) {
        self.rx.push_back(frame);
    }

    /// Take every frame the interface transmitted since the last drain.
    pub fn drain_tx(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.tx.drain(..)
    }

    pub fn has_rx(&self) -> bool {
        !self.rx.is_empty()
    }
}

impl Device for FrameDevice {
    type RxToken<'a>
        = FrameRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = FrameTxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.pop_front()?;
        Some((FrameRxToken(frame), FrameTxToken(&mut self.tx)))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(FrameTxToken(&mut self.tx))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

pub struct FrameRxToken(Vec<u8>);

impl RxToken for FrameRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

pub struct FrameTxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl<'a> TxToken for FrameTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len];
        let result = f(&mut frame);
        self.0.push_back(frame);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_report_ip_medium_and_mtu() {
        let device = FrameDevice::new(1500);
        let caps = device.capabilities();
        assert_eq!(caps.medium, Medium::Ip);
        assert_eq!(caps.max_transmission_unit, 1500);
    }

    #[test]
    fn test_injected_frames_are_received_in_order() {
        let mut device = FrameDevice::new(1500);
        device.inject(vec![1]);
        device.inject(vec![2]);
        assert!(device.has_rx());

        let now = Instant::from_millis(0);
        let (rx, _) = device.receive(now).expect("first frame");
        assert_eq!(rx.consume(|buf| buf.to_vec()), vec![1]);
        let (rx, _) = device.receive(now).expect("second frame");
        assert_eq!(rx.consume(|buf| buf.to_vec()), vec![2]);
        assert!(device.receive(now).is_none());
    }

    #[test]
    fn test_transmitted_frames_are_drained() {
        let mut device = FrameDevice::new(1500);
        let now = Instant::from_millis(0);
        let tx = device.transmit(now).expect("tx token");
        tx.consume(4, |buf| buf.copy_from_slice(b"ping"));

        let frames: Vec<_> = device.drain_tx().collect();
        assert_eq!(frames, vec![b"ping".to_vec()]);
        assert_eq!(device.drain_tx().count(), 0);
    }
}
