//! Fixed harness constants and the value types built from them.
//!
//! Nothing here is read from disk or the environment: every scenario runs
//! with the compiled-in defaults, and tests override individual fields.

use std::net::{IpAddr, Ipv6Addr};

/// Text every server writes before closing; clients must read exactly this.
pub const PAYLOAD: &[u8] = b"Hello, world!";

/// Port both stack instances listen on, and the first host-mode port.
pub const PRIMARY_PORT: u16 = 1234;

/// Second host-mode listener port.
pub const SECONDARY_PORT: u16 = 4321;

/// Maximum frame size carried by the link, in bytes.
pub const LINK_MTU: usize = 1500;

/// Identifier of the single interface each stack instance owns.
pub const NIC_ID: u32 = 1;

/// Listening sockets kept armed per stack listener.
pub const LISTEN_BACKLOG: usize = 16;

/// Per-socket receive and transmit buffer size.
pub const SOCKET_BUFFER_SIZE: usize = 16 * 1024;

/// Address of the first stack instance (`fd00::1`).
pub const STACK_A_ADDR: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1);

/// Address of the second stack instance (`fd00::2`).
pub const STACK_B_ADDR: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2);

/// Base of the shared local test range.
pub const LOCAL_SUBNET: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0);

/// Prefix length of the route every stack installs.
pub const LOCAL_SUBNET_PREFIX: u8 = 8;

// ---------------------------------------------------------------------------
// StackConfig
// ---------------------------------------------------------------------------

/// Construction parameters for one stack instance.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Interface MTU.
    pub mtu: usize,
    /// Interface identifier.
    pub nic_id: u32,
    /// Network the installed route covers.
    pub subnet: Ipv6Addr,
    /// Prefix length of `subnet`.
    pub subnet_prefix: u8,
    /// Deliver frames addressed to the instance itself without touching the link.
    pub handle_local: bool,
    /// Listening sockets kept armed per listener.
    pub listen_backlog: usize,
    /// Receive/transmit buffer size of each TCP socket.
    pub socket_buffer_size: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            mtu: LINK_MTU,
            nic_id: NIC_ID,
            subnet: LOCAL_SUBNET,
            subnet_prefix: LOCAL_SUBNET_PREFIX,
            handle_local: true,
            listen_backlog: LISTEN_BACKLOG,
            socket_buffer_size: SOCKET_BUFFER_SIZE,
        }
    }
}

// ---------------------------------------------------------------------------
// HarnessConfig
// ---------------------------------------------------------------------------

/// Everything a scenario run needs.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub payload: &'static [u8],
    pub primary_port: u16,
    pub secondary_port: u16,
    /// Address host-mode servers bind and clients dial.
    pub host_ip: IpAddr,
    pub stack_a: Ipv6Addr,
    pub stack_b: Ipv6Addr,
    pub stack: StackConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            payload: PAYLOAD,
            primary_port: PRIMARY_PORT,
            secondary_port: SECONDARY_PORT,
            host_ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
            stack_a: STACK_A_ADDR,
            stack_b: STACK_B_ADDR,
            stack: StackConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_addresses_share_subnet() {
        let cfg = HarnessConfig::default();
        assert_eq!(cfg.stack_a.to_string(), "fd00::1");
        assert_eq!(cfg.stack_b.to_string(), "fd00::2");
        assert_eq!(cfg.stack_a.octets()[0], LOCAL_SUBNET.octets()[0]);
        assert_eq!(cfg.stack_b.octets()[0], LOCAL_SUBNET.octets()[0]);
    }

    #[test]
    fn test_default_ports_and_payload() {
        let cfg = HarnessConfig::default();
        assert_eq!(cfg.primary_port, 1234);
        assert_eq!(cfg.secondary_port, 4321);
        assert_eq!(cfg.payload, b"Hello, world!");
        assert_eq!(cfg.host_ip, IpAddr::V6(Ipv6Addr::LOCALHOST));
    }
}
