//! Isolated user-space TCP/IP stack instances.
//!
//! A [`StackInstance`] wraps one smoltcp [`Interface`] attached to a single
//! [`LinkEndpoint`]. Construction performs, in order: interface attachment,
//! address assignment, route installation. A background driver task then
//! moves frames between the link and the interface for the rest of the
//! process lifetime.

pub mod device;
pub mod driver;
pub mod link;
pub mod tcp;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::task::Waker;

use parking_lot::Mutex;
use smoltcp::iface::{Config as IfaceConfig, Interface, Route, SocketHandle, SocketSet};
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::info;

use crate::config::StackConfig;
use device::FrameDevice;
use link::LinkEndpoint;

pub use tcp::{StackListener, StackStream};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StackError {
    #[error("stack instances must be built inside a tokio runtime")]
    NoRuntime,

    #[error("invalid route prefix length /{prefix}")]
    InvalidSubnet { prefix: u8 },

    #[error("address {addr} is outside the routed subnet {subnet}/{prefix}")]
    OutsideSubnet {
        addr: Ipv6Addr,
        subnet: Ipv6Addr,
        prefix: u8,
    },

    #[error("failed to assign address {addr}/128 to interface {nic}")]
    AddressAssign { addr: Ipv6Addr, nic: NicId },

    #[error("failed to install route {subnet}/{prefix} on interface {nic}")]
    RouteInstall {
        subnet: Ipv6Addr,
        prefix: u8,
        nic: NicId,
    },
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Network interface identifier. Each instance owns exactly one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NicId(pub u32);

impl fmt::Display for NicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nic{}", self.0)
    }
}

/// Network-layer protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "ipv4"),
            Family::V6 => write!(f, "ipv6"),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared between the driver task, listeners and streams.
pub(crate) struct Shared {
    pub(crate) core: Mutex<StackCore>,
    /// Wakes the driver after a socket operation queued egress work.
    pub(crate) notify: Notify,
}

impl Shared {
    pub(crate) fn wake_driver(&self) {
        self.notify.notify_one();
    }
}

/// Accept queue of one listening port.
#[derive(Default)]
pub(crate) struct ListenQueue {
    /// Sockets in `Listen` or `SynReceived`.
    pub(crate) armed: Vec<SocketHandle>,
    /// Sockets that completed the handshake, oldest first.
    pub(crate) ready: VecDeque<SocketHandle>,
    pub(crate) waker: Option<Waker>,
}

pub(crate) struct StackCore {
    pub(crate) iface: Interface,
    pub(crate) device: FrameDevice,
    pub(crate) sockets: SocketSet<'static>,
    pub(crate) addr: Ipv6Addr,
    pub(crate) config: StackConfig,
    pub(crate) listeners: HashMap<u16, ListenQueue>,
    /// Released sockets waiting to reach `Closed` before removal.
    pub(crate) closing: Vec<SocketHandle>,
    pub(crate) next_port: u16,
    /// Cleared once the driver stops; every pending operation then fails.
    pub(crate) running: bool,
}

// ---------------------------------------------------------------------------
// StackInstance
// ---------------------------------------------------------------------------

/// Handle to one isolated stack. Clones share the same instance.
#[derive(Clone)]
pub struct StackInstance {
    shared: Arc<Shared>,
    addr: Ipv6Addr,
    nic: NicId,
    subnet: (Ipv6Addr, u8),
    mtu: usize,
}

impl StackInstance {
    /// Build a stack on `link` with `addr` as its only address and start its driver.
    pub fn new(link: LinkEndpoint, addr: Ipv6Addr, config: &StackConfig) -> Result<Self, StackError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| StackError::NoRuntime)?;

        let nic = NicId(config.nic_id);
        let (subnet, prefix) = (config.subnet, config.subnet_prefix);
        if prefix == 0 || prefix > 128 {
            return Err(StackError::InvalidSubnet { prefix });
        }
        if !in_subnet(addr, subnet, prefix) {
            return Err(StackError::OutsideSubnet {
                addr,
                subnet,
                prefix,
            });
        }

        // 1. Interface attachment.
        let mut device = FrameDevice::new(config.mtu);
        let mut iface_config = IfaceConfig::new(HardwareAddress::Ip);
        iface_config.random_seed = rand::random();
        let mut iface = Interface::new(iface_config, &mut device, Instant::now());

        // 2. Address assignment.
        let mut assigned = false;
        iface.update_ip_addrs(|addrs| {
            assigned = addrs.push(IpCidr::new(IpAddress::Ipv6(addr), 128)).is_ok();
        });
        if !assigned {
            return Err(StackError::AddressAssign { addr, nic });
        }

        // 3. Route installation.
        let route = Route {
            cidr: IpCidr::new(IpAddress::Ipv6(subnet), prefix),
            via_router: IpAddress::Ipv6(addr),
            preferred_until: None,
            expires_at: None,
        };
        let mut installed = false;
        iface.routes_mut().update(|table| {
            installed = table.push(route).is_ok();
        });
        if !installed {
            return Err(StackError::RouteInstall {
                subnet,
                prefix,
                nic,
            });
        }

        let core = StackCore {
            iface,
            device,
            sockets: SocketSet::new(vec![]),
            addr,
            config: config.clone(),
            listeners: HashMap::new(),
            closing: Vec::new(),
            next_port: tcp::EPHEMERAL_PORTS.start() + rand::random::<u16>() % tcp::EPHEMERAL_SPAN,
            running: true,
        };
        let shared = Arc::new(Shared {
            core: Mutex::new(core),
            notify: Notify::new(),
        });

        runtime.spawn(driver::run(Arc::clone(&shared), link, config.mtu));

        info!(
            %nic,
            %addr,
            route = %format!("{subnet}/{prefix}"),
            mtu = config.mtu,
            handle_local = config.handle_local,
            "stack instance ready"
        );

        Ok(Self {
            shared,
            addr,
            nic,
            subnet: (subnet, prefix),
            mtu: config.mtu,
        })
    }

    pub fn address(&self) -> Ipv6Addr {
        self.addr
    }

    pub fn nic_id(&self) -> NicId {
        self.nic
    }

    /// Network and prefix length of the installed route.
    pub fn subnet(&self) -> (Ipv6Addr, u8) {
        self.subnet
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Whether the driver task is still moving frames.
    pub fn is_running(&self) -> bool {
        self.shared.core.lock().running
    }

    /// Start accepting TCP connections on `port` at this instance's address.
    pub fn listen(&self, port: u16) -> std::io::Result<StackListener> {
        StackListener::bind(Arc::clone(&self.shared), port)
    }

    /// Open a TCP connection to `remote`, resolving once established.
    pub async fn connect(&self, remote: SocketAddr) -> std::io::Result<StackStream> {
        StackStream::connect(Arc::clone(&self.shared), remote).await
    }
}

impl fmt::Debug for StackInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackInstance")
            .field("addr", &self.addr)
            .field("nic", &self.nic)
            .field("subnet", &self.subnet)
            .finish()
    }
}

/// Whether `addr` lies inside `subnet/prefix`.
pub fn in_subnet(addr: Ipv6Addr, subnet: Ipv6Addr, prefix: u8) -> bool {
    let prefix = u32::from(prefix.min(128));
    let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
    u128::from(addr) & mask == u128::from(subnet) & mask
}

pub(crate) fn to_ip_address(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => IpAddress::Ipv4(v4),
        IpAddr::V6(v6) => IpAddress::Ipv6(v6),
    }
}

pub(crate) fn to_std_ip(ip: IpAddress) -> IpAddr {
    match ip {
        IpAddress::Ipv4(v4) => IpAddr::V4(v4),
        IpAddress::Ipv6(v6) => IpAddr::V6(v6),
    }
}
