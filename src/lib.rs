//! stackpair -- dual-mode TCP interoperability harness.
//!
//! Runs the same accept/write/close server and dial/read/verify client over
//! two backends: a pair of user-space smoltcp stacks joined by a socket-pair
//! link, and the host's native sockets. Diagnostics go to the log; runs only
//! report completion.

pub mod config;
pub mod harness;
pub mod source;
pub mod stack;

pub use config::{HarnessConfig, StackConfig, PAYLOAD};
pub use harness::{run_default_scenarios, run_host_mode, run_stack_mode};
pub use source::{BoxConnection, ConnectionSource, HostConnector, Listener, StackConnector};
pub use stack::{StackError, StackInstance};
