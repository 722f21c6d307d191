//! Server/client harness shared by both backends.

pub mod client;
pub mod latch;
pub mod orchestrator;
pub mod server;

pub use client::{run_session, spawn_clients, SessionError};
pub use latch::{CompletionLatch, LatchToken};
pub use orchestrator::{run_default_scenarios, run_host_mode, run_scenario, run_stack_mode};
pub use server::{serve, spawn_server};
