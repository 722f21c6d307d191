//! Scenario orchestration.
//!
//! A run starts two servers, waits until both report that they are bound,
//! fans out client sessions in both directions, and blocks on a completion
//! latch sized to every session it spawned. Outcomes are never collected
//! here; each session logs its own.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use super::client::spawn_clients;
use super::latch::CompletionLatch;
use super::server::spawn_server;
use crate::config::HarnessConfig;
use crate::source::{Backend, ConnectionSource, HostConnector, StackConnector};
use crate::stack::link::LinkEndpoint;
use crate::stack::StackInstance;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{backend} listener on port {port} never became ready")]
    ListenerUnavailable { backend: String, port: u16 },
}

/// A spawned server that has not reported its bound address yet.
struct PendingServer {
    backend: Backend,
    port: u16,
    task: JoinHandle<()>,
    ready: oneshot::Receiver<SocketAddr>,
}

impl PendingServer {
    fn start(source: &Arc<dyn ConnectionSource>, port: u16, payload: &'static [u8]) -> Self {
        let (task, ready) = spawn_server(Arc::clone(source), port, payload);
        Self {
            backend: source.backend(),
            port,
            task,
            ready,
        }
    }
}

/// Wait until every server is bound, in order.
///
/// If any of them never becomes ready, all of them are aborted so no server
/// outlives the failed run.
async fn await_ready(servers: Vec<PendingServer>) -> Result<Vec<SocketAddr>, OrchestratorError> {
    let tasks: Vec<AbortHandle> = servers.iter().map(|s| s.task.abort_handle()).collect();
    let mut bound = Vec::with_capacity(servers.len());
    for server in servers {
        match server.ready.await {
            Ok(addr) => bound.push(addr),
            Err(_) => {
                for task in &tasks {
                    task.abort();
                }
                return Err(OrchestratorError::ListenerUnavailable {
                    backend: server.backend.to_string(),
                    port: server.port,
                });
            }
        }
    }
    Ok(bound)
}

/// Two stack instances on one link, each serving and dialing the other.
pub async fn run_stack_mode(config: &HarnessConfig, n_conns: usize) -> Result<()> {
    let (link_a, link_b) = LinkEndpoint::pair().context("failed to allocate link pair")?;

    let stack_a = StackInstance::new(link_a, config.stack_a, &config.stack)
        .with_context(|| format!("failed to build stack {}", config.stack_a))?;
    let stack_b = StackInstance::new(link_b, config.stack_b, &config.stack)
        .with_context(|| format!("failed to build stack {}", config.stack_b))?;

    let source_a: Arc<dyn ConnectionSource> = Arc::new(StackConnector::ipv6(stack_a));
    let source_b: Arc<dyn ConnectionSource> = Arc::new(StackConnector::ipv6(stack_b));

    let port = config.primary_port;
    let bound = await_ready(vec![
        PendingServer::start(&source_a, port, config.payload),
        PendingServer::start(&source_b, port, config.payload),
    ])
    .await?;
    let (addr_a, addr_b) = (bound[0], bound[1]);

    let latch = CompletionLatch::new(2 * n_conns);
    spawn_clients(source_a, addr_b, n_conns, config.payload, &latch);
    spawn_clients(source_b, addr_a, n_conns, config.payload, &latch);
    latch.wait().await;
    Ok(())
}

/// Native sockets on the host: two servers on two ports.
pub async fn run_host_mode(config: &HarnessConfig, n_conns: usize) -> Result<()> {
    let source: Arc<dyn ConnectionSource> = Arc::new(HostConnector::new(config.host_ip));

    let servers = [config.primary_port, config.secondary_port]
        .into_iter()
        .map(|port| PendingServer::start(&source, port, config.payload))
        .collect();
    let targets = await_ready(servers).await?;

    let latch = CompletionLatch::new(targets.len() * n_conns);
    for target in targets {
        spawn_clients(Arc::clone(&source), target, n_conns, config.payload, &latch);
    }
    latch.wait().await;
    Ok(())
}

/// Run one named scenario, logging its start, any error, and its finish.
pub async fn run_scenario<F>(name: &str, scenario: F)
where
    F: Future<Output = Result<()>>,
{
    let run_id = Uuid::new_v4().to_string();
    let span = info_span!("scenario", scenario = name, run_id = run_id.as_str());
    async {
        info!("Starting {name}");
        if let Err(e) = scenario.await {
            error!("Error: {e:#}");
        }
        info!("Finished {name}");
    }
    .instrument(span)
    .await
}

/// The fixed scenario sequence the binary runs.
pub async fn run_default_scenarios(config: &HarnessConfig) {
    run_scenario("host-mode 100", run_host_mode(config, 100)).await;
    run_scenario("stack-mode 10", run_stack_mode(config, 10)).await;
    run_scenario("stack-mode 100", run_stack_mode(config, 100)).await;
}
