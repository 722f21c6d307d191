//! End-to-end runs over two user-space stacks joined by a socket-pair link.

use std::io::ErrorKind;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use stackpair::config::{HarnessConfig, StackConfig, PAYLOAD};
use stackpair::harness::{run_session, spawn_server, SessionError};
use stackpair::source::{ConnectionSource, SourceError, StackConnector};
use stackpair::stack::link::LinkEndpoint;
use stackpair::stack::StackInstance;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinSet;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

const RUN_LIMIT: Duration = Duration::from_secs(60);

struct Pair {
    a: Arc<dyn ConnectionSource>,
    b: Arc<dyn ConnectionSource>,
}

fn build_pair(addr_a: &str, addr_b: &str) -> Pair {
    build_pair_with(addr_a, addr_b, &StackConfig::default())
}

fn build_pair_with(addr_a: &str, addr_b: &str, config: &StackConfig) -> Pair {
    let (link_a, link_b) = LinkEndpoint::pair().expect("link pair");
    let a: Ipv6Addr = addr_a.parse().unwrap();
    let b: Ipv6Addr = addr_b.parse().unwrap();
    let stack_a = StackInstance::new(link_a, a, config).expect("stack a");
    let stack_b = StackInstance::new(link_b, b, config).expect("stack b");
    Pair {
        a: Arc::new(StackConnector::ipv6(stack_a)),
        b: Arc::new(StackConnector::ipv6(stack_b)),
    }
}

async fn serve_ready(source: &Arc<dyn ConnectionSource>, port: u16) -> SocketAddr {
    let (_server, ready) = spawn_server(Arc::clone(source), port, PAYLOAD);
    ready.await.expect("server should become ready")
}

/// Run `n` sessions from `source` to `target` and return every outcome.
async fn sessions(
    source: &Arc<dyn ConnectionSource>,
    target: SocketAddr,
    n: usize,
) -> Vec<Result<(), SessionError>> {
    let mut set = JoinSet::new();
    for _ in 0..n {
        let source = Arc::clone(source);
        set.spawn(async move { run_session(source.as_ref(), target, PAYLOAD).await });
    }
    let mut outcomes = Vec::with_capacity(n);
    while let Some(joined) = set.join_next().await {
        outcomes.push(joined.expect("session task"));
    }
    outcomes
}

fn assert_all_ok(outcomes: &[Result<(), SessionError>]) {
    let failed: Vec<String> = outcomes
        .iter()
        .filter_map(|outcome| outcome.as_ref().err().map(ToString::to_string))
        .collect();
    assert!(
        failed.is_empty(),
        "{} of {} sessions failed, first: {}",
        failed.len(),
        outcomes.len(),
        failed[0]
    );
}

/// Counts warn and error events, which is where sessions report failures.
#[derive(Clone, Default)]
struct FailureCounter(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for FailureCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() <= Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ten_sessions_each_direction_read_exact_payload() {
    let pair = build_pair("fd00::1", "fd00::2");
    let addr_a = serve_ready(&pair.a, 1234).await;
    let addr_b = serve_ready(&pair.b, 1234).await;
    assert_eq!(addr_a, "[fd00::1]:1234".parse().unwrap());
    assert_eq!(addr_b, "[fd00::2]:1234".parse().unwrap());

    let (a_to_b, b_to_a) = tokio::time::timeout(RUN_LIMIT, async {
        tokio::join!(sessions(&pair.a, addr_b, 10), sessions(&pair.b, addr_a, 10))
    })
    .await
    .expect("sessions should finish");

    assert_eq!(a_to_b.len() + b_to_a.len(), 20);
    assert_all_ok(&a_to_b);
    assert_all_ok(&b_to_a);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hundred_concurrent_sessions_each_direction() {
    let pair = build_pair("fd00::1", "fd00::2");
    let addr_a = serve_ready(&pair.a, 1234).await;
    let addr_b = serve_ready(&pair.b, 1234).await;

    let (a_to_b, b_to_a) = tokio::time::timeout(RUN_LIMIT, async {
        tokio::join!(sessions(&pair.a, addr_b, 100), sessions(&pair.b, addr_a, 100))
    })
    .await
    .expect("sessions should finish");

    assert_all_ok(&a_to_b);
    assert_all_ok(&b_to_a);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dials_beyond_backlog_are_accepted() {
    let config = StackConfig {
        listen_backlog: 4,
        ..StackConfig::default()
    };
    let pair = build_pair_with("fd00::1", "fd00::2", &config);
    let addr_b = serve_ready(&pair.b, 1234).await;

    for n in [config.listen_backlog + 1, 8 * config.listen_backlog] {
        let outcomes = tokio::time::timeout(RUN_LIMIT, sessions(&pair.a, addr_b, n))
            .await
            .expect("sessions should finish");
        assert_eq!(outcomes.len(), n);
        assert_all_ok(&outcomes);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hundred_dials_into_default_backlog() {
    let pair = build_pair("fd00::1", "fd00::2");
    let addr_b = serve_ready(&pair.b, 1234).await;

    let outcomes = tokio::time::timeout(RUN_LIMIT, sessions(&pair.a, addr_b, 100))
        .await
        .expect("sessions should finish");
    assert_all_ok(&outcomes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_any_addresses_in_shared_subnet_route_to_each_other() {
    let pair = build_pair("fd12:3456::a", "fdff::b");
    let addr_b = serve_ready(&pair.b, 8080).await;

    let outcomes = tokio::time::timeout(RUN_LIMIT, sessions(&pair.a, addr_b, 3))
        .await
        .expect("sessions should finish");
    assert_all_ok(&outcomes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_runs_yield_same_payload() {
    let pair = build_pair("fd00::1", "fd00::2");
    let addr_b = serve_ready(&pair.b, 1234).await;

    for _ in 0..3 {
        let outcomes = tokio::time::timeout(RUN_LIMIT, sessions(&pair.a, addr_b, 20))
            .await
            .expect("sessions should finish");
        assert_all_ok(&outcomes);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dial_without_listener_is_refused() {
    let pair = build_pair("fd00::1", "fd00::2");
    let target: SocketAddr = "[fd00::2]:4999".parse().unwrap();

    let err = tokio::time::timeout(RUN_LIMIT, run_session(pair.a.as_ref(), target, PAYLOAD))
        .await
        .expect("refusal should be prompt")
        .expect_err("nothing listens on 4999");
    match err {
        SessionError::Dial(SourceError::Dial { source, .. }) => {
            assert_eq!(source.kind(), ErrorKind::ConnectionRefused);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handle_local_reaches_own_address() {
    let (link, _peer) = LinkEndpoint::pair().expect("link pair");
    let stack = StackInstance::new(link, "fd00::1".parse().unwrap(), &StackConfig::default())
        .expect("stack");
    let source: Arc<dyn ConnectionSource> = Arc::new(StackConnector::ipv6(stack));
    let addr = serve_ready(&source, 1234).await;

    let outcomes = tokio::time::timeout(RUN_LIMIT, sessions(&source, addr, 5))
        .await
        .expect("local sessions should finish");
    assert_all_ok(&outcomes);
}

// Current-thread flavor: every spawned task runs on this thread and so sees
// the thread-local subscriber.
#[tokio::test]
async fn test_stack_mode_hundred_sessions_report_no_failures() {
    let failures = FailureCounter::default();
    let _subscriber =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(failures.clone()));

    let config = HarnessConfig::default();
    tokio::time::timeout(RUN_LIMIT, stackpair::run_stack_mode(&config, 100))
        .await
        .expect("stack mode should not deadlock")
        .expect("stack mode should succeed");

    assert_eq!(failures.0.load(Ordering::SeqCst), 0, "sessions logged failures");
}

#[tokio::test]
async fn test_stack_mode_with_zero_sessions() {
    let config = HarnessConfig::default();
    tokio::time::timeout(Duration::from_secs(5), stackpair::run_stack_mode(&config, 0))
        .await
        .expect("empty run must not block")
        .expect("empty run succeeds");
}

#[tokio::test]
async fn test_stack_mode_rejects_address_outside_subnet() {
    let config = HarnessConfig {
        stack_b: "2001:db8::2".parse().unwrap(),
        ..HarnessConfig::default()
    };
    let err = stackpair::run_stack_mode(&config, 1)
        .await
        .expect_err("construction must fail");
    assert!(err.downcast_ref::<stackpair::StackError>().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stack_stream_reports_both_endpoints() {
    let (link_a, link_b) = LinkEndpoint::pair().expect("link pair");
    let config = StackConfig::default();
    let a = StackInstance::new(link_a, "fd00::1".parse().unwrap(), &config).expect("stack a");
    let b = StackInstance::new(link_b, "fd00::2".parse().unwrap(), &config).expect("stack b");

    let mut listener = b.listen(1234).expect("listen");
    let target: SocketAddr = "[fd00::2]:1234".parse().unwrap();
    let (dialed, accepted) = tokio::time::timeout(RUN_LIMIT, async {
        tokio::join!(a.connect(target), listener.accept())
    })
    .await
    .expect("handshake should finish");
    let dialed = dialed.expect("dial");
    let (accepted, peer) = accepted.expect("accept");

    assert_eq!(dialed.peer_addr(), target);
    assert_eq!(dialed.local_addr().ip(), "fd00::1".parse::<std::net::IpAddr>().unwrap());
    assert!(dialed.local_addr().port() >= 49152);
    assert_eq!(accepted.local_addr(), target);
    assert_eq!(accepted.peer_addr(), dialed.local_addr());
    assert_eq!(peer, dialed.local_addr());
}
