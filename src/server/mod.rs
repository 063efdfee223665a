//! Server orchestrator.
//!
//! This module provides:
//! - The [`Server`] builder surface: router, middleware, hooks, typed error
//!   handlers, metrics registry
//! - The accept loop and worker handoff
//! - Backpressure with a hysteretic overload flag
//! - Graceful shutdown with a drain phase and a force deadline
//!
//! One accept loop runs on the caller's runtime and feeds N worker event
//! loops, each a dedicated thread with its own single-threaded runtime.
//! A connection belongs to exactly one worker for its whole life.

pub(crate) mod conn;
pub(crate) mod worker;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, OverloadBehavior, ServerConfig};
use crate::error::ErrorHandlers;
use crate::hooks::Hooks;
use crate::http::{reason_phrase, ResponseBuilder};
use crate::metrics::{Counter, Gauge, Histogram, MetricsRegistry, Timer};
use crate::middleware::MiddlewareChain;
use crate::pool::Buffer;
use crate::router::Router;

/// Errors surfaced by [`Server::run`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Runtime counters
// ============================================================================

/// Typed runtime counters, resolved once against the metrics registry.
#[derive(Clone)]
pub struct ServerStats {
    pub connections: Arc<Counter>,
    pub requests: Arc<Counter>,
    pub errors: Arc<Counter>,
    pub protocol_errors: Arc<Counter>,
    pub timeouts: Arc<Counter>,
    pub rejected_headers_too_large: Arc<Counter>,
    pub rejected_body_too_large: Arc<Counter>,
    pub rejected_overload: Arc<Counter>,
    pub rejected_in_flight: Arc<Counter>,
    pub rejected_during_shutdown: Arc<Counter>,
    pub rejected_queue_full: Arc<Counter>,
    pub overload_transitions: Arc<Counter>,
    pub forced_closes: Arc<Counter>,
    pub active_connections: Arc<Gauge>,
    pub in_flight_requests: Arc<Gauge>,
    pub request_duration: Arc<Timer>,
    pub response_bytes: Arc<Histogram>,
}

impl ServerStats {
    fn new(registry: &MetricsRegistry) -> ServerStats {
        ServerStats {
            connections: registry.counter("connections_total"),
            requests: registry.counter("requests_total"),
            errors: registry.counter("errors_total"),
            protocol_errors: registry.counter("protocol_errors_total"),
            timeouts: registry.counter("timeouts_total"),
            rejected_headers_too_large: registry.counter("rejected_headers_too_large_total"),
            rejected_body_too_large: registry.counter("rejected_body_too_large_total"),
            rejected_overload: registry.counter("rejected_overload_total"),
            rejected_in_flight: registry.counter("rejected_in_flight_total"),
            rejected_during_shutdown: registry.counter("rejected_during_shutdown_total"),
            rejected_queue_full: registry.counter("rejected_queue_full_total"),
            overload_transitions: registry.counter("overload_transitions_total"),
            forced_closes: registry.counter("forced_closes_total"),
            active_connections: registry.gauge("active_connections"),
            in_flight_requests: registry.gauge("in_flight_requests"),
            request_duration: registry.timer("request_duration_seconds"),
            response_bytes: registry.histogram("response_bytes"),
        }
    }
}

/// Cross-worker runtime state: atomics and shutdown tokens.
pub(crate) struct RuntimeState {
    pub shutting_down: AtomicBool,
    pub active_connections: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub overloaded: AtomicBool,
    /// Cancelled when graceful shutdown begins.
    pub shutdown: CancellationToken,
    /// Cancelled when the shutdown grace period expires.
    pub force: CancellationToken,
    /// Cancelled once the listener is armed and `local_addr` is set.
    ready: CancellationToken,
    /// Cancelled when `run()` has fully stopped.
    stopped: CancellationToken,
    bound_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl RuntimeState {
    fn new() -> RuntimeState {
        RuntimeState {
            shutting_down: AtomicBool::new(false),
            active_connections: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            overloaded: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            force: CancellationToken::new(),
            ready: CancellationToken::new(),
            stopped: CancellationToken::new(),
            bound_addr: parking_lot::Mutex::new(None),
        }
    }
}

/// Immutable server internals shared by the accept loop and every worker.
/// Registries are frozen once `run()` starts; the hot path reads them
/// without locks.
pub(crate) struct ServerCore {
    pub config: ServerConfig,
    pub router: Router,
    pub middleware: MiddlewareChain,
    pub hooks: Hooks,
    pub error_handlers: ErrorHandlers,
    pub metrics: Arc<MetricsRegistry>,
    pub stats: ServerStats,
    pub state: Arc<RuntimeState>,
}

// ============================================================================
// Server
// ============================================================================

/// The embedded HTTP/1.1 server.
///
/// Register routes, middleware, hooks, and error handlers, then call
/// [`Server::run`]. Registration after `run()` is impossible by
/// construction: `run` consumes the server and freezes every registry.
pub struct Server {
    config: ServerConfig,
    router: Router,
    middleware: MiddlewareChain,
    hooks: Hooks,
    error_handlers: ErrorHandlers,
    metrics: Arc<MetricsRegistry>,
    state: Arc<RuntimeState>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        Server {
            config,
            router: Router::new(),
            middleware: MiddlewareChain::new(),
            hooks: Hooks::new(),
            error_handlers: ErrorHandlers::new(),
            metrics: Arc::new(MetricsRegistry::new()),
            state: Arc::new(RuntimeState::new()),
        }
    }

    /// Use a shared metrics registry instead of a private one.
    pub fn with_metrics(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.metrics = registry;
        self
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn middleware_mut(&mut self) -> &mut MiddlewareChain {
        &mut self.middleware
    }

    pub fn hooks_mut(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    pub fn error_handlers_mut(&mut self) -> &mut ErrorHandlers {
        &mut self.error_handlers
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Cloneable control handle, valid before and after `run()` starts.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: self.state.clone(),
            stats: ServerStats::new(&self.metrics),
            metrics: self.metrics.clone(),
        }
    }

    /// Bind, serve, and block until graceful shutdown completes.
    pub async fn run(self) -> Result<(), ServerError> {
        self.config.validate()?;
        let stats = ServerStats::new(&self.metrics);
        let state = self.state.clone();
        let core = Arc::new(ServerCore {
            stats,
            state: state.clone(),
            config: self.config,
            router: self.router,
            middleware: self.middleware,
            hooks: self.hooks,
            error_handlers: self.error_handlers,
            metrics: self.metrics,
        });

        // onStart fires before the listening socket is armed.
        core.hooks.run_start();

        let listener = build_listener(&core.config)?;
        let local_addr = listener.local_addr()?;
        *state.bound_addr.lock() = Some(local_addr);
        tracing::info!(%local_addr, workers = core.config.effective_workers(), "listening");
        state.ready.cancel();

        let result = serve(core.clone(), listener).await;
        state.stopped.cancel();
        result
    }
}

// ============================================================================
// Control handle
// ============================================================================

/// Cloneable handle for observing and stopping a running server.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<RuntimeState>,
    stats: ServerStats,
    metrics: Arc<MetricsRegistry>,
}

impl ServerHandle {
    /// Wait until the listener is armed, returning the bound address.
    pub async fn ready(&self) -> SocketAddr {
        self.state.ready.cancelled().await;
        let addr = *self.state.bound_addr.lock();
        addr.expect("ready token cancelled without a bound address")
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.state.bound_addr.lock()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.shutting_down.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Stop accepting, drain in-flight requests, then stop the workers.
    ///
    /// Connections still working when `timeout` expires are force-closed.
    /// Subsequent calls are no-ops that wait for the same completion.
    pub async fn shutdown_graceful(&self, timeout: Duration) {
        if !self.state.shutting_down.swap(true, Ordering::SeqCst) {
            tracing::info!(?timeout, "graceful shutdown requested");
            self.state.shutdown.cancel();
            let force = self.state.force.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                force.cancel();
            });
        }
        self.state.stopped.cancelled().await;
    }
}

// ============================================================================
// Accept loop
// ============================================================================

/// Listener setup through socket2: reuse-address, non-blocking, custom
/// backlog, then handed to tokio.
fn build_listener(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|_| ServerError::InvalidAddress(format!("{}:{}", config.host, config.port)))?;

    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.listen_backlog as i32)?;

    Ok(TcpListener::from_std(socket.into())?)
}

/// Admission decision for one accepted socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
    Accept,
    RejectShutdown,
    Reject503,
    CloseSilently,
}

/// Classify an accepted connection against shutdown state and the
/// hysteretic overload flag.
fn admit(core: &ServerCore) -> Admission {
    let state = &core.state;
    if state.shutting_down.load(Ordering::SeqCst) {
        return Admission::RejectShutdown;
    }

    let active = state.active_connections.load(Ordering::Relaxed);
    update_overload_flag(core, active);

    let hard_cap = active >= core.config.max_connections;
    if state.overloaded.load(Ordering::Relaxed) || hard_cap {
        return match core.config.overload_behavior {
            OverloadBehavior::Reject503 => Admission::Reject503,
            OverloadBehavior::CloseConnection => Admission::CloseSilently,
            // Queue mode admits into the bounded handoff queue; the queue
            // cap itself sheds the excess.
            OverloadBehavior::QueueRequest if hard_cap => Admission::Reject503,
            OverloadBehavior::QueueRequest => Admission::Accept,
        };
    }
    Admission::Accept
}

/// Flip the overload flag with hysteresis: on at `high_water * max`, off
/// only below `low_water * max`.
fn update_overload_flag(core: &ServerCore, active: usize) {
    let state = &core.state;
    let max = core.config.max_connections as f64;
    let overloaded = state.overloaded.load(Ordering::Relaxed);
    if !overloaded {
        if active as f64 >= core.config.connection_high_water * max
            && !state.overloaded.swap(true, Ordering::Relaxed)
        {
            core.stats.overload_transitions.inc();
            tracing::warn!(active, "overload flag on");
        }
    } else if (active as f64) < core.config.connection_low_water * max
        && state.overloaded.swap(false, Ordering::Relaxed)
    {
        core.stats.overload_transitions.inc();
        tracing::info!(active, "overload flag off");
    }
}

async fn serve(core: Arc<ServerCore>, listener: TcpListener) -> Result<(), ServerError> {
    let worker_count = core.config.effective_workers();
    let queue_per_worker = (core.config.connection_queue_size / worker_count).max(1);

    let mut senders = Vec::with_capacity(worker_count);
    let mut joins = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let (tx, rx) = mpsc::channel::<std::net::TcpStream>(queue_per_worker);
        senders.push(tx);
        joins.push(worker::spawn(id, core.clone(), rx)?);
    }

    let mut next_worker = 0usize;
    loop {
        tokio::select! {
            biased;
            _ = core.state.shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        handle_accept(&core, &senders, &mut next_worker, stream, peer);
                    }
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                    }
                }
            }
        }
    }

    // Drain phase: existing connections finish their current request; new
    // arrivals are answered with 503 until the grace period expires.
    core.state.shutting_down.store(true, Ordering::SeqCst);
    loop {
        if core.state.active_connections.load(Ordering::Relaxed) == 0 {
            break;
        }
        tokio::select! {
            biased;
            _ = core.state.force.cancelled() => break,
            accepted = listener.accept() => {
                if let Ok((stream, _)) = accepted {
                    core.stats.rejected_during_shutdown.inc();
                    reject_with_503(&core, stream);
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
    }

    drop(listener);
    core.state.force.cancel();

    // onStop: listener is closed, workers have not joined yet.
    core.hooks.run_stop();

    drop(senders);
    for join in joins {
        let _ = tokio::task::spawn_blocking(move || join.join()).await;
    }
    tracing::info!("server stopped");
    Ok(())
}

fn handle_accept(
    core: &Arc<ServerCore>,
    senders: &[mpsc::Sender<std::net::TcpStream>],
    next_worker: &mut usize,
    stream: TcpStream,
    peer: SocketAddr,
) {
    match admit(core) {
        Admission::Accept => {}
        Admission::RejectShutdown => {
            core.stats.rejected_during_shutdown.inc();
            reject_with_503(core, stream);
            return;
        }
        Admission::Reject503 => {
            core.stats.rejected_overload.inc();
            reject_with_503(core, stream);
            return;
        }
        Admission::CloseSilently => {
            core.stats.rejected_overload.inc();
            drop(stream);
            return;
        }
    }

    let _ = stream.set_nodelay(true);
    let std_stream = match stream.into_std() {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(%err, %peer, "socket detach failed");
            return;
        }
    };

    // Round-robin with skip-on-full; a fully saturated queue set sheds.
    let n = senders.len();
    let mut stream = Some(std_stream);
    for i in 0..n {
        let idx = (*next_worker + i) % n;
        match senders[idx].try_send(stream.take().expect("stream consumed")) {
            Ok(()) => {
                *next_worker = (idx + 1) % n;
                return;
            }
            Err(mpsc::error::TrySendError::Full(s)) => stream = Some(s),
            Err(mpsc::error::TrySendError::Closed(s)) => stream = Some(s),
        }
    }

    core.stats.rejected_queue_full.inc();
    match core.config.overload_behavior {
        OverloadBehavior::CloseConnection | OverloadBehavior::QueueRequest => drop(stream),
        OverloadBehavior::Reject503 => {
            if let Some(std_stream) = stream {
                if let Ok(s) = TcpStream::from_std(std_stream) {
                    reject_with_503(core, s);
                }
            }
        }
    }
}

/// Answer a connection we will not serve with a canned 503, off the accept
/// loop's critical path.
fn reject_with_503(core: &Arc<ServerCore>, mut stream: TcpStream) {
    let payload = canned_503(core.config.retry_after_seconds);
    tokio::spawn(async move {
        let write = async {
            stream.write_all(&payload).await?;
            stream.shutdown().await
        };
        let _ = tokio::time::timeout(Duration::from_secs(1), write).await;
    });
}

/// Serialized `503 Service Unavailable` with `Retry-After` and a JSON body.
fn canned_503(retry_after_seconds: u32) -> Vec<u8> {
    let mut response = ResponseBuilder::new();
    response
        .status(503)
        .set_header("Retry-After", &retry_after_seconds.to_string())
        .set_header("Connection", "close")
        .json(&serde_json::json!({
            "error": reason_phrase(503),
            "reason": "overloaded",
        }));
    let mut buf = Buffer::with_capacity(1024);
    let n = response.build_into(&mut buf, true);
    debug_assert!(n > 0);
    buf.as_slice().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_core(max_connections: usize, behavior: OverloadBehavior) -> Arc<ServerCore> {
        let metrics = Arc::new(MetricsRegistry::new());
        let config = ServerConfig::new("127.0.0.1", 0)
            .max_connections(max_connections)
            .connection_water_marks(0.6, 0.8)
            .overload_behavior(behavior);
        Arc::new(ServerCore {
            stats: ServerStats::new(&metrics),
            state: Arc::new(RuntimeState::new()),
            config,
            router: Router::new(),
            middleware: MiddlewareChain::new(),
            hooks: Hooks::new(),
            error_handlers: ErrorHandlers::new(),
            metrics,
        })
    }

    fn set_active(core: &ServerCore, n: usize) {
        core.state.active_connections.store(n, Ordering::Relaxed);
    }

    #[test]
    fn overload_flag_is_hysteretic() {
        let core = test_core(100, OverloadBehavior::Reject503);

        set_active(&core, 79);
        assert_eq!(admit(&core), Admission::Accept);
        assert!(!core.state.overloaded.load(Ordering::Relaxed));

        // Crosses high water: flips on.
        set_active(&core, 80);
        assert_eq!(admit(&core), Admission::Reject503);
        assert!(core.state.overloaded.load(Ordering::Relaxed));
        assert_eq!(core.stats.overload_transitions.get(), 1);

        // Below high water but above low water: stays on.
        set_active(&core, 70);
        assert_eq!(admit(&core), Admission::Reject503);
        assert!(core.state.overloaded.load(Ordering::Relaxed));

        // Below low water: flips off.
        set_active(&core, 59);
        assert_eq!(admit(&core), Admission::Accept);
        assert!(!core.state.overloaded.load(Ordering::Relaxed));
        assert_eq!(core.stats.overload_transitions.get(), 2);
    }

    #[test]
    fn shutdown_rejects_everything() {
        let core = test_core(100, OverloadBehavior::Reject503);
        core.state.shutting_down.store(true, Ordering::SeqCst);
        set_active(&core, 0);
        assert_eq!(admit(&core), Admission::RejectShutdown);
    }

    #[test]
    fn close_connection_behavior_drops_silently() {
        let core = test_core(10, OverloadBehavior::CloseConnection);
        set_active(&core, 10);
        assert_eq!(admit(&core), Admission::CloseSilently);
    }

    #[test]
    fn canned_503_is_well_formed() {
        let bytes = canned_503(7);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(text.contains("Retry-After: 7\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("\"reason\":\"overloaded\""));
    }
}
