//! Aurora: embedded HTTP/1.1 application server runtime.
//!
//! Aurora is a library: the application registers route handlers,
//! middleware, lifecycle hooks, and typed error handlers, and the runtime
//! accepts connections, parses requests, dispatches the pipeline, and
//! writes responses.
//!
//! # Architecture
//!
//! - One accept loop on the caller's runtime feeds N worker event loops
//!   (dedicated threads, single-threaded runtimes). One connection is one
//!   cooperative fiber on one worker, so per-connection state needs no
//!   locks.
//! - Buffers, connection state, and per-request arenas are pooled per
//!   worker; steady-state traffic performs no allocator calls.
//! - Backpressure is a hysteretic overload flag over active connections
//!   plus an in-flight request gate; overflow work is answered with 503 or
//!   shed, by configuration.
//! - Metrics (counters, gauges, histograms, reservoir percentiles) export
//!   as JSON and Prometheus text.
//!
//! # Example
//!
//! ```no_run
//! use aurora::{Context, Server, ServerConfig};
//! use aurora::router::sync_handler;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut server = Server::new(ServerConfig::new("127.0.0.1", 8080));
//!     server
//!         .router_mut()
//!         .get(
//!             "/",
//!             sync_handler(|ctx: &mut Context<'_>| {
//!                 ctx.response()
//!                     .status(200)
//!                     .header("Content-Type", "text/plain")
//!                     .body("Hello, World!");
//!                 Ok(())
//!             }),
//!         )
//!         .unwrap();
//!
//!     let handle = server.handle();
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         handle
//!             .shutdown_graceful(std::time::Duration::from_secs(30))
//!             .await;
//!     });
//!     server.run().await.unwrap();
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod http;
pub mod metrics;
pub mod middleware;
pub mod pool;
pub mod router;
pub mod server;

pub use crate::config::{OverloadBehavior, ServerConfig};
pub use crate::context::Context;
pub use crate::error::{BoxError, ConnectionError, ErrorHandlers};
pub use crate::hooks::Hooks;
pub use crate::http::{Method, Request, ResponseBuilder, Version};
pub use crate::metrics::MetricsRegistry;
pub use crate::middleware::memory::{
    MemoryMonitor, MemoryMonitorConfig, MemoryPressureMiddleware, MemoryState, PressureAction,
};
pub use crate::middleware::{Middleware, MiddlewareChain, Next};
pub use crate::router::{Handler, Router};
pub use crate::server::{Server, ServerError, ServerHandle, ServerStats};
