//! Worker event loops.
//!
//! Each worker is an OS thread running a single-threaded tokio runtime and
//! a `LocalSet`. Connections arrive over a bounded channel from the accept
//! loop and become local tasks, one cooperative fiber per connection, so
//! per-connection state is never observed concurrently. The worker owns
//! the thread-local resources: buffer pool and connection-state pool.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use crate::pool::{BufferPool, ObjectPool};
use crate::server::conn::{self, ConnInner};
use crate::server::ServerCore;

/// Per-worker (thread-local by ownership) resource pools.
pub(crate) struct WorkerPools {
    pub buffers: BufferPool,
    pub conns: ObjectPool<ConnInner>,
}

impl WorkerPools {
    fn new(core: &ServerCore) -> WorkerPools {
        let per_worker = core.config.max_connections / core.config.effective_workers().max(1);
        WorkerPools {
            buffers: BufferPool::new(),
            conns: ObjectPool::new(per_worker.clamp(16, 256), ConnInner::new)
                .on_release(ConnInner::scrub),
        }
    }
}

/// Spawn one worker thread. It exits when the accept loop drops its sender
/// and every tracked connection has finished (or the force deadline hits).
pub(crate) fn spawn(
    id: usize,
    core: Arc<ServerCore>,
    rx: mpsc::Receiver<std::net::TcpStream>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("aurora-worker-{id}"))
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("worker runtime construction");
            let local = tokio::task::LocalSet::new();
            local.block_on(&rt, worker_loop(id, core, rx));
        })
}

async fn worker_loop(id: usize, core: Arc<ServerCore>, mut rx: mpsc::Receiver<std::net::TcpStream>) {
    let pools = Rc::new(RefCell::new(WorkerPools::new(&core)));
    let tracker = TaskTracker::new();
    if core.config.debug_mode {
        tracing::debug!(worker = id, "worker started");
    }

    while let Some(stream) = rx.recv().await {
        let core = core.clone();
        let pools = pools.clone();
        tracker.spawn_local(conn::serve(stream, core, pools));
    }

    // Accept loop is gone; let live connections drain until the force
    // deadline, then abandon them (their guards keep the counters honest).
    tracker.close();
    tokio::select! {
        _ = tracker.wait() => {}
        _ = core.state.force.cancelled() => {
            tracing::warn!(worker = id, "force deadline hit with connections open");
        }
    }
    if core.config.debug_mode {
        tracing::debug!(worker = id, "worker stopped");
    }
}
