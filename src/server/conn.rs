//! Per-connection state machine.
//!
//! One connection is one cooperative fiber on its worker's event loop,
//! running the parse → dispatch → write pipeline with keep-alive. The only
//! suspension points are socket readiness waits and deadline timers, so
//! connection state is never observed concurrently.
//!
//! I/O follows the non-blocking contract: `WouldBlock` re-arms readiness
//! and is never an error; EOF on a half-read message closes with an error
//! counter; a zero-byte write re-arms writability.

use std::cell::RefCell;
use std::error::Error as StdError;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::config::OverloadBehavior;
use crate::context::Context;
use crate::error::ConnectionError;
use crate::http::parser::ParseProgress;
use crate::http::{reason_phrase, Method, Request, RequestParser, ResponseBuilder, Version};
use crate::pool::{Arena, Bucket, Buffer};
use crate::server::worker::WorkerPools;
use crate::server::ServerCore;

/// Scratch arena capacity per request.
const REQUEST_ARENA_CAPACITY: usize = 16 * 1024;

/// Fresh connections start reading into this bucket.
const READ_BUFFER_BUCKET: Bucket = Bucket::Small;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnState {
    AcceptPending,
    ReadingHeaders,
    ReadingBody,
    Dispatching,
    WritingResponse,
    Draining,
    Closed,
}

/// Recyclable per-connection state, drawn from the worker's object pool.
pub(crate) struct ConnInner {
    pub parser: RequestParser,
    pub response: ResponseBuilder,
    pub arena: Arena,
    pub requests_served: u32,
}

impl ConnInner {
    pub fn new() -> ConnInner {
        ConnInner {
            parser: RequestParser::new(),
            response: ResponseBuilder::new(),
            arena: Arena::with_capacity(REQUEST_ARENA_CAPACITY),
            requests_served: 0,
        }
    }

    /// Pool release callback: scrub request state before parking.
    pub fn scrub(&mut self) {
        self.parser.reset();
        self.response.reset();
        self.arena.reset();
        self.requests_served = 0;
    }
}

/// Decrements the active-connection accounting even if the fiber is
/// abandoned at the force deadline.
struct ActiveGuard {
    core: Arc<ServerCore>,
}

impl ActiveGuard {
    fn new(core: Arc<ServerCore>) -> ActiveGuard {
        core.state.active_connections.fetch_add(1, Ordering::Relaxed);
        core.stats.active_connections.add(1.0);
        ActiveGuard { core }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.core
            .state
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
        self.core.stats.active_connections.sub(1.0);
    }
}

/// Tracks one dispatched request until its response is fully written.
struct InFlightGuard {
    core: Arc<ServerCore>,
}

impl InFlightGuard {
    fn new(core: Arc<ServerCore>) -> InFlightGuard {
        core.state.in_flight.fetch_add(1, Ordering::Relaxed);
        core.stats.in_flight_requests.add(1.0);
        InFlightGuard { core }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.core.state.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.core.stats.in_flight_requests.sub(1.0);
    }
}

/// Entry point: adopt an accepted socket and run it to completion.
pub(crate) async fn serve(
    stream: std::net::TcpStream,
    core: Arc<ServerCore>,
    pools: Rc<RefCell<WorkerPools>>,
) {
    let stream = match TcpStream::from_std(stream) {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(%err, "failed to register socket with worker reactor");
            return;
        }
    };

    core.stats.connections.inc();
    let _active = ActiveGuard::new(core.clone());

    let (inner, read_buf) = {
        let mut pools_ref = pools.borrow_mut();
        let inner = pools_ref
            .conns
            .acquire()
            .unwrap_or_else(|| Box::new(ConnInner::new()));
        (inner, pools_ref.buffers.acquire_bucket(READ_BUFFER_BUCKET))
    };

    let mut conn = Connection {
        stream,
        core: core.clone(),
        pools,
        inner,
        read_buf,
        write_buf: None,
        state: ConnState::AcceptPending,
        consumed: 0,
    };

    let force = core.state.force.clone();
    let result = tokio::select! {
        biased;
        _ = force.cancelled() => Err(ConnectionError::ShutdownDeadline),
        r = conn.process() => r,
    };
    conn.close(result);
}

enum ReadOutcome {
    /// A complete request is buffered and parsed.
    Request,
    /// Orderly end of the connection: idle EOF, keep-alive expiry, or
    /// graceful shutdown while idle.
    CleanClose,
}

enum ParsedStep {
    Complete,
    NeedsMore { send_continue: bool },
}

struct Connection {
    stream: TcpStream,
    core: Arc<ServerCore>,
    pools: Rc<RefCell<WorkerPools>>,
    inner: Box<ConnInner>,
    read_buf: Buffer,
    write_buf: Option<Buffer>,
    state: ConnState,
    /// Bytes of the current request at the front of `read_buf`.
    consumed: usize,
}

impl Connection {
    async fn process(&mut self) -> Result<(), ConnectionError> {
        self.state = ConnState::ReadingHeaders;
        loop {
            match self.read_request().await {
                Ok(ReadOutcome::Request) => {}
                Ok(ReadOutcome::CleanClose) => return Ok(()),
                Err(err) => {
                    self.emit_error_reply(&err).await;
                    return Err(err);
                }
            }
            let keep = self.dispatch_and_write().await?;
            if !keep {
                return Ok(());
            }
            self.advance();
        }
    }

    /// Read until one full request is buffered, honoring header/body limits
    /// and the read/keep-alive deadlines.
    async fn read_request(&mut self) -> Result<ReadOutcome, ConnectionError> {
        let read_timeout = self.core.config.read_timeout;
        let keep_alive_timeout = self.core.config.keep_alive_timeout;
        let first = self.inner.requests_served == 0;
        let mut idle = self.read_buf.is_empty();
        let mut deadline = Instant::now()
            + if first || !idle {
                read_timeout
            } else {
                keep_alive_timeout
            };

        loop {
            if !self.read_buf.is_empty() {
                match self.advance_parser()? {
                    ParsedStep::Complete => return Ok(ReadOutcome::Request),
                    ParsedStep::NeedsMore { send_continue } => {
                        if send_continue {
                            write_all_deadline(
                                &self.stream,
                                b"HTTP/1.1 100 Continue\r\n\r\n",
                                deadline,
                            )
                            .await?;
                        }
                    }
                }
            }

            if self.read_buf.remaining() == 0 {
                self.grow_read_buf();
            }

            let got = if idle {
                // Idle between requests: graceful shutdown or keep-alive
                // expiry both end the connection cleanly.
                tokio::select! {
                    biased;
                    _ = self.core.state.shutdown.cancelled() => return Ok(ReadOutcome::CleanClose),
                    r = read_some(&self.stream, &mut self.read_buf, deadline) => match r {
                        Ok(Some(n)) => n,
                        Ok(None) => return Ok(ReadOutcome::CleanClose),
                        Err(ConnectionError::ReadTimeout) => return Ok(ReadOutcome::CleanClose),
                        Err(err) => return Err(err),
                    },
                }
            } else {
                match read_some(&self.stream, &mut self.read_buf, deadline).await {
                    Ok(Some(n)) => n,
                    Ok(None) => return Err(ConnectionError::UnexpectedEof),
                    Err(err) => return Err(err),
                }
            };

            if idle && got > 0 {
                // First byte of a request: the full-message deadline arms.
                idle = false;
                deadline = Instant::now() + read_timeout;
            }
        }
    }

    /// Feed the buffer to the parser and apply limit checks.
    fn advance_parser(&mut self) -> Result<ParsedStep, ConnectionError> {
        let max_header = self.core.config.max_header_size;
        let max_body = self.core.config.max_body_size;

        let progress = self.inner.parser.parse(self.read_buf.as_slice());
        if let Some(head_len) = self.inner.parser.head_len() {
            if head_len > max_header {
                return Err(ConnectionError::HeadersTooLarge);
            }
        }

        match progress {
            Ok(ParseProgress::Complete { consumed }) => {
                if self.inner.parser.body_lower_bound() > max_body {
                    return Err(ConnectionError::BodyTooLarge);
                }
                self.consumed = consumed;
                Ok(ParsedStep::Complete)
            }
            Ok(ParseProgress::HeadersComplete) => {
                self.state = ConnState::ReadingBody;
                if self.inner.parser.body_lower_bound() > max_body {
                    return Err(ConnectionError::BodyTooLarge);
                }
                let send_continue = self
                    .inner
                    .parser
                    .head()
                    .and_then(|h| h.header(self.read_buf.as_slice(), "expect"))
                    .map_or(false, |v| v.eq_ignore_ascii_case(b"100-continue"));
                Ok(ParsedStep::NeedsMore { send_continue })
            }
            Ok(ParseProgress::NeedMore) => {
                if !self.inner.parser.headers_done() {
                    if self.read_buf.len() > max_header {
                        return Err(ConnectionError::HeadersTooLarge);
                    }
                } else if self.inner.parser.body_lower_bound() > max_body {
                    return Err(ConnectionError::BodyTooLarge);
                }
                Ok(ParsedStep::NeedsMore {
                    send_continue: false,
                })
            }
            Err(err) => Err(ConnectionError::Protocol(err)),
        }
    }

    /// Swap the read buffer for a bigger one, preserving buffered bytes.
    fn grow_read_buf(&mut self) {
        let current = self.read_buf.capacity();
        let needed = match self.inner.parser.head_len() {
            // Head + declared body + framing slack.
            Some(head_len) => head_len + self.inner.parser.body_lower_bound() + 1024,
            None => current * 2,
        };
        let new_cap = needed.max(current * 2);

        let mut pools = self.pools.borrow_mut();
        let mut bigger = pools.buffers.acquire(new_cap);
        bigger.extend_from_slice(self.read_buf.as_slice());
        let old = std::mem::replace(&mut self.read_buf, bigger);
        pools.buffers.release(old);
    }

    /// Run hooks, middleware, and the handler, then write the response.
    /// Returns whether the connection is kept alive.
    async fn dispatch_and_write(&mut self) -> Result<bool, ConnectionError> {
        let core = self.core.clone();
        self.state = if core.state.shutting_down.load(Ordering::SeqCst) {
            ConnState::Draining
        } else {
            ConnState::Dispatching
        };
        core.stats.requests.inc();

        if core.state.in_flight.load(Ordering::Relaxed) >= core.config.max_in_flight_requests {
            core.stats.rejected_in_flight.inc();
            if core.config.overload_behavior != OverloadBehavior::CloseConnection {
                self.reply_overloaded("in_flight_limit").await;
            }
            return Ok(false);
        }
        let _in_flight = InFlightGuard::new(core.clone());
        let started = std::time::Instant::now();

        let keep_alive_requested;
        let head_only;
        let version;
        {
            let ConnInner {
                parser,
                response,
                arena,
                ..
            } = &mut *self.inner;
            let buf = self.read_buf.as_slice();
            let request = Request::new(parser, buf);
            keep_alive_requested = request.keep_alive();
            head_only = request.method() == Method::Head;
            version = request.version();

            let matched = core.router.lookup(request.method(), request.path());
            let params = matched
                .as_ref()
                .map(|m| m.params.clone())
                .unwrap_or_default();
            let mut ctx = Context::new(&request, response, params, arena);

            core.hooks.run_request(&mut ctx);
            let outcome = match matched.as_ref() {
                Some(m) => core.middleware.run(&mut ctx, m.handler).await,
                None => {
                    ctx.response()
                        .status(404)
                        .json(&serde_json::json!({"error": reason_phrase(404)}));
                    Ok(())
                }
            };

            if let Err(err) = outcome {
                core.stats.errors.inc();
                let err_ref: &(dyn StdError + 'static) = &*err;
                if !core.error_handlers.dispatch(&mut ctx, err_ref) {
                    ctx.response().reset();
                    ctx.response()
                        .status(500)
                        .json(&serde_json::json!({"error": reason_phrase(500)}));
                    core.hooks.run_error(&mut ctx, err_ref);
                }
            }

            core.hooks.run_response(&mut ctx);
        }

        self.inner.requests_served += 1;
        let max_requests = core.config.max_requests_per_connection;
        let keep = keep_alive_requested
            && (max_requests == 0 || self.inner.requests_served < max_requests)
            && !core.state.shutting_down.load(Ordering::SeqCst)
            && !self.inner.response.wants_close();

        if !keep {
            if self.inner.response.get_header("connection").is_none() {
                self.inner.response.set_header("Connection", "close");
            }
        } else if version == Version::Http10 {
            // HTTP/1.0 clients need reuse confirmed explicitly.
            self.inner.response.set_header("Connection", "keep-alive");
        }

        self.state = ConnState::WritingResponse;
        self.write_response(head_only).await?;
        core.stats.request_duration.record(started.elapsed());
        Ok(keep)
    }

    /// Serialize into a pooled write buffer and flush it.
    async fn write_response(&mut self, head_only: bool) -> Result<(), ConnectionError> {
        let hint = self.inner.response.wire_size_hint();
        let mut buf = match self.write_buf.take() {
            Some(existing) if existing.capacity() >= hint => existing,
            Some(small) => {
                let mut pools = self.pools.borrow_mut();
                pools.buffers.release(small);
                pools.buffers.acquire(hint)
            }
            None => self.pools.borrow_mut().buffers.acquire(hint),
        };

        let mut n = self.inner.response.build_into(&mut buf, !head_only);
        while n == 0 {
            // Undersized: upgrade the buffer and retry, never truncate.
            let bigger_cap = (buf.capacity() * 2).max(hint);
            let mut pools = self.pools.borrow_mut();
            let bigger = pools.buffers.acquire(bigger_cap);
            pools.buffers.release(std::mem::replace(&mut buf, bigger));
            drop(pools);
            n = self.inner.response.build_into(&mut buf, !head_only);
        }

        let deadline = Instant::now() + self.core.config.write_timeout;
        let result = write_all_deadline(&self.stream, buf.as_slice(), deadline).await;
        // Retained for the next response on this connection.
        self.write_buf = Some(buf);
        result?;
        self.core.stats.response_bytes.observe(n as f64);
        Ok(())
    }

    /// 503 for a request that exceeded the in-flight limit.
    async fn reply_overloaded(&mut self, why: &str) {
        let retry_after = self.core.config.retry_after_seconds.to_string();
        let response = &mut self.inner.response;
        response.reset();
        response
            .status(503)
            .set_header("Retry-After", &retry_after)
            .set_header("Connection", "close")
            .json(&serde_json::json!({
                "error": reason_phrase(503),
                "reason": why,
            }));
        let _ = self.write_response(false).await;
    }

    /// Best-effort error response before closing; failures are ignored.
    async fn emit_error_reply(&mut self, err: &ConnectionError) {
        let Some(status) = err.status() else { return };
        let response = &mut self.inner.response;
        response.reset();
        response
            .status(status)
            .set_header("Connection", "close")
            .json(&serde_json::json!({"error": reason_phrase(status)}));
        self.state = ConnState::WritingResponse;
        let _ = self.write_response(false).await;
    }

    /// Keep-alive: invalidate the request view's backing, then slide any
    /// pipelined-in-series bytes to the front of the read buffer.
    fn advance(&mut self) {
        self.inner.parser.reset();
        self.inner.arena.reset();
        self.inner.response.reset();
        self.read_buf.truncate_front(self.consumed);
        self.consumed = 0;
        self.state = ConnState::ReadingHeaders;
    }

    /// Close exactly once, count the outcome, and recycle resources.
    fn close(mut self, result: Result<(), ConnectionError>) {
        self.state = ConnState::Closed;
        if let Err(err) = &result {
            let stats = &self.core.stats;
            match err {
                ConnectionError::Protocol(_) => stats.protocol_errors.inc(),
                ConnectionError::HeadersTooLarge => stats.rejected_headers_too_large.inc(),
                ConnectionError::BodyTooLarge => stats.rejected_body_too_large.inc(),
                ConnectionError::ReadTimeout | ConnectionError::WriteTimeout => {
                    stats.timeouts.inc();
                    stats.errors.inc();
                }
                ConnectionError::UnexpectedEof | ConnectionError::Io(_) => stats.errors.inc(),
                ConnectionError::ShutdownDeadline => {
                    stats.forced_closes.inc();
                    stats.errors.inc();
                }
            }
            if self.core.config.debug_mode {
                tracing::debug!(state = ?self.state, error = %err, "connection closed");
            }
        }

        let Connection {
            stream,
            pools,
            inner,
            read_buf,
            write_buf,
            ..
        } = self;
        {
            let mut pools = pools.borrow_mut();
            pools.buffers.release(read_buf);
            if let Some(buf) = write_buf {
                pools.buffers.release(buf);
            }
            pools.conns.release(inner);
        }
        // Socket closes exactly once, here.
        drop(stream);
    }
}

// ============================================================================
// Readiness-driven I/O
// ============================================================================

/// Read some bytes before `deadline`. `Ok(Some(n))` on data, `Ok(None)` on
/// EOF. `WouldBlock` re-arms the readiness wait and is never an error.
async fn read_some(
    stream: &TcpStream,
    buf: &mut Buffer,
    deadline: Instant,
) -> Result<Option<usize>, ConnectionError> {
    loop {
        match tokio::time::timeout_at(deadline, stream.readable()).await {
            Err(_) => return Err(ConnectionError::ReadTimeout),
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.into()),
        }
        match stream.try_read(buf.unfilled()) {
            Ok(0) => return Ok(None),
            Ok(n) => {
                buf.advance(n);
                return Ok(Some(n));
            }
            // Readiness was stale; suspend again.
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Write all of `data` before `deadline`, re-arming on `WouldBlock` and on
/// zero-byte writes.
async fn write_all_deadline(
    stream: &TcpStream,
    data: &[u8],
    deadline: Instant,
) -> Result<(), ConnectionError> {
    let mut written = 0;
    while written < data.len() {
        match tokio::time::timeout_at(deadline, stream.writable()).await {
            Err(_) => return Err(ConnectionError::WriteTimeout),
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.into()),
        }
        match stream.try_write(&data[written..]) {
            Ok(0) => continue,
            Ok(n) => written += n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
