//! Middleware pipeline.
//!
//! A pipeline is an ordered list of [`Middleware`] values wrapped around
//! the route handler. The runner is a call chain over a shared slice: each
//! [`Next::run`] peels one middleware off the front, and the empty slice
//! invokes the handler. A middleware that never calls `next` short-circuits
//! the rest of the chain; errors flow back out to the typed error-handler
//! dispatch.

pub mod memory;

use std::sync::Arc;

use crate::context::Context;
use crate::error::BoxError;
use crate::router::Handler;

/// One step wrapped around the route handler.
///
/// Runs on a single-threaded worker, so the future is not `Send`; the
/// middleware value itself is shared across workers and must be.
#[async_trait::async_trait(?Send)]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, ctx: &mut Context<'_>, next: Next<'_>) -> Result<(), BoxError>;
}

/// The remainder of the chain. Calling [`Next::run`] advances it; dropping
/// it without running short-circuits the handler.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut Context<'_>) -> Result<(), BoxError> {
        match self.chain.split_first() {
            Some((mw, rest)) => {
                let next = Next {
                    chain: rest,
                    handler: self.handler,
                };
                mw.handle(ctx, next).await
            }
            None => self.handler.call(ctx).await,
        }
    }
}

/// Ordered middleware list, registered before the server starts.
#[derive(Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> MiddlewareChain {
        MiddlewareChain {
            middlewares: Vec::new(),
        }
    }

    pub fn add(&mut self, mw: impl Middleware) -> &mut Self {
        self.middlewares.push(Arc::new(mw));
        self
    }

    pub fn add_arc(&mut self, mw: Arc<dyn Middleware>) -> &mut Self {
        self.middlewares.push(mw);
        self
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Run the whole chain, ending at `handler`.
    pub async fn run(&self, ctx: &mut Context<'_>, handler: &dyn Handler) -> Result<(), BoxError> {
        Next {
            chain: &self.middlewares,
            handler,
        }
        .run(ctx)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parser::RequestParser;
    use crate::http::{Request, ResponseBuilder};
    use crate::pool::Arena;
    use crate::router::Handler;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Terminal;

    #[async_trait::async_trait(?Send)]
    impl Handler for Terminal {
        async fn call(&self, ctx: &mut Context<'_>) -> Result<(), BoxError> {
            ctx.response().status(200).body("handled");
            Ok(())
        }
    }

    /// Records pre/post order to prove wrapping works.
    struct Tagger {
        tag: &'static str,
        order: Arc<AtomicU32>,
    }

    #[async_trait::async_trait(?Send)]
    impl Middleware for Tagger {
        async fn handle(&self, ctx: &mut Context<'_>, next: Next<'_>) -> Result<(), BoxError> {
            let before = self.order.fetch_add(1, Ordering::SeqCst);
            next.run(ctx).await?;
            let after = self.order.fetch_add(1, Ordering::SeqCst);
            ctx.response()
                .header(self.tag, &format!("{before}-{after}"));
            Ok(())
        }
    }

    struct ShortCircuit;

    #[async_trait::async_trait(?Send)]
    impl Middleware for ShortCircuit {
        async fn handle(&self, ctx: &mut Context<'_>, _next: Next<'_>) -> Result<(), BoxError> {
            ctx.response().status(403).body("denied");
            Ok(())
        }
    }

    struct Failing;

    #[async_trait::async_trait(?Send)]
    impl Middleware for Failing {
        async fn handle(&self, _ctx: &mut Context<'_>, _next: Next<'_>) -> Result<(), BoxError> {
            Err("middleware exploded".into())
        }
    }

    async fn run_chain(chain: &MiddlewareChain) -> (u16, ResponseBuilder) {
        let mut parser = RequestParser::new();
        let buf: &[u8] = b"GET / HTTP/1.1\r\n\r\n";
        parser.parse(buf).unwrap();
        let request = Request::new(&parser, buf);
        let mut response = ResponseBuilder::new();
        let arena = Arena::with_capacity(64);
        let mut ctx = Context::new(&request, &mut response, Vec::new(), &arena);
        let result = chain.run(&mut ctx, &Terminal).await;
        let status = if result.is_ok() {
            response.status_code()
        } else {
            0
        };
        (status, response)
    }

    #[tokio::test]
    async fn chain_runs_in_registration_order() {
        let order = Arc::new(AtomicU32::new(0));
        let mut chain = MiddlewareChain::new();
        chain.add(Tagger {
            tag: "x-outer",
            order: order.clone(),
        });
        chain.add(Tagger {
            tag: "x-inner",
            order: order.clone(),
        });

        let (status, response) = run_chain(&chain).await;
        assert_eq!(status, 200);
        // Outer enters first (0) and leaves last (3).
        assert_eq!(response.get_header("x-outer"), Some("0-3"));
        assert_eq!(response.get_header("x-inner"), Some("1-2"));
    }

    #[tokio::test]
    async fn short_circuit_skips_handler() {
        let mut chain = MiddlewareChain::new();
        chain.add(ShortCircuit);

        let (status, response) = run_chain(&chain).await;
        assert_eq!(status, 403);
        assert_eq!(response.body_bytes(), b"denied");
    }

    #[tokio::test]
    async fn middleware_error_propagates() {
        let mut chain = MiddlewareChain::new();
        chain.add(Failing);
        let (status, _) = run_chain(&chain).await;
        assert_eq!(status, 0);
    }

    #[tokio::test]
    async fn empty_chain_calls_handler_directly() {
        let chain = MiddlewareChain::new();
        let (status, response) = run_chain(&chain).await;
        assert_eq!(status, 200);
        assert_eq!(response.body_bytes(), b"handled");
    }
}
