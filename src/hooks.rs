//! Lifecycle and request hooks.
//!
//! Five ordered lists, executed FIFO in registration order. A panic inside
//! a hook is caught, logged, and swallowed so user instrumentation can
//! never take down a request or the server lifecycle. Registration happens
//! before `run()`; afterwards the registry is read-only.

use std::error::Error as StdError;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::context::Context;

type LifecycleHook = Box<dyn Fn() + Send + Sync>;
type RequestHook = Box<dyn Fn(&mut Context<'_>) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&mut Context<'_>, &(dyn StdError + 'static)) + Send + Sync>;

/// Hook registry: onStart, onStop, onRequest, onResponse, onError.
#[derive(Default)]
pub struct Hooks {
    on_start: Vec<LifecycleHook>,
    on_stop: Vec<LifecycleHook>,
    on_request: Vec<RequestHook>,
    on_response: Vec<RequestHook>,
    on_error: Vec<ErrorHook>,
}

impl Hooks {
    pub fn new() -> Hooks {
        Hooks::default()
    }

    /// Runs once, before the listening socket is armed.
    pub fn on_start(&mut self, f: impl Fn() + Send + Sync + 'static) -> &mut Self {
        self.on_start.push(Box::new(f));
        self
    }

    /// Runs once, after the listener closes and before workers join.
    pub fn on_stop(&mut self, f: impl Fn() + Send + Sync + 'static) -> &mut Self {
        self.on_stop.push(Box::new(f));
        self
    }

    /// Runs before the middleware chain for every dispatched request.
    pub fn on_request(&mut self, f: impl Fn(&mut Context<'_>) + Send + Sync + 'static) -> &mut Self {
        self.on_request.push(Box::new(f));
        self
    }

    /// Runs after the response body is complete, before it is written.
    pub fn on_response(
        &mut self,
        f: impl Fn(&mut Context<'_>) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_response.push(Box::new(f));
        self
    }

    /// Runs when no typed error handler claimed a pipeline error.
    pub fn on_error(
        &mut self,
        f: impl Fn(&mut Context<'_>, &(dyn StdError + 'static)) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_error.push(Box::new(f));
        self
    }

    pub(crate) fn run_start(&self) {
        for hook in &self.on_start {
            guard("onStart", || hook());
        }
    }

    pub(crate) fn run_stop(&self) {
        for hook in &self.on_stop {
            guard("onStop", || hook());
        }
    }

    pub(crate) fn run_request(&self, ctx: &mut Context<'_>) {
        for hook in &self.on_request {
            guard("onRequest", || hook(ctx));
        }
    }

    pub(crate) fn run_response(&self, ctx: &mut Context<'_>) {
        for hook in &self.on_response {
            guard("onResponse", || hook(ctx));
        }
    }

    pub(crate) fn run_error(&self, ctx: &mut Context<'_>, err: &(dyn StdError + 'static)) {
        for hook in &self.on_error {
            guard("onError", || hook(ctx, err));
        }
    }
}

/// Run one hook, swallowing (and logging) any panic.
fn guard(kind: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let msg = panic
            .downcast_ref::<&str>()
            .copied()
            .map(str::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic".to_string());
        tracing::warn!(hook = kind, panic = %msg, "hook panicked; continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parser::RequestParser;
    use crate::http::{Request, ResponseBuilder};
    use crate::pool::Arena;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn fifo_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut hooks = Hooks::new();
        for i in 0..3 {
            let log = log.clone();
            hooks.on_start(move || log.lock().unwrap().push(i));
        }
        hooks.run_start();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn panicking_hook_is_swallowed() {
        let after = Arc::new(AtomicU32::new(0));
        let mut hooks = Hooks::new();
        hooks.on_stop(|| panic!("boom"));
        {
            let after = after.clone();
            hooks.on_stop(move || {
                after.fetch_add(1, Ordering::SeqCst);
            });
        }
        hooks.run_stop();
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn request_hooks_see_context() {
        let mut hooks = Hooks::new();
        hooks.on_request(|ctx| {
            ctx.set("trace", 7u32);
        });
        hooks.on_response(|ctx| {
            let n = *ctx.get::<u32>("trace").unwrap();
            ctx.response().header("x-trace", &n.to_string());
        });

        let mut parser = RequestParser::new();
        let buf: &[u8] = b"GET / HTTP/1.1\r\n\r\n";
        parser.parse(buf).unwrap();
        let request = Request::new(&parser, buf);
        let mut response = ResponseBuilder::new();
        let arena = Arena::with_capacity(64);
        let mut ctx = Context::new(&request, &mut response, Vec::new(), &arena);

        hooks.run_request(&mut ctx);
        hooks.run_response(&mut ctx);
        assert_eq!(response.get_header("x-trace"), Some("7"));
    }
}
