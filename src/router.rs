//! Route registration and lookup.
//!
//! Thin adapter over `matchit`: one radix tree per method, path parameters
//! surfaced into the request [`Context`](crate::context::Context). `HEAD`
//! falls back to the `GET` table so handlers are written once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::error::BoxError;
use crate::http::Method;

/// Boxed future pinned to the current worker thread.
pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// A route endpoint. Implementations run on a single-threaded worker, so
/// the returned future does not need to be `Send`.
#[async_trait::async_trait(?Send)]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: &mut Context<'_>) -> Result<(), BoxError>;
}

/// Adapter turning a plain function into a [`Handler`].
pub struct SyncHandler<F>(pub F);

#[async_trait::async_trait(?Send)]
impl<F> Handler for SyncHandler<F>
where
    F: for<'a, 'b> Fn(&'a mut Context<'b>) -> Result<(), BoxError> + Send + Sync + 'static,
{
    async fn call(&self, ctx: &mut Context<'_>) -> Result<(), BoxError> {
        (self.0)(ctx)
    }
}

/// Wrap a synchronous closure as a handler.
pub fn sync_handler<F>(f: F) -> SyncHandler<F>
where
    F: for<'a, 'b> Fn(&'a mut Context<'b>) -> Result<(), BoxError> + Send + Sync + 'static,
{
    SyncHandler(f)
}

/// Adapter for closures returning a boxed future borrowing the context.
pub struct AsyncHandler<F>(pub F);

#[async_trait::async_trait(?Send)]
impl<F> Handler for AsyncHandler<F>
where
    F: for<'a, 'b> Fn(&'a mut Context<'b>) -> LocalBoxFuture<'a, Result<(), BoxError>>
        + Send
        + Sync
        + 'static,
{
    async fn call(&self, ctx: &mut Context<'_>) -> Result<(), BoxError> {
        (self.0)(ctx).await
    }
}

/// Route registration failure.
#[derive(Debug, thiserror::Error)]
#[error("invalid route {path:?}: {source}")]
pub struct RouteError {
    path: String,
    #[source]
    source: matchit::InsertError,
}

/// A successful lookup: the handler plus extracted path parameters.
pub struct RouteMatch<'r, 'p> {
    pub handler: &'r dyn Handler,
    pub params: Vec<(&'r str, &'p str)>,
}

/// Method-keyed route tables.
pub struct Router {
    tables: HashMap<Method, matchit::Router<Arc<dyn Handler>>>,
}

impl Router {
    pub fn new() -> Router {
        Router {
            tables: HashMap::new(),
        }
    }

    /// Register a handler for `method` + `path`. Paths use `matchit`
    /// syntax: `/users/:id`, `/static/*rest`.
    pub fn route(
        &mut self,
        method: Method,
        path: &str,
        handler: impl Handler,
    ) -> Result<&mut Self, RouteError> {
        self.route_arc(method, path, Arc::new(handler))
    }

    /// Register an already-shared handler (e.g. one handler on two routes).
    pub fn route_arc(
        &mut self,
        method: Method,
        path: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<&mut Self, RouteError> {
        self.tables
            .entry(method)
            .or_insert_with(matchit::Router::new)
            .insert(path, handler)
            .map_err(|source| RouteError {
                path: path.to_string(),
                source,
            })?;
        Ok(self)
    }

    pub fn get(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, RouteError> {
        self.route(Method::Get, path, handler)
    }

    pub fn post(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, RouteError> {
        self.route(Method::Post, path, handler)
    }

    pub fn put(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, RouteError> {
        self.route(Method::Put, path, handler)
    }

    pub fn delete(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, RouteError> {
        self.route(Method::Delete, path, handler)
    }

    pub fn patch(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, RouteError> {
        self.route(Method::Patch, path, handler)
    }

    /// Look up a route. `HEAD` reuses the `GET` table when it has no route
    /// of its own; the connection suppresses the body on the way out.
    pub fn lookup<'r, 'p>(&'r self, method: Method, path: &'p str) -> Option<RouteMatch<'r, 'p>> {
        let direct = self.try_table(method, path);
        if direct.is_some() {
            return direct;
        }
        if method == Method::Head {
            return self.try_table(Method::Get, path);
        }
        None
    }

    fn try_table<'r, 'p>(&'r self, method: Method, path: &'p str) -> Option<RouteMatch<'r, 'p>> {
        let table = self.tables.get(&method)?;
        let matched = table.at(path).ok()?;
        Some(RouteMatch {
            handler: &**matched.value,
            params: matched.params.iter().collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parser::RequestParser;
    use crate::http::{Request, ResponseBuilder};
    use crate::pool::Arena;

    struct Probe(u16);

    #[async_trait::async_trait(?Send)]
    impl Handler for Probe {
        async fn call(&self, ctx: &mut Context<'_>) -> Result<(), BoxError> {
            ctx.response().status(self.0);
            Ok(())
        }
    }

    async fn invoke(m: &RouteMatch<'_, '_>) -> u16 {
        let mut parser = RequestParser::new();
        let buf: &[u8] = b"GET / HTTP/1.1\r\n\r\n";
        parser.parse(buf).unwrap();
        let request = Request::new(&parser, buf);
        let mut response = ResponseBuilder::new();
        let arena = Arena::with_capacity(64);
        let mut ctx = Context::new(&request, &mut response, m.params.clone(), &arena);
        m.handler.call(&mut ctx).await.unwrap();
        response.status_code()
    }

    #[tokio::test]
    async fn static_and_param_routes() {
        let mut router = Router::new();
        router.get("/health", Probe(200)).unwrap();
        router.get("/users/:id", Probe(201)).unwrap();

        let m = router.lookup(Method::Get, "/health").unwrap();
        assert_eq!(invoke(&m).await, 200);

        let m = router.lookup(Method::Get, "/users/42").unwrap();
        assert_eq!(m.params, vec![("id", "42")]);
        assert_eq!(invoke(&m).await, 201);

        assert!(router.lookup(Method::Get, "/nope").is_none());
        assert!(router.lookup(Method::Post, "/health").is_none());
    }

    #[tokio::test]
    async fn head_falls_back_to_get() {
        let mut router = Router::new();
        router.get("/doc", Probe(200)).unwrap();
        assert!(router.lookup(Method::Head, "/doc").is_some());
    }

    #[test]
    fn duplicate_route_is_an_error() {
        let mut router = Router::new();
        router.get("/a", Probe(200)).unwrap();
        assert!(router.get("/a", Probe(200)).is_err());
    }

    #[test]
    fn sync_handler_adapter() {
        let mut router = Router::new();
        router
            .get(
                "/s",
                sync_handler(|ctx: &mut Context<'_>| {
                    ctx.response().status(204);
                    Ok(())
                }),
            )
            .unwrap();
        assert!(router.lookup(Method::Get, "/s").is_some());
    }
}
