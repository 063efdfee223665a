//! Per-request context handed to middleware and handlers.

use std::any::Any;
use std::collections::HashMap;

use crate::http::{Request, ResponseBuilder};
use crate::pool::Arena;

/// Path parameters extracted by the router. Names borrow the route table,
/// values borrow the request path.
pub type PathParams<'a> = Vec<(&'a str, &'a str)>;

/// Everything a middleware or handler may touch for one request: the
/// borrowed request view, the response under construction, router path
/// parameters, a typed key/value store for passing data down the chain
/// (e.g. a decoded body from a validation middleware), and the request
/// arena for scratch allocations.
pub struct Context<'a> {
    request: &'a Request<'a>,
    response: &'a mut ResponseBuilder,
    params: PathParams<'a>,
    storage: HashMap<String, Box<dyn Any + Send>>,
    arena: &'a Arena,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        request: &'a Request<'a>,
        response: &'a mut ResponseBuilder,
        params: PathParams<'a>,
        arena: &'a Arena,
    ) -> Context<'a> {
        Context {
            request,
            response,
            params,
            storage: HashMap::new(),
            arena,
        }
    }

    #[inline]
    pub fn request(&self) -> &Request<'a> {
        self.request
    }

    #[inline]
    pub fn response(&mut self) -> &mut ResponseBuilder {
        self.response
    }

    /// Named path parameter from the matched route.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }

    pub fn params(&self) -> &[(&'a str, &'a str)] {
        &self.params
    }

    /// Store a typed value for later pipeline steps.
    pub fn set<T: Any + Send>(&mut self, key: &str, value: T) {
        self.storage.insert(key.to_string(), Box::new(value));
    }

    pub fn get<T: Any + Send>(&self, key: &str) -> Option<&T> {
        self.storage.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn get_mut<T: Any + Send>(&mut self, key: &str) -> Option<&mut T> {
        self.storage.get_mut(key).and_then(|v| v.downcast_mut())
    }

    pub fn remove<T: Any + Send>(&mut self, key: &str) -> Option<T> {
        self.storage
            .remove(key)
            .and_then(|v| v.downcast().ok())
            .map(|b| *b)
    }

    /// Request-scoped bump allocator; reset after the response is written.
    #[inline]
    pub fn arena(&self) -> &'a Arena {
        self.arena
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parser::RequestParser;

    #[test]
    fn storage_round_trip() {
        let mut parser = RequestParser::new();
        let buf: &[u8] = b"GET /u/42 HTTP/1.1\r\n\r\n";
        parser.parse(buf).unwrap();
        let request = Request::new(&parser, buf);
        let mut response = ResponseBuilder::new();
        let arena = Arena::with_capacity(256);
        let mut ctx = Context::new(&request, &mut response, vec![("id", "42")], &arena);

        assert_eq!(ctx.param("id"), Some("42"));
        assert_eq!(ctx.param("missing"), None);

        ctx.set("user", 7u64);
        assert_eq!(ctx.get::<u64>("user"), Some(&7));
        assert_eq!(ctx.get::<String>("user"), None);
        assert_eq!(ctx.remove::<u64>("user"), Some(7));
        assert!(ctx.get::<u64>("user").is_none());

        let scratch = ctx.arena().alloc_str("decoded").unwrap();
        assert_eq!(scratch, "decoded");
        ctx.response().status(201);
        assert_eq!(response.status_code(), 201);
    }
}
