//! Error taxonomy and typed error-handler dispatch.
//!
//! Connection-level failures are [`ConnectionError`]; handler and
//! middleware failures are a [`BoxError`] that flows back through the
//! pipeline and into the [`ErrorHandlers`] registry. In this runtime an
//! "exception type" is a concrete `std::error::Error` type, and the
//! ancestry walk of a classic exception hierarchy becomes a walk of the
//! error's `source()` chain: the most-derived (outermost) error is
//! consulted first, then each wrapped cause.

use std::any::TypeId;
use std::error::Error as StdError;

use crate::context::Context;

/// Application-level error type carried through middleware and handlers.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Failures owned by the connection state machine.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Client sent bytes that do not form a valid request.
    #[error("protocol error: {0}")]
    Protocol(#[from] crate::http::ParseError),
    /// Header block exceeded `max_header_size`.
    #[error("request header block too large")]
    HeadersTooLarge,
    /// Declared or received body exceeded `max_body_size`.
    #[error("request body too large")]
    BodyTooLarge,
    /// No full request arrived within the read deadline.
    #[error("read timed out")]
    ReadTimeout,
    /// The response could not be flushed within the write deadline.
    #[error("write timed out")]
    WriteTimeout,
    /// Peer hung up in the middle of a message.
    #[error("peer closed connection mid-message")]
    UnexpectedEof,
    /// Connection force-closed because the shutdown deadline passed.
    #[error("closed by shutdown deadline")]
    ShutdownDeadline,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Status code to answer with, when a response is still possible.
    pub fn status(&self) -> Option<u16> {
        match self {
            ConnectionError::Protocol(_) => Some(400),
            ConnectionError::HeadersTooLarge => Some(431),
            ConnectionError::BodyTooLarge => Some(413),
            ConnectionError::ReadTimeout => Some(408),
            ConnectionError::WriteTimeout
            | ConnectionError::UnexpectedEof
            | ConnectionError::ShutdownDeadline
            | ConnectionError::Io(_) => None,
        }
    }
}

// ============================================================================
// Typed handler registry
// ============================================================================

type DynHandler = Box<dyn Fn(&mut Context<'_>, &(dyn StdError + 'static)) + Send + Sync>;

struct Registration {
    type_id: TypeId,
    matches: fn(&(dyn StdError + 'static)) -> bool,
    invoke: DynHandler,
}

/// Registry mapping concrete error types to response-shaping handlers.
///
/// Dispatch order for an error `e`:
/// 1. a handler registered for `e`'s own type;
/// 2. walking `e.source()`, the first handler matching a wrapped cause;
/// 3. none: the caller falls back to a generic 500 and the onError hooks.
///
/// Registration is only honored before the server starts listening; the
/// registry is read-only on the hot path.
#[derive(Default)]
pub struct ErrorHandlers {
    handlers: Vec<Registration>,
}

impl ErrorHandlers {
    pub fn new() -> ErrorHandlers {
        ErrorHandlers {
            handlers: Vec::new(),
        }
    }

    /// Register a handler for the concrete error type `E`. Registering the
    /// same type again replaces the earlier handler.
    pub fn register<E, F>(&mut self, handler: F)
    where
        E: StdError + 'static,
        F: Fn(&mut Context<'_>, &E) + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<E>();
        self.handlers.retain(|r| r.type_id != type_id);
        self.handlers.push(Registration {
            type_id,
            matches: |err| err.is::<E>(),
            invoke: Box::new(move |ctx, err| {
                if let Some(typed) = err.downcast_ref::<E>() {
                    handler(ctx, typed);
                }
            }),
        });
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch `err` against the registry. Returns `true` when a handler
    /// claimed the error and shaped the response.
    pub fn dispatch(&self, ctx: &mut Context<'_>, err: &(dyn StdError + 'static)) -> bool {
        // Exact type first, then each wrapped cause, outermost to innermost.
        let mut current: Option<&(dyn StdError + 'static)> = Some(err);
        while let Some(e) = current {
            if let Some(reg) = self.handlers.iter().find(|r| (r.matches)(e)) {
                (reg.invoke)(ctx, e);
                return true;
            }
            current = e.source();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parser::RequestParser;
    use crate::http::{Request, ResponseBuilder};
    use crate::pool::Arena;

    #[derive(Debug, thiserror::Error)]
    #[error("validation failed: {0}")]
    struct ValidationError(String);

    #[derive(Debug, thiserror::Error)]
    #[error("database failure")]
    struct DbError;

    /// Wrapper error whose cause is a ValidationError, standing in for a
    /// derived exception type.
    #[derive(Debug, thiserror::Error)]
    #[error("request rejected")]
    struct RejectedError(#[source] ValidationError);

    fn with_ctx(f: impl FnOnce(&mut Context<'_>)) -> ResponseBuilder {
        let mut parser = RequestParser::new();
        let buf: &[u8] = b"GET / HTTP/1.1\r\n\r\n";
        parser.parse(buf).unwrap();
        let request = Request::new(&parser, buf);
        let mut response = ResponseBuilder::new();
        let arena = Arena::with_capacity(64);
        let mut ctx = Context::new(&request, &mut response, Vec::new(), &arena);
        f(&mut ctx);
        response
    }

    #[test]
    fn exact_type_match() {
        let mut handlers = ErrorHandlers::new();
        handlers.register::<ValidationError, _>(|ctx, err| {
            ctx.response()
                .status(400)
                .json(&serde_json::json!({"error": err.0}));
        });

        let response = with_ctx(|ctx| {
            let err = ValidationError("bad".into());
            assert!(handlers.dispatch(ctx, &err));
        });
        assert_eq!(response.status_code(), 400);
        assert_eq!(response.body_bytes(), b"{\"error\":\"bad\"}");
    }

    #[test]
    fn source_chain_walk_prefers_outermost() {
        let mut handlers = ErrorHandlers::new();
        handlers.register::<ValidationError, _>(|ctx, _| {
            ctx.response().status(400);
        });

        // RejectedError itself has no handler; its cause does.
        let response = with_ctx(|ctx| {
            let err = RejectedError(ValidationError("nested".into()));
            assert!(handlers.dispatch(ctx, &err));
        });
        assert_eq!(response.status_code(), 400);

        // With a handler for the outer type too, the outer one wins.
        handlers.register::<RejectedError, _>(|ctx, _| {
            ctx.response().status(422);
        });
        let response = with_ctx(|ctx| {
            let err = RejectedError(ValidationError("nested".into()));
            assert!(handlers.dispatch(ctx, &err));
        });
        assert_eq!(response.status_code(), 422);
    }

    #[test]
    fn unmatched_error_reports_false() {
        let mut handlers = ErrorHandlers::new();
        handlers.register::<ValidationError, _>(|ctx, _| {
            ctx.response().status(400);
        });
        let response = with_ctx(|ctx| {
            assert!(!handlers.dispatch(ctx, &DbError));
        });
        assert_eq!(response.status_code(), 200);
    }

    #[test]
    fn reregistration_replaces() {
        let mut handlers = ErrorHandlers::new();
        handlers.register::<DbError, _>(|ctx, _| {
            ctx.response().status(500);
        });
        handlers.register::<DbError, _>(|ctx, _| {
            ctx.response().status(503);
        });
        assert_eq!(handlers.len(), 1);
        let response = with_ctx(|ctx| {
            assert!(handlers.dispatch(ctx, &DbError));
        });
        assert_eq!(response.status_code(), 503);
    }

    #[test]
    fn connection_error_statuses() {
        assert_eq!(ConnectionError::HeadersTooLarge.status(), Some(431));
        assert_eq!(ConnectionError::BodyTooLarge.status(), Some(413));
        assert_eq!(ConnectionError::ReadTimeout.status(), Some(408));
        assert_eq!(ConnectionError::UnexpectedEof.status(), None);
    }
}
