//! Borrowed request views.
//!
//! A [`Request`] is a window over the connection's pooled read buffer: the
//! path, headers, and (content-length) body are slices into it. The view
//! dies when the connection moves past the current request; the borrow
//! checker enforces that no view survives a parser reset.

use crate::http::parser::{ParsedHead, RequestParser};

/// Request methods the runtime recognizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Trace,
    Connect,
}

impl Method {
    pub fn from_str(s: &str) -> Option<Method> {
        match s {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "PATCH" => Some(Method::Patch),
            "OPTIONS" => Some(Method::Options),
            "TRACE" => Some(Method::Trace),
            "CONNECT" => Some(Method::Connect),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP versions the runtime speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// A parsed request, borrowing the connection's read buffer.
pub struct Request<'b> {
    buf: &'b [u8],
    head: &'b ParsedHead,
    body: &'b [u8],
    keep_alive: bool,
}

impl<'b> Request<'b> {
    /// Build a view over a completed parse.
    pub(crate) fn new(parser: &'b RequestParser, buf: &'b [u8]) -> Request<'b> {
        let head = parser.head().expect("request view before headers");
        let keep_alive = derive_keep_alive(head, buf);
        Request {
            buf,
            head,
            body: parser.body(buf),
            keep_alive,
        }
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.head.method
    }

    #[inline]
    pub fn path(&self) -> &'b str {
        self.head.path.str_slice(self.buf)
    }

    /// Raw query string without the `?`, if present.
    #[inline]
    pub fn query(&self) -> Option<&'b str> {
        self.head.query.map(|s| s.str_slice(self.buf))
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.head.version
    }

    /// First value of the named header, case-insensitive, if valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&'b str> {
        self.header_bytes(name)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// First value of the named header as raw bytes.
    pub fn header_bytes(&self, name: &str) -> Option<&'b [u8]> {
        self.head.header(self.buf, name)
    }

    /// Iterate headers in wire order.
    pub fn headers(&self) -> impl Iterator<Item = (&'b str, &'b [u8])> + '_ {
        self.head
            .headers
            .iter()
            .map(|(n, v)| (n.str_slice(self.buf), v.slice(self.buf)))
    }

    pub fn header_count(&self) -> usize {
        self.head.headers.len()
    }

    #[inline]
    pub fn body(&self) -> &'b [u8] {
        self.body
    }

    /// Whether this request asks for connection reuse.
    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Whether the client sent `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.header("expect")
            .map_or(false, |v| v.trim().eq_ignore_ascii_case("100-continue"))
    }
}

/// Keep-alive from version + `Connection` header. An absent or empty header
/// means keep-alive on HTTP/1.1 and close on HTTP/1.0.
pub(crate) fn derive_keep_alive(head: &ParsedHead, buf: &[u8]) -> bool {
    let default = head.version == Version::Http11;
    match head.header(buf, "connection") {
        Some(v) => {
            let v = std::str::from_utf8(v).unwrap_or("");
            let mut saw_token = false;
            for token in v.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    return false;
                }
                if token.eq_ignore_ascii_case("keep-alive") {
                    saw_token = true;
                }
            }
            saw_token || default
        }
        None => default,
    }
}
