//! Streaming request parser.
//!
//! Wraps `httparse` behind a resumable contract: feed it the connection's
//! read buffer after every socket read and it reports `NeedMore`,
//! `HeadersComplete`, or `Complete { consumed }`. All head slices are
//! recorded as offsets into the caller's buffer, so the eventual request
//! view borrows straight from pooled memory.
//!
//! Body framing follows RFC 7230: `Content-Length` bodies stay in place in
//! the read buffer; `Transfer-Encoding: chunked` bodies are de-chunked into
//! a parser-owned vector. Both framings at once is a client error.

use crate::http::request::{Method, Version};

/// Header-count cap handed to `httparse`.
pub const MAX_HEADERS: usize = 100;

/// Byte range into the connection read buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    #[inline]
    pub(crate) fn slice<'b>(&self, buf: &'b [u8]) -> &'b [u8] {
        &buf[self.start..self.end]
    }

    #[inline]
    pub(crate) fn str_slice<'b>(&self, buf: &'b [u8]) -> &'b str {
        // Spans for method/path/header names come from httparse `&str`s,
        // validated at parse time.
        std::str::from_utf8(self.slice(buf)).unwrap_or("")
    }
}

/// Progress report from [`RequestParser::parse`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseProgress {
    /// The buffer does not yet hold a full unit of progress.
    NeedMore,
    /// The head is fully parsed; a body is expected and incomplete.
    HeadersComplete,
    /// A full message is present; `consumed` buffer bytes belong to it.
    Complete { consumed: usize },
}

/// Client protocol errors. All of them answer 400 and close.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request head")]
    Malformed,
    #[error("too many request headers")]
    TooManyHeaders,
    #[error("unrecognized request method")]
    UnknownMethod,
    #[error("unsupported http version")]
    UnsupportedVersion,
    #[error("both content-length and chunked framing present")]
    ConflictingFraming,
    #[error("invalid content-length")]
    BadContentLength,
    #[error("invalid chunk framing")]
    BadChunk,
}

/// Parsed head: method/path/query/version plus header name/value spans.
pub(crate) struct ParsedHead {
    pub method: Method,
    pub path: Span,
    pub query: Option<Span>,
    pub version: Version,
    pub headers: Vec<(Span, Span)>,
    pub head_len: usize,
}

impl ParsedHead {
    /// First header value with the given name, case-insensitive.
    pub fn header<'b>(&self, buf: &'b [u8], name: &str) -> Option<&'b [u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.str_slice(buf).eq_ignore_ascii_case(name))
            .map(|(_, v)| v.slice(buf))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Framing {
    None,
    ContentLength(usize),
    Chunked,
}

/// Resumable parser state for one request on one connection.
pub struct RequestParser {
    head: Option<ParsedHead>,
    framing: Framing,
    headers_reported: bool,
    body_span: Option<Span>,
    decoded_body: Vec<u8>,
    /// Lower bound on the eventual body size, for early limit checks.
    body_lower_bound: usize,
    complete: bool,
    consumed: usize,
}

impl RequestParser {
    pub fn new() -> RequestParser {
        RequestParser {
            head: None,
            framing: Framing::None,
            headers_reported: false,
            body_span: None,
            decoded_body: Vec::new(),
            body_lower_bound: 0,
            complete: false,
            consumed: 0,
        }
    }

    /// Clear all state for the next request on a kept-alive connection.
    pub fn reset(&mut self) {
        self.head = None;
        self.framing = Framing::None;
        self.headers_reported = false;
        self.body_span = None;
        self.decoded_body.clear();
        self.body_lower_bound = 0;
        self.complete = false;
        self.consumed = 0;
    }

    /// True once the request head has been parsed.
    #[inline]
    pub fn headers_done(&self) -> bool {
        self.head.is_some()
    }

    /// Byte length of the parsed head, once available.
    #[inline]
    pub fn head_len(&self) -> Option<usize> {
        self.head.as_ref().map(|h| h.head_len)
    }

    /// Known lower bound on the body size (declared or decoded so far).
    #[inline]
    pub fn body_lower_bound(&self) -> usize {
        self.body_lower_bound
    }

    pub(crate) fn head(&self) -> Option<&ParsedHead> {
        self.head.as_ref()
    }

    pub(crate) fn body<'b>(&'b self, buf: &'b [u8]) -> &'b [u8] {
        match (self.body_span, self.framing) {
            (Some(span), _) => span.slice(buf),
            (None, Framing::Chunked) => &self.decoded_body,
            _ => &[],
        }
    }

    /// Advance over `buf` (the whole filled read buffer for the current
    /// request). Safe to call repeatedly with a growing buffer.
    pub fn parse(&mut self, buf: &[u8]) -> Result<ParseProgress, ParseError> {
        if self.complete {
            return Ok(ParseProgress::Complete {
                consumed: self.consumed,
            });
        }

        if self.head.is_none() {
            match self.parse_head(buf)? {
                true => {}
                false => return Ok(ParseProgress::NeedMore),
            }
        }

        let head_len = self.head.as_ref().map(|h| h.head_len).unwrap_or(0);
        match self.framing {
            Framing::None => {
                self.complete = true;
                self.consumed = head_len;
            }
            Framing::ContentLength(n) => {
                if buf.len() - head_len >= n {
                    self.body_span = Some(Span {
                        start: head_len,
                        end: head_len + n,
                    });
                    self.complete = true;
                    self.consumed = head_len + n;
                } else {
                    return Ok(self.body_pending());
                }
            }
            Framing::Chunked => match decode_chunked(&buf[head_len..])? {
                ChunkedStatus::Complete { body, used } => {
                    self.decoded_body = body;
                    self.body_lower_bound = self.decoded_body.len();
                    self.complete = true;
                    self.consumed = head_len + used;
                }
                ChunkedStatus::Partial { lower_bound } => {
                    self.body_lower_bound = lower_bound;
                    return Ok(self.body_pending());
                }
            },
        }

        Ok(ParseProgress::Complete {
            consumed: self.consumed,
        })
    }

    /// First report after the head lands is `HeadersComplete`, later ones
    /// are plain `NeedMore`.
    fn body_pending(&mut self) -> ParseProgress {
        if self.headers_reported {
            ParseProgress::NeedMore
        } else {
            self.headers_reported = true;
            ParseProgress::HeadersComplete
        }
    }

    /// Returns Ok(true) when the head is now available.
    fn parse_head(&mut self, buf: &[u8]) -> Result<bool, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let head_len = match req.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(false),
            Err(httparse::Error::TooManyHeaders) => return Err(ParseError::TooManyHeaders),
            Err(_) => return Err(ParseError::Malformed),
        };

        let method = Method::from_str(req.method.unwrap_or(""))
            .ok_or(ParseError::UnknownMethod)?;
        let version = match req.version {
            Some(0) => Version::Http10,
            Some(1) => Version::Http11,
            _ => return Err(ParseError::UnsupportedVersion),
        };

        let target = req.path.ok_or(ParseError::Malformed)?.as_bytes();
        let target_span = span_of(buf, target);
        let (path, query) = match target.iter().position(|&b| b == b'?') {
            Some(q) => (
                Span {
                    start: target_span.start,
                    end: target_span.start + q,
                },
                Some(Span {
                    start: target_span.start + q + 1,
                    end: target_span.end,
                }),
            ),
            None => (target_span, None),
        };

        let mut spans = Vec::with_capacity(req.headers.len());
        let mut content_length: Option<usize> = None;
        let mut chunked = false;
        for h in req.headers.iter() {
            let name = span_of(buf, h.name.as_bytes());
            let value = span_of(buf, h.value);
            if h.name.eq_ignore_ascii_case("content-length") {
                let v = std::str::from_utf8(h.value)
                    .ok()
                    .and_then(|s| s.trim().parse::<usize>().ok())
                    .ok_or(ParseError::BadContentLength)?;
                if content_length.replace(v).map_or(false, |prev| prev != v) {
                    return Err(ParseError::BadContentLength);
                }
            } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
                let v = std::str::from_utf8(h.value).map_err(|_| ParseError::Malformed)?;
                if v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")) {
                    chunked = true;
                }
            }
            spans.push((name, value));
        }

        self.framing = match (content_length, chunked) {
            (Some(_), true) => return Err(ParseError::ConflictingFraming),
            (Some(0), false) | (None, false) => Framing::None,
            (Some(n), false) => {
                self.body_lower_bound = n;
                Framing::ContentLength(n)
            }
            (None, true) => Framing::Chunked,
        };

        self.head = Some(ParsedHead {
            method,
            path,
            query,
            version,
            headers: spans,
            head_len,
        });
        Ok(true)
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn span_of(buf: &[u8], part: &[u8]) -> Span {
    let start = part.as_ptr() as usize - buf.as_ptr() as usize;
    Span {
        start,
        end: start + part.len(),
    }
}

// ============================================================================
// Chunked transfer decoding
// ============================================================================

enum ChunkedStatus {
    Complete { body: Vec<u8>, used: usize },
    Partial { lower_bound: usize },
}

/// Decode a chunked body from `input`. Restartable: on `Partial` the caller
/// re-invokes with a longer prefix of the same bytes.
fn decode_chunked(input: &[u8]) -> Result<ChunkedStatus, ParseError> {
    let mut pos = 0;
    let mut body = Vec::new();
    loop {
        let Some(line_len) = find_crlf(&input[pos..]) else {
            return Ok(ChunkedStatus::Partial {
                lower_bound: body.len(),
            });
        };
        let line = &input[pos..pos + line_len];
        // Strip chunk extensions.
        let size_digits = line
            .split(|&b| b == b';')
            .next()
            .unwrap_or(line);
        let size = parse_hex(size_digits).ok_or(ParseError::BadChunk)?;
        let data_start = pos + line_len + 2;

        if size == 0 {
            // Trailer section: skip header lines until the empty line.
            let mut tpos = data_start;
            loop {
                match find_crlf(&input[tpos..]) {
                    None => {
                        return Ok(ChunkedStatus::Partial {
                            lower_bound: body.len(),
                        })
                    }
                    Some(0) => {
                        return Ok(ChunkedStatus::Complete {
                            body,
                            used: tpos + 2,
                        })
                    }
                    Some(n) => tpos += n + 2,
                }
            }
        }

        if input.len() < data_start + size + 2 {
            // Declared-but-unreceived bytes still count toward limits.
            return Ok(ChunkedStatus::Partial {
                lower_bound: body.len() + size,
            });
        }
        body.extend_from_slice(&input[data_start..data_start + size]);
        if &input[data_start + size..data_start + size + 2] != b"\r\n" {
            return Err(ParseError::BadChunk);
        }
        pos = data_start + size + 2;
    }
}

#[inline]
fn find_crlf(input: &[u8]) -> Option<usize> {
    input.windows(2).position(|w| w == b"\r\n")
}

fn parse_hex(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() || digits.len() > 16 {
        return None;
    }
    let mut n: usize = 0;
    for &b in digits {
        let d = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        n = n.checked_mul(16)?.checked_add(d as usize)?;
    }
    Some(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_get() {
        let mut p = RequestParser::new();
        let buf = b"GET /hello?x=1 HTTP/1.1\r\nHost: a\r\n\r\n";
        let progress = p.parse(buf).unwrap();
        assert_eq!(
            progress,
            ParseProgress::Complete {
                consumed: buf.len()
            }
        );
        let head = p.head().unwrap();
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.path.str_slice(buf), "/hello");
        assert_eq!(head.query.unwrap().str_slice(buf), "x=1");
        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.header(buf, "HOST"), Some(&b"a"[..]));
    }

    #[test]
    fn incremental_headers() {
        let mut p = RequestParser::new();
        assert_eq!(p.parse(b"GET / HT").unwrap(), ParseProgress::NeedMore);
        assert!(!p.headers_done());
        let full = b"GET / HTTP/1.1\r\n\r\n";
        assert_eq!(
            p.parse(full).unwrap(),
            ParseProgress::Complete { consumed: 18 }
        );
    }

    #[test]
    fn content_length_body() {
        let mut p = RequestParser::new();
        let head = b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\n";
        assert_eq!(p.parse(head).unwrap(), ParseProgress::HeadersComplete);
        assert_eq!(p.body_lower_bound(), 5);

        let mut full = head.to_vec();
        full.extend_from_slice(b"hel");
        assert_eq!(p.parse(&full).unwrap(), ParseProgress::NeedMore);
        full.extend_from_slice(b"lo");
        let progress = p.parse(&full).unwrap();
        assert_eq!(
            progress,
            ParseProgress::Complete {
                consumed: full.len()
            }
        );
        assert_eq!(p.body(&full), b"hello");
    }

    #[test]
    fn chunked_body() {
        let mut p = RequestParser::new();
        let msg = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let progress = p.parse(msg).unwrap();
        assert_eq!(
            progress,
            ParseProgress::Complete {
                consumed: msg.len()
            }
        );
        assert_eq!(p.body(msg), b"hello world");
    }

    #[test]
    fn chunked_partial_reports_lower_bound() {
        let mut p = RequestParser::new();
        let partial = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nff\r\nabc";
        assert_eq!(p.parse(partial).unwrap(), ParseProgress::HeadersComplete);
        // A 0xff chunk was declared; limits see it before it arrives.
        assert_eq!(p.body_lower_bound(), 0xff);
    }

    #[test]
    fn chunk_extensions_and_trailers() {
        let mut p = RequestParser::new();
        let msg = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3;ext=1\r\nabc\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let progress = p.parse(msg).unwrap();
        assert_eq!(
            progress,
            ParseProgress::Complete {
                consumed: msg.len()
            }
        );
        assert_eq!(p.body(msg), b"abc");
    }

    #[test]
    fn conflicting_framing_rejected() {
        let mut p = RequestParser::new();
        let msg = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\nabc";
        assert_eq!(p.parse(msg), Err(ParseError::ConflictingFraming));
    }

    #[test]
    fn bad_content_length_rejected() {
        let mut p = RequestParser::new();
        let msg = b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n";
        assert_eq!(p.parse(msg), Err(ParseError::BadContentLength));
    }

    #[test]
    fn duplicate_differing_content_length_rejected() {
        let mut p = RequestParser::new();
        let msg = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n";
        assert_eq!(p.parse(msg), Err(ParseError::BadContentLength));
    }

    #[test]
    fn malformed_request_line_rejected() {
        let mut p = RequestParser::new();
        assert_eq!(p.parse(b"NOT A REQUEST\r\n\r\n"), Err(ParseError::Malformed));
    }

    #[test]
    fn reset_allows_next_request() {
        let mut p = RequestParser::new();
        let first = b"GET /a HTTP/1.1\r\n\r\n";
        p.parse(first).unwrap();
        p.reset();
        let second = b"GET /b HTTP/1.1\r\n\r\n";
        p.parse(second).unwrap();
        assert_eq!(p.head().unwrap().path.str_slice(second), "/b");
    }

    #[test]
    fn hex_parsing() {
        assert_eq!(parse_hex(b"0"), Some(0));
        assert_eq!(parse_hex(b"ff"), Some(255));
        assert_eq!(parse_hex(b"1A"), Some(26));
        assert_eq!(parse_hex(b""), None);
        assert_eq!(parse_hex(b"xyz"), None);
    }
}
