//! Response construction and wire serialization.
//!
//! Handlers fill a [`ResponseBuilder`]; the connection serializes it into a
//! pooled write buffer with [`ResponseBuilder::build_into`]. Serialization
//! never truncates: when the buffer is too small it returns 0 and the
//! caller retries with the next bucket up.

use bytes::Bytes;

use crate::http::status::reason_phrase;

/// Status, ordered headers, and body for one response.
pub struct ResponseBuilder {
    status: u16,
    reason: Option<&'static str>,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl ResponseBuilder {
    pub fn new() -> ResponseBuilder {
        ResponseBuilder {
            status: 200,
            reason: None,
            headers: Vec::with_capacity(8),
            body: Bytes::new(),
        }
    }

    /// Scrub all state for reuse on the next request.
    pub fn reset(&mut self) {
        self.status = 200;
        self.reason = None;
        self.headers.clear();
        self.body = Bytes::new();
    }

    #[inline]
    pub fn status(&mut self, code: u16) -> &mut Self {
        self.status = code;
        self
    }

    #[inline]
    pub fn status_code(&self) -> u16 {
        self.status
    }

    /// Override the standard reason phrase.
    pub fn reason(&mut self, reason: &'static str) -> &mut Self {
        self.reason = Some(reason);
        self
    }

    /// Append a header, preserving insertion order.
    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Replace every occurrence of `name`, or append if absent.
    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.header(name, value)
    }

    pub fn remove_header(&mut self, name: &str) -> &mut Self {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self
    }

    /// First value of the named header, case-insensitive.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Whether the handler demanded this connection close.
    pub fn wants_close(&self) -> bool {
        self.get_header("connection")
            .map_or(false, |v| v.trim().eq_ignore_ascii_case("close"))
    }

    #[inline]
    pub fn body(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.body = body.into();
        self
    }

    /// Set a JSON body and content type.
    pub fn json<T: serde::Serialize>(&mut self, value: &T) -> &mut Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.set_header("Content-Type", "application/json");
                self.body = Bytes::from(bytes);
            }
            Err(err) => {
                tracing::error!(%err, "response json serialization failed");
                self.status = 500;
                self.body = Bytes::from_static(b"{\"error\":\"serialization failed\"}");
            }
        }
        self
    }

    #[inline]
    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    #[inline]
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Serialized size of the head + body, for picking a write bucket.
    pub fn wire_size_hint(&self) -> usize {
        let mut n = 16 + reason_len(self.status, self.reason); // status line
        for (name, value) in &self.headers {
            n += name.len() + value.len() + 4;
        }
        n += 48; // Content-Length line we may add
        n + 2 + self.body.len()
    }

    /// Serialize the response into `buf`.
    ///
    /// `Content-Length` is derived from the body unless the caller set one.
    /// With `include_body` false (HEAD) the head still advertises the real
    /// length but the body bytes are suppressed.
    ///
    /// Returns the number of bytes written, or 0 when `buf` cannot hold the
    /// full response; the caller upgrades to a larger buffer and retries.
    /// Never truncates.
    pub fn build_into(&self, buf: &mut crate::pool::Buffer, include_body: bool) -> usize {
        buf.clear();

        // Status line.
        let reason = self.reason.unwrap_or_else(|| reason_phrase(self.status));
        let mut scratch = [0u8; 20];
        if !(buf.extend_from_slice(b"HTTP/1.1 ")
            && buf.extend_from_slice(fmt_int(self.status as usize, &mut scratch))
            && buf.extend_from_slice(b" ")
            && buf.extend_from_slice(reason.as_bytes())
            && buf.extend_from_slice(b"\r\n"))
        {
            return 0;
        }

        // Headers, in insertion order.
        for (name, value) in &self.headers {
            if !(buf.extend_from_slice(name.as_bytes())
                && buf.extend_from_slice(b": ")
                && buf.extend_from_slice(value.as_bytes())
                && buf.extend_from_slice(b"\r\n"))
            {
                return 0;
            }
        }

        if self.get_header("content-length").is_none() {
            let mut scratch = [0u8; 20];
            if !(buf.extend_from_slice(b"Content-Length: ")
                && buf.extend_from_slice(fmt_int(self.body.len(), &mut scratch))
                && buf.extend_from_slice(b"\r\n"))
            {
                return 0;
            }
        }

        if !buf.extend_from_slice(b"\r\n") {
            return 0;
        }

        if include_body && !buf.extend_from_slice(&self.body) {
            return 0;
        }

        buf.len()
    }
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn reason_len(status: u16, reason: Option<&'static str>) -> usize {
    reason.unwrap_or_else(|| reason_phrase(status)).len()
}

/// Render `n` into `scratch`, returning the digit slice.
fn fmt_int(mut n: usize, scratch: &mut [u8; 20]) -> &[u8] {
    let mut i = scratch.len();
    loop {
        i -= 1;
        scratch[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    &scratch[i..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Buffer;

    fn render(resp: &ResponseBuilder) -> String {
        let mut buf = Buffer::with_capacity(4096);
        let n = resp.build_into(&mut buf, true);
        assert!(n > 0);
        String::from_utf8(buf.as_slice().to_vec()).unwrap()
    }

    #[test]
    fn plaintext_response_wire_format() {
        let mut resp = ResponseBuilder::new();
        resp.status(200)
            .header("Content-Type", "text/plain")
            .body("Hello, World!");
        let wire = render(&resp);
        assert_eq!(
            wire,
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 13\r\n\r\nHello, World!"
        );
    }

    #[test]
    fn explicit_content_length_is_kept() {
        let mut resp = ResponseBuilder::new();
        resp.status(204).set_header("Content-Length", "0");
        let wire = render(&resp);
        assert_eq!(wire.matches("Content-Length").count(), 1);
        assert!(wire.starts_with("HTTP/1.1 204 No Content\r\n"));
    }

    #[test]
    fn undersized_buffer_returns_zero() {
        let mut resp = ResponseBuilder::new();
        resp.status(200).body(vec![b'x'; 2048]);
        let mut small = Buffer::with_capacity(1024);
        assert_eq!(resp.build_into(&mut small, true), 0);

        let mut big = Buffer::with_capacity(4096);
        let n = resp.build_into(&mut big, true);
        assert!(n > 2048);
    }

    #[test]
    fn head_suppresses_body_keeps_length() {
        let mut resp = ResponseBuilder::new();
        resp.status(200).body("payload");
        let mut buf = Buffer::with_capacity(1024);
        let n = resp.build_into(&mut buf, false);
        let wire = String::from_utf8(buf.as_slice()[..n].to_vec()).unwrap();
        assert!(wire.contains("Content-Length: 7"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn set_header_replaces_all() {
        let mut resp = ResponseBuilder::new();
        resp.header("X-A", "1").header("x-a", "2").set_header("X-A", "3");
        assert_eq!(resp.headers().count(), 1);
        assert_eq!(resp.get_header("x-a"), Some("3"));
    }

    #[test]
    fn wants_close_detects_handler_intent() {
        let mut resp = ResponseBuilder::new();
        assert!(!resp.wants_close());
        resp.set_header("Connection", "close");
        assert!(resp.wants_close());
    }

    #[test]
    fn json_body_sets_content_type() {
        let mut resp = ResponseBuilder::new();
        resp.status(400).json(&serde_json::json!({"error": "bad"}));
        let wire = render(&resp);
        assert!(wire.contains("Content-Type: application/json"));
        assert!(wire.ends_with("{\"error\":\"bad\"}"));
    }

    #[test]
    fn reset_scrubs_state() {
        let mut resp = ResponseBuilder::new();
        resp.status(500).header("X", "y").body("zz");
        resp.reset();
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.headers().count(), 0);
        assert_eq!(resp.body_len(), 0);
    }

    #[test]
    fn integer_rendering() {
        let mut scratch = [0u8; 20];
        assert_eq!(fmt_int(0, &mut scratch), b"0");
        let mut scratch = [0u8; 20];
        assert_eq!(fmt_int(13, &mut scratch), b"13");
        let mut scratch = [0u8; 20];
        assert_eq!(fmt_int(10_485_760, &mut scratch), b"10485760");
    }
}
