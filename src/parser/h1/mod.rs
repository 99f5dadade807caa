//! HTTP/1.1 request parsing and response serialization, operating on owned
//! bytes accumulated in a [`crate::buffer::Buffer`] rather than the teacher's
//! `&'buf str` zero-copy fields — a session's buffer gets compacted between
//! reads, so a borrowed `Header<'buf>` would not outlive the next `fill`.
//! The method/version/status vocabulary is unchanged from `parser::mod`.

use std::collections::HashMap;

use crate::buffer::Buffer;
use crate::parser::{Method, ParseError, ParseResult, Progress, Status, Version};

const MAX_REQUEST_LINE_AND_HEADERS: usize = 64 * 1024;

/// A parsed (or partially parsed) HTTP/1.1 request.
#[derive(Debug, Default)]
pub struct Request {
    pub method: Option<Method>,
    pub target: String,
    pub version: Option<Version>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    body_expected: usize,
    headers_complete: bool,
}

impl Request {
    pub fn new() -> Self {
        Request::default()
    }

    /// Parses as much of `buf` as forms complete lines; consumes exactly the
    /// bytes it used. Returns [`Progress::Complete`] once the start-line,
    /// headers, and (if declared) the full body have been parsed.
    pub fn parse(&mut self, buf: &mut Buffer) -> ParseResult<Progress> {
        if !self.headers_complete {
            if !self.parse_head(buf)? {
                return Ok(Progress::Partial);
            }
        }

        if self.body_expected > 0 {
            let available = buf.remaining().len().min(self.body_expected - self.body.len());
            if available > 0 {
                self.body.extend_from_slice(&buf.remaining()[..available]);
                buf.consume(available);
            }
            if self.body.len() < self.body_expected {
                return Ok(Progress::Partial);
            }
        }

        Ok(Progress::Complete)
    }

    /// Returns true once the request line and headers have been fully
    /// consumed, leaving `buf`'s cursor at the start of the body.
    fn parse_head(&mut self, buf: &mut Buffer) -> ParseResult<bool> {
        let Some(header_end) = find_double_crlf(buf.remaining()) else {
            if buf.remaining().len() > MAX_REQUEST_LINE_AND_HEADERS {
                return Err(ParseError::TooLarge);
            }
            return Ok(false);
        };

        let head = buf.remaining()[..header_end].to_vec();
        buf.consume(header_end + 4);

        let mut lines = head.split(|&b| b == b'\n').map(strip_cr);
        let request_line = lines.next().ok_or(ParseError::Method)?;
        self.parse_request_line(request_line)?;

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = split_header(line)?;
            self.headers.insert(name, value);
        }

        self.body_expected = self
            .headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        self.headers_complete = true;
        Ok(true)
    }

    fn parse_request_line(&mut self, line: &[u8]) -> ParseResult<()> {
        let mut parts = line.split(|&b| b == b' ');
        let method = parts.next().ok_or(ParseError::Method)?;
        let target = parts.next().ok_or(ParseError::Target)?;
        let version = parts.next().ok_or(ParseError::Version)?;

        self.method = Some(Method::from_bytes(method).ok_or(ParseError::Method)?);
        self.target = std::str::from_utf8(target)
            .map_err(|_| ParseError::Target)?
            .to_string();
        self.version = Some(match version {
            b"HTTP/1.1" => Version::Http11,
            b"HTTP/1.0" => Version::Http10,
            _ => return Err(ParseError::Version),
        });
        Ok(())
    }

    /// True once `parse` reached [`Progress::Complete`] and `take` has not
    /// yet reset this request for a subsequent pipelined request.
    pub fn is_complete(&self) -> bool {
        self.headers_complete && self.body.len() >= self.body_expected
    }

    /// True if the client declared `Expect: 100-continue`; sessions send the
    /// interim response before reading the body (spec.md §4.8).
    pub fn expects_continue(&self) -> bool {
        self.headers
            .get("expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    }

    /// Resets this request in place so the same allocation can be reused for
    /// the next pipelined request on the connection.
    pub fn reset(&mut self) {
        self.method = None;
        self.target.clear();
        self.version = None;
        self.headers.clear();
        self.body.clear();
        self.body_expected = 0;
        self.headers_complete = false;
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.strip_suffix(b"\r") {
        Some(stripped) => stripped,
        None => line,
    }
}

fn split_header(line: &[u8]) -> ParseResult<(String, String)> {
    let colon = line.iter().position(|&b| b == b':').ok_or(ParseError::Header)?;
    let name = std::str::from_utf8(&line[..colon])
        .map_err(|_| ParseError::Header)?
        .trim()
        .to_ascii_lowercase();
    let value = std::str::from_utf8(&line[colon + 1..])
        .map_err(|_| ParseError::Header)?
        .trim()
        .to_string();
    if name.is_empty() {
        return Err(ParseError::Header);
    }
    Ok((name, value))
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// A response built by a route closure and serialized by the session.
#[derive(Debug)]
pub struct Response {
    pub version: Version,
    pub status_code: u16,
    pub status_reason: &'static str,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(version: Version, status: Status) -> Self {
        Response {
            version,
            status_code: status.code(),
            status_reason: status.reason(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    /// Builds a response from handler-supplied fields (§6's handler→core
    /// contract): an arbitrary status integer, a header mapping, and a body.
    pub fn from_handler(version: Version, status: u16, headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        let (status_code, status_reason) = Status::from_handler_code(status);
        Response {
            version,
            status_code,
            status_reason,
            headers,
            body,
        }
    }

    /// Adds the default `server` header if the handler did not set one
    /// (§8 property 8).
    pub fn ensure_server_header(&mut self, product: &str) {
        self.headers
            .entry("server".to_string())
            .or_insert_with(|| product.to_string());
    }

    /// Serializes the status line, headers, and body into wire bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(format!("{} {} {}\r\n", self.version, self.status_code, self.status_reason).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !self.headers.contains_key("content-length") {
            out.extend_from_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let mut buf = Buffer::new();
        buf.extend(b"GET /a/b HTTP/1.1\r\nHost: example.test\r\n\r\n");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf).unwrap(), Progress::Complete);
        assert_eq!(req.method, Some(Method::Get));
        assert_eq!(req.target, "/a/b");
        assert_eq!(req.headers.get("host"), Some(&"example.test".to_string()));
    }

    #[test]
    fn partial_head_reports_partial() {
        let mut buf = Buffer::new();
        buf.extend(b"GET / HTTP/1.1\r\nHost: ex");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf).unwrap(), Progress::Partial);
    }

    #[test]
    fn waits_for_declared_body() {
        let mut buf = Buffer::new();
        buf.extend(b"POST / HTTP/1.1\r\ncontent-length: 5\r\n\r\nhel");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf).unwrap(), Progress::Partial);
        buf.extend(b"lo");
        assert_eq!(req.parse(&mut buf).unwrap(), Progress::Complete);
        assert_eq!(req.body, b"hello");
    }

    #[test]
    fn detects_expect_continue() {
        let mut buf = Buffer::new();
        buf.extend(b"POST / HTTP/1.1\r\nExpect: 100-continue\r\ncontent-length: 0\r\n\r\n");
        let mut req = Request::new();
        req.parse(&mut buf).unwrap();
        assert!(req.expects_continue());
    }

    #[test]
    fn response_adds_default_server_header() {
        let mut response = Response::new(Version::Http11, Status::Ok);
        response.ensure_server_header("fiberweb/0.1");
        assert_eq!(response.headers.get("server"), Some(&"fiberweb/0.1".to_string()));
        let wire = response.serialize();
        assert!(wire.starts_with(b"HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn handler_response_rejects_out_of_range_status() {
        let response = Response::from_handler(Version::Http11, 9999, HashMap::new(), Vec::new());
        assert_eq!(response.status_code, 500);
    }
}
