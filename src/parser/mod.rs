//! HTTP method/version/status vocabulary and the H1 parser (`h1`).
//!
//! Grounded on `rask`'s `parser` module (`parser/method.rs`, `parser/version.rs`,
//! `parser/status.rs`): the same enum shapes, trimmed to the methods and
//! statuses this crate actually emits or accepts.

use std::fmt;

pub mod h1;

/// HTTP request method. Per spec.md §6, only `Get` and `Post` are routable;
/// anything else reaches the route closure and is rejected with 501.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    fn from_bytes(bytes: &[u8]) -> Option<Method> {
        Some(match bytes {
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"CONNECT" => Method::Connect,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"PATCH" => Method::Patch,
            _ => return None,
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        })
    }
}

/// HTTP version carried on the request/status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        })
    }
}

/// Status codes this crate has occasion to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Continue = 100,
    Ok = 200,
    NoContent = 204,
    NotFound = 404,
    NotImplemented = 501,
    InternalServerError = 500,
}

impl Status {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Continue => "Continue",
            Status::Ok => "OK",
            Status::NoContent => "No Content",
            Status::NotFound => "Not Found",
            Status::NotImplemented => "Not Implemented",
            Status::InternalServerError => "Internal Server Error",
        }
    }

    /// Builds a `Status` from an arbitrary handler-supplied code (§6: "a
    /// 100-599 integer"), falling back to 500 for out-of-range values so a
    /// malformed handler response never propagates an invalid status line.
    pub fn from_handler_code(code: u16) -> (u16, &'static str) {
        if (100..=599).contains(&code) {
            (code, reason_for_code(code))
        } else {
            (500, Status::InternalServerError.reason())
        }
    }
}

fn reason_for_code(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// Failures raised while parsing an H1 request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    Method,
    Target,
    Version,
    Header,
    TooLarge,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ParseError::Method => "malformed request method",
            ParseError::Target => "malformed request target",
            ParseError::Version => "malformed request version",
            ParseError::Header => "malformed header line",
            ParseError::TooLarge => "request exceeds the configured size limit",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ParseError {}

/// Progress made by one call to [`h1::Request::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Complete,
    Partial,
}

pub type ParseResult<T> = Result<Progress, ParseError>;
