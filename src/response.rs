// src/response.rs
use std::fmt::Write;

pub const SERVER_TOKEN: &str = concat!("presto/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    NotFound,
    InternalError,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::InternalError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::InternalError => "Internal Server Error",
        }
    }
}

/// Serialize one wire-ready HTTP/1.1 response: status line, default
/// headers, blank line, body verbatim.
pub fn build(status: StatusCode, body: &[u8], keep_alive: bool) -> Vec<u8> {
    let mut head = String::with_capacity(192);
    let _ = write!(head, "HTTP/1.1 {} {}\r\n", status.code(), status.reason());
    let _ = write!(head, "Server: {}\r\n", SERVER_TOKEN);
    if keep_alive {
        head.push_str("Connection: keep-alive\r\n");
        head.push_str("Keep-Alive: timeout=5, max=1000\r\n");
    } else {
        head.push_str("Connection: close\r\n");
    }
    let _ = write!(head, "Content-Length: {}\r\n", body.len());
    head.push_str("Content-Type: text/html; charset=utf-8\r\n\r\n");

    let mut wire = head.into_bytes();
    wire.extend_from_slice(body);
    wire
}
