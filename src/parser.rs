// src/parser.rs
use crate::http::Request;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("request head is not valid UTF-8")]
    InvalidEncoding,
}

fn trim_ows(s: &str) -> &str {
    s.trim_matches(|c| c == ' ' || c == '\t')
}

/// Decode a complete request head (the reader guarantees the `\r\n\r\n`
/// terminator is present before calling).
///
/// The request line is whitespace-tokenized into method, path and version;
/// anything short of three fields fails. Header lines split at the first
/// colon, names are lowercased, values trimmed of spaces and tabs; a line
/// with no colon is skipped. Duplicate names keep the last value.
pub fn parse_request(head: &[u8]) -> Result<Request, ParseError> {
    let text = std::str::from_utf8(head).map_err(|_| ParseError::InvalidEncoding)?;
    let mut lines = text.split('\n');

    let request_line = lines
        .next()
        .ok_or(ParseError::MalformedRequestLine)?
        .trim_end_matches('\r');
    let mut fields = request_line.split_whitespace();
    let method = fields.next().ok_or(ParseError::MalformedRequestLine)?;
    let path = fields.next().ok_or(ParseError::MalformedRequestLine)?;
    let version = fields.next().ok_or(ParseError::MalformedRequestLine)?;

    let mut headers = HashMap::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        headers.insert(
            trim_ows(name).to_ascii_lowercase(),
            trim_ows(value).to_string(),
        );
    }

    let connection = headers
        .get("connection")
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();
    let keep_alive =
        connection == "keep-alive" || (version == "HTTP/1.1" && connection != "close");

    Ok(Request {
        method: method.to_string(),
        path: path.to_string(),
        version: version.to_string(),
        headers,
        body: Vec::new(),
        keep_alive,
    })
}
