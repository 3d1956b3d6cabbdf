//! HTTP/1.1 message framing over the simulated byte stream.
//!
//! Messages travel as text. A message is complete once the blank line
//! terminating the header block has arrived; everything after it is the
//! body. Framing is deliberately forgiving about header junk but strict
//! about the start line, which is what decides request vs. response.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

const KNOWN_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH"];

pub const USER_AGENT: &str = "NetworkSimulator/1.0";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpParseError {
    /// Header block not yet terminated; feed more bytes.
    #[error("message incomplete, waiting for end of headers")]
    Incomplete,
    #[error("malformed start line: {0:?}")]
    MalformedStart(String),
    #[error("malformed status code: {0:?}")]
    MalformedStatus(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpMessage {
    Request(HttpRequest),
    Response(HttpResponse),
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.path, self.version)
    }
}

impl fmt::Display for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.version, self.status, self.reason)
    }
}

/// Parse one message out of the accumulated stream text.
///
/// Returns [`HttpParseError::Incomplete`] until the `\r\n\r\n` header
/// terminator has arrived, so callers can keep buffering segment payloads
/// and retry after each delivery.
pub fn parse_message(raw: &str) -> Result<HttpMessage, HttpParseError> {
    let Some(header_end) = raw.find("\r\n\r\n") else {
        return Err(HttpParseError::Incomplete);
    };
    let head = &raw[..header_end];
    let body = raw[header_end + 4..].to_string();

    let mut lines = head.split("\r\n");
    let start = lines.next().unwrap_or_default();
    let headers = parse_headers(lines);

    if start.starts_with("HTTP/") {
        let (version, status, reason) = parse_status_line(start)?;
        Ok(HttpMessage::Response(HttpResponse {
            version,
            status,
            reason,
            headers,
            body,
        }))
    } else {
        let (method, path, version) = parse_request_line(start)?;
        Ok(HttpMessage::Request(HttpRequest {
            method,
            path,
            version,
            headers,
            body,
        }))
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    for line in lines {
        // Junk header lines are skipped rather than failing the message.
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_string(), value.trim().to_string());
        } else if !line.is_empty() {
            log::warn!("ignoring malformed header line {line:?}");
        }
    }
    headers
}

fn parse_request_line(line: &str) -> Result<(String, String, String), HttpParseError> {
    let mut parts = line.split_whitespace();
    let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(HttpParseError::MalformedStart(line.to_string()));
    };
    if !KNOWN_METHODS.contains(&method) {
        return Err(HttpParseError::MalformedStart(line.to_string()));
    }
    Ok((method.to_string(), path.to_string(), version.to_string()))
}

fn parse_status_line(line: &str) -> Result<(String, u16, String), HttpParseError> {
    let mut parts = line.splitn(3, ' ');
    let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
        return Err(HttpParseError::MalformedStart(line.to_string()));
    };
    let status: u16 = code
        .parse()
        .map_err(|_| HttpParseError::MalformedStatus(code.to_string()))?;
    let reason = parts.next().unwrap_or_default().to_string();
    Ok((version.to_string(), status, reason))
}

/// Canonical reason phrase for the handful of codes the simulator uses.
pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Render a request with the simulator's default headers. Caller-supplied
/// headers win over defaults; `Content-Length` is derived from the body.
pub fn build_request(
    method: &str,
    path: &str,
    host: &str,
    headers: &BTreeMap<String, String>,
    body: &str,
) -> String {
    let mut merged = BTreeMap::new();
    merged.insert("Host".to_string(), host.to_string());
    merged.insert("User-Agent".to_string(), USER_AGENT.to_string());
    merged.insert("Accept".to_string(), "*/*".to_string());
    merged.insert("Connection".to_string(), "close".to_string());
    for (name, value) in headers {
        merged.insert(name.clone(), value.clone());
    }
    if !body.is_empty() {
        merged.insert("Content-Length".to_string(), body.len().to_string());
    }
    render(&format!("{method} {path} HTTP/1.1"), &merged, body)
}

/// Render a response with the simulator's default headers.
pub fn build_response(status: u16, headers: &BTreeMap<String, String>, body: &str) -> String {
    let mut merged = BTreeMap::new();
    merged.insert("Server".to_string(), USER_AGENT.to_string());
    merged.insert("Content-Type".to_string(), "text/html".to_string());
    merged.insert("Connection".to_string(), "close".to_string());
    for (name, value) in headers {
        merged.insert(name.clone(), value.clone());
    }
    merged.insert("Content-Length".to_string(), body.len().to_string());
    render(&format!("HTTP/1.1 {status} {}", status_text(status)), &merged, body)
}

fn render(start: &str, headers: &BTreeMap<String, String>, body: &str) -> String {
    let mut out = String::with_capacity(start.len() + body.len() + headers.len() * 32);
    out.push_str(start);
    out.push_str("\r\n");
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.push_str(body);
    out
}
