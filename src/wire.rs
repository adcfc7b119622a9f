//! Raw HTTP/1.1 responses as stored in fixture files.

use std::fmt;

use bytes::Bytes;
use hyper::{
    HeaderMap, StatusCode,
    header::{self, HeaderName, HeaderValue},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    MissingHeaderTerminator,
    InvalidStatusLine(String),
    InvalidHeader(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingHeaderTerminator => f.write_str("response head is not terminated"),
            Self::InvalidStatusLine(line) => write!(f, "invalid status line `{line}`"),
            Self::InvalidHeader(line) => write!(f, "invalid header line `{line}`"),
        }
    }
}

impl std::error::Error for WireError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawResponse {
    pub fn parse(raw: &[u8]) -> Result<Self, WireError> {
        let (head, body) = split_head(raw).ok_or(WireError::MissingHeaderTerminator)?;
        let head = String::from_utf8_lossy(head);
        let mut lines = head.lines();

        let status_line = lines.next().unwrap_or_default();
        let (status, reason) = parse_status_line(status_line)
            .ok_or_else(|| WireError::InvalidStatusLine(status_line.to_owned()))?;

        let mut headers = HeaderMap::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let invalid = || WireError::InvalidHeader(line.to_owned());
            let (name, value) = line.split_once(':').ok_or_else(invalid)?;
            let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| invalid())?;
            let value = HeaderValue::from_str(value.trim()).map_err(|_| invalid())?;
            headers.append(name, value);
        }

        Ok(Self {
            status,
            reason,
            headers,
            body: Bytes::copy_from_slice(body),
        })
    }

    /// Builds a fixture from an upstream response. Content and transfer
    /// encodings are dropped because the body is stored decoded, and the
    /// content length is recomputed.
    pub fn from_upstream(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let mut kept = HeaderMap::new();
        for (name, value) in headers {
            if name == header::CONTENT_ENCODING
                || name == header::TRANSFER_ENCODING
                || name == header::CONTENT_LENGTH
            {
                continue;
            }
            kept.append(name.clone(), value.clone());
        }
        kept.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

        Self {
            status,
            reason: status.canonical_reason().map(str::to_owned),
            headers: kept,
            body,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let reason = self
            .reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(self.body.len() + 512);
        out.extend_from_slice(format!("HTTP/1.1 {} {reason}\r\n", self.status.as_u16()).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    pub fn is_textual(&self) -> bool {
        let Some(content_type) = self
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        else {
            return false;
        };
        let content_type = content_type.to_ascii_lowercase();
        content_type.starts_with("text/")
            || ["json", "xml", "html", "javascript"]
                .iter()
                .any(|marker| content_type.contains(marker))
    }
}

/// Points the `Content-Length` header of a raw response at its actual body
/// length. Every other byte, including header case and order, is left as it
/// was. Responses without the header, or without a complete head, are returned
/// unchanged.
pub fn sync_content_length(raw: Vec<u8>) -> Vec<u8> {
    let Some((head_len, separator_len)) = head_end(&raw) else {
        return raw;
    };
    let wanted = (raw.len() - head_len - separator_len).to_string();

    let mut out = Vec::with_capacity(raw.len() + 8);
    let mut changed = false;
    for line in raw[..head_len].split_inclusive(|&byte| byte == b'\n') {
        let value_end = line.len()
            - line
                .iter()
                .rev()
                .take_while(|&&byte| byte == b'\r' || byte == b'\n')
                .count();
        if let Some(colon) = line.iter().position(|&byte| byte == b':')
            && line[..colon]
                .trim_ascii()
                .eq_ignore_ascii_case(b"content-length")
            && line[colon + 1..value_end].trim_ascii() != wanted.as_bytes()
        {
            out.extend_from_slice(&line[..=colon]);
            out.push(b' ');
            out.extend_from_slice(wanted.as_bytes());
            out.extend_from_slice(&line[value_end..]);
            changed = true;
        } else {
            out.extend_from_slice(line);
        }
    }

    if !changed {
        return raw;
    }
    out.extend_from_slice(&raw[head_len..]);
    out
}

/// Offset of the blank line ending the head, and its length.
fn head_end(raw: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = find(raw, b"\r\n\r\n") {
        return Some((pos, 4));
    }
    find(raw, b"\n\n").map(|pos| (pos, 2))
}

fn split_head(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    head_end(raw).map(|(pos, len)| (&raw[..pos], &raw[pos + len..]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_status_line(line: &str) -> Option<(StatusCode, Option<String>)> {
    let line = line.trim_end_matches('\r');
    let mut parts = line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let status = StatusCode::from_bytes(parts.next()?.as_bytes()).ok()?;
    let reason = parts
        .next()
        .map(str::trim)
        .filter(|reason| !reason.is_empty())
        .map(str::to_owned);
    Some((status, reason))
}
