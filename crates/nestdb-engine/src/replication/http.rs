//! Minimal HTTP/1.1 client plumbing for replication traffic.
//!
//! Replication needs exactly two request shapes: a never-ending streaming
//! GET and a one-shot proxied request. Both run over a plain TCP stream
//! with identity or chunked response bodies.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use nestdb_common::{NestError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 16 * 1024;

/// Normalize a primary URL into a `host:port` authority plus the Host
/// header value. Plain TCP only; TLS termination belongs to a proxy.
pub(crate) fn parse_authority(url: &str) -> Result<String> {
    let trimmed = url.trim_end_matches('/');
    let rest = if let Some(rest) = trimmed.strip_prefix("http://") {
        rest
    } else if trimmed.starts_with("https://") {
        return Err(NestError::Network(
            "https primaries are not supported; terminate TLS in front of the secondary".into(),
        ));
    } else {
        trimmed
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() {
        return Err(NestError::Network(format!("invalid primary url '{url}'")));
    }
    if authority.contains(':') {
        Ok(authority.to_string())
    } else {
        Ok(format!("{authority}:80"))
    }
}

/// Percent-encode a query component.
pub(crate) fn encode_query_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Response head: status code plus headers, lower-cased names.
pub(crate) struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

enum BodyMode {
    /// Read until the server closes the connection.
    UntilClose,
    /// Fixed Content-Length.
    Length(u64),
    /// Chunked transfer coding: bytes left in the current chunk, CRLF
    /// bytes still to skip after it.
    Chunked { remaining: usize, skip: usize },
}

/// Decoded response body, fed incrementally from the socket.
pub(crate) struct BodyReader {
    stream: TcpStream,
    raw: BytesMut,
    mode: BodyMode,
    done: bool,
}

impl BodyReader {
    /// Next run of decoded body bytes; empty means end of body.
    pub async fn next_decoded(&mut self) -> Result<Bytes> {
        loop {
            if self.done {
                return Ok(Bytes::new());
            }
            match &mut self.mode {
                BodyMode::UntilClose => {
                    if !self.raw.is_empty() {
                        return Ok(self.raw.split().freeze());
                    }
                    if !fill(&mut self.stream, &mut self.raw).await? {
                        self.done = true;
                        return Ok(Bytes::new());
                    }
                }
                BodyMode::Length(remaining) => {
                    if *remaining == 0 {
                        self.done = true;
                        return Ok(Bytes::new());
                    }
                    if self.raw.is_empty() && !fill(&mut self.stream, &mut self.raw).await? {
                        self.done = true;
                        return Err(NestError::Network("response body cut short".into()));
                    }
                    let take = (*remaining).min(self.raw.len() as u64) as usize;
                    *remaining -= take as u64;
                    return Ok(self.raw.split_to(take).freeze());
                }
                BodyMode::Chunked { remaining, skip } => {
                    if *skip > 0 {
                        if self.raw.is_empty() && !fill(&mut self.stream, &mut self.raw).await? {
                            self.done = true;
                            return Ok(Bytes::new());
                        }
                        let eat = (*skip).min(self.raw.len());
                        self.raw.advance(eat);
                        *skip -= eat;
                        continue;
                    }
                    if *remaining > 0 {
                        if self.raw.is_empty() && !fill(&mut self.stream, &mut self.raw).await? {
                            self.done = true;
                            return Err(NestError::Network("chunk cut short".into()));
                        }
                        let take = (*remaining).min(self.raw.len());
                        *remaining -= take;
                        if *remaining == 0 {
                            *skip = 2;
                        }
                        return Ok(self.raw.split_to(take).freeze());
                    }
                    // At a chunk boundary: parse the size line.
                    match find_crlf(&self.raw) {
                        Some(at) => {
                            let line = self.raw.split_to(at);
                            self.raw.advance(2);
                            let size_text = std::str::from_utf8(&line)
                                .unwrap_or("")
                                .split(';')
                                .next()
                                .unwrap_or("")
                                .trim();
                            let size = usize::from_str_radix(size_text, 16).map_err(|_| {
                                NestError::Network(format!("bad chunk size '{size_text}'"))
                            })?;
                            if size == 0 {
                                self.done = true;
                                return Ok(Bytes::new());
                            }
                            *remaining = size;
                        }
                        None => {
                            if !fill(&mut self.stream, &mut self.raw).await? {
                                self.done = true;
                                return Ok(Bytes::new());
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drain the rest of the body into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let bytes = self.next_decoded().await?;
            if bytes.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&bytes);
        }
    }
}

async fn fill(stream: &mut TcpStream, raw: &mut BytesMut) -> Result<bool> {
    raw.reserve(READ_CHUNK);
    let n = stream
        .read_buf(raw)
        .await
        .map_err(|e| NestError::Network(e.to_string()))?;
    Ok(n > 0)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

/// Issue one request and parse the response head; the body stays on the
/// socket behind the returned reader.
pub(crate) async fn request(
    authority: &str,
    method: &str,
    path_and_query: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Result<(ResponseHead, BodyReader)> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(authority))
        .await
        .map_err(|_| NestError::Network(format!("connect to {authority} timed out")))?
        .map_err(|e| NestError::Network(format!("connect to {authority}: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(|e| NestError::Network(e.to_string()))?;
    let mut stream = stream;

    let mut request = format!("{method} {path_and_query} HTTP/1.1\r\nHost: {authority}\r\n");
    for (name, value) in headers {
        let lowered = name.to_ascii_lowercase();
        // These are ours to manage.
        if lowered == "host" || lowered == "content-length" || lowered == "transfer-encoding" {
            continue;
        }
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    if !body.is_empty() || method == "POST" || method == "PUT" || method == "PATCH" {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| NestError::Network(e.to_string()))?;
    if !body.is_empty() {
        stream
            .write_all(body)
            .await
            .map_err(|e| NestError::Network(e.to_string()))?;
    }

    // Read up to the blank line separating head from body.
    let mut raw = BytesMut::with_capacity(READ_CHUNK);
    let head_end = loop {
        if let Some(at) = raw.windows(4).position(|window| window == b"\r\n\r\n") {
            break at;
        }
        if !fill(&mut stream, &mut raw).await? {
            return Err(NestError::Network("connection closed before headers".into()));
        }
    };

    let head_bytes = raw.split_to(head_end + 4);
    let head_text = std::str::from_utf8(&head_bytes[..head_end])
        .map_err(|_| NestError::Network("response head is not utf-8".into()))?;
    let mut lines = head_text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| NestError::Network("empty response head".into()))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| NestError::Network(format!("bad status line '{status_line}'")))?;

    let mut parsed_headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            parsed_headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    let head = ResponseHead {
        status,
        headers: parsed_headers,
    };

    let mode = if head
        .header("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        BodyMode::Chunked {
            remaining: 0,
            skip: 0,
        }
    } else if let Some(length) = head.header("content-length").and_then(|v| v.parse().ok()) {
        BodyMode::Length(length)
    } else {
        BodyMode::UntilClose
    };

    Ok((
        head,
        BodyReader {
            stream,
            raw,
            mode,
            done: false,
        },
    ))
}
