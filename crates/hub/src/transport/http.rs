// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Minimal HTTP/1.1 request parsing for the loopback endpoint.
//!
//! Just enough of the grammar for two routes: request line, headers up to
//! the blank line, and a Content-Length-bound body. Anything fancier
//! (Transfer-Encoding, continuation lines) is rejected with 400.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on the header block.
const MAX_HEAD: usize = 16 * 1024;

/// Upper bound on a request body.
const MAX_BODY: usize = 1024 * 1024;

/// A parsed request. Header names are lowercased; values are trimmed.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Bytes past the message boundary, handed to the WebSocket read loop.
    pub leftover: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers.iter().find(|(n, _)| *n == name).map(|(_, v)| v.as_str())
    }
}

/// Any malformed request. All variants answer 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    Malformed,
    UnsupportedFraming,
    TooLarge,
}

/// Read and parse one request from the socket.
pub async fn read_request<S>(socket: &mut S) -> Result<Request, ParseError>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);

    // Accumulate until the blank line ending the header block.
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD {
            return Err(ParseError::TooLarge);
        }
        let n = socket.read_buf(&mut buf).await.map_err(|_| ParseError::Malformed)?;
        if n == 0 {
            return Err(ParseError::Malformed);
        }
    };

    let (method, path, headers, content_length) = {
        let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| ParseError::Malformed)?;
        let mut lines = head.split("\r\n");
        let request_line = lines.next().ok_or(ParseError::Malformed)?;
        let mut parts = request_line.split(' ');
        let method = parts.next().ok_or(ParseError::Malformed)?;
        let path = parts.next().ok_or(ParseError::Malformed)?;
        let version = parts.next().ok_or(ParseError::Malformed)?;
        if method.is_empty() || path.is_empty() || !version.starts_with("HTTP/") {
            return Err(ParseError::Malformed);
        }
        if parts.next().is_some() {
            return Err(ParseError::Malformed);
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':').ok_or(ParseError::Malformed)?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
        }

        if headers.iter().any(|(n, _)| n == "transfer-encoding") {
            return Err(ParseError::UnsupportedFraming);
        }

        let content_length = match headers.iter().find(|(n, _)| n == "content-length") {
            Some((_, v)) => v.parse::<usize>().map_err(|_| ParseError::Malformed)?,
            None => 0,
        };
        if content_length > MAX_BODY {
            return Err(ParseError::TooLarge);
        }

        (method.to_owned(), path.to_owned(), headers, content_length)
    };

    // The body starts right after the blank line; read until it is complete.
    let body_start = head_end + 4;
    while buf.len() < body_start + content_length {
        let n = socket.read_buf(&mut buf).await.map_err(|_| ParseError::Malformed)?;
        if n == 0 {
            return Err(ParseError::Malformed);
        }
    }

    let body = buf[body_start..body_start + content_length].to_vec();
    let leftover = buf[body_start + content_length..].to_vec();

    Ok(Request {
        method,
        path,
        headers,
        body,
        leftover,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Serialize a JSON response. Every non-upgraded reply closes the socket.
pub fn json_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len(),
    )
    .into_bytes()
}

/// Serialize the 101 upgrade response for a computed accept key.
pub fn upgrade_response(accept: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )
    .into_bytes()
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
