// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal HTTP/1.1 client framing over any byte stream.
//!
//! One request per stream: the request head and body are written, then the status line, the
//! headers and the body up to the end of the stream are read back. A declared `Content-Length`
//! must match the body exactly. No retries, redirects or chunked bodies.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::errors::TransportError;

/// Upper bound on the status line plus headers of a response.
const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct HttpRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub host: &'a str,
    pub user_agent: &'a str,
    /// Sent after the fixed headers, in order.
    pub headers: &'a [(String, String)],
    pub body: &'a [u8],
}

impl HttpRequest<'_> {
    /// Serializes the request line and headers, including the terminating blank line.
    pub fn head(&self) -> String {
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nAccept-Encoding: identity\r\nUser-Agent: {}\r\nContent-Length: {}\r\n",
            self.method,
            self.path,
            self.host,
            self.user_agent,
            self.body.len()
        );
        for (name, value) in self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        head
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    content_length: Option<usize>,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup. The first occurrence wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.header("Content-Encoding")
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Writes `request` to `stream` and reads the response.
pub async fn post<S>(stream: &mut S, request: &HttpRequest<'_>) -> Result<HttpResponse, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request.head().as_bytes()).await?;
    stream.write_all(request.body).await?;
    stream.flush().await?;
    read_response(stream).await
}

/// Reads one response from `stream`.
///
/// A body shorter than its declared `Content-Length` is a protocol error. Bytes past the declared
/// length are not read.
pub async fn read_response<S>(stream: S) -> Result<HttpResponse, TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut head_size = 0;

    let status_line = match read_head_line(&mut reader, &mut head_size).await? {
        Some(line) => line,
        None => return Err(TransportError::ConnectionClosed),
    };
    let (status, reason) = parse_status_line(&status_line)?;

    let mut headers = Vec::new();
    loop {
        let line = read_head_line(&mut reader, &mut head_size)
            .await?
            .ok_or(TransportError::ConnectionClosed)?;
        if line.is_empty() {
            break;
        }
        headers.push(parse_header(&line)?);
    }

    let find = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };

    if let Some(encoding) = find("Transfer-Encoding") {
        if !encoding.eq_ignore_ascii_case("identity") {
            return Err(TransportError::UnsupportedTransferEncoding(encoding));
        }
    }

    let content_length = match find("Content-Length") {
        Some(value) => Some(
            value
                .parse::<usize>()
                .map_err(|_| TransportError::MalformedHeader(format!("Content-Length: {value}")))?,
        ),
        None => None,
    };

    // Requests carry `Connection: close`, so the body runs to the end of the stream.
    let mut body = Vec::new();
    if let Some(declared) = content_length {
        body.reserve(declared.min(MAX_HEAD_SIZE * 16));
    }
    reader.read_to_end(&mut body).await?;
    if let Some(declared) = content_length {
        if body.len() != declared {
            return Err(TransportError::ContentLengthMismatch {
                declared,
                actual: body.len(),
            });
        }
    }

    Ok(HttpResponse {
        status,
        reason,
        headers,
        content_length,
        body,
    })
}

/// Reads a CRLF (or bare LF) terminated line. `None` means the stream ended before any byte.
async fn read_head_line<R>(
    reader: &mut R,
    head_size: &mut usize,
) -> Result<Option<String>, TransportError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let remaining = MAX_HEAD_SIZE.saturating_sub(*head_size) as u64;
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(remaining)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        return if remaining == 0 {
            Err(TransportError::HeadTooLarge(MAX_HEAD_SIZE))
        } else {
            Ok(None)
        };
    }
    *head_size += read;
    if line.last() != Some(&b'\n') {
        return if *head_size >= MAX_HEAD_SIZE {
            Err(TransportError::HeadTooLarge(MAX_HEAD_SIZE))
        } else {
            Err(TransportError::ConnectionClosed)
        };
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|e| TransportError::MalformedHeader(String::from_utf8_lossy(e.as_bytes()).into()))
}

/// Parses `<version> <3-digit code> <reason>`. The reason may be empty.
pub fn parse_status_line(line: &str) -> Result<(u16, String), TransportError> {
    let malformed = || TransportError::MalformedStatusLine(line.to_string());

    let (version, rest) = line.split_once(' ').ok_or_else(malformed)?;
    if !version.starts_with("HTTP/") {
        return Err(malformed());
    }
    let (code, reason) = match rest.split_once(' ') {
        Some((code, reason)) => (code, reason),
        None => (rest, ""),
    };
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let status = code.parse::<u16>().map_err(|_| malformed())?;
    Ok((status, reason.trim().to_string()))
}

fn parse_header(line: &str) -> Result<(String, String), TransportError> {
    match line.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(TransportError::MalformedHeader(line.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplicate::duplicate_item;
    use tokio::io::duplex;

    /// Reads one request off `server`, answers with `response` and closes the stream.
    async fn serve_once(mut server: tokio::io::DuplexStream, response: &'static [u8]) -> Vec<u8> {
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = server.read(&mut buf).await.expect("read failed");
            received.extend_from_slice(&buf[..n]);
            if let Some(end) = find_head_end(&received) {
                let head = String::from_utf8_lossy(&received[..end]).to_string();
                let length = head
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if received.len() >= end + 4 + length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        server.write_all(response).await.expect("write failed");
        server.shutdown().await.expect("shutdown failed");
        received
    }

    fn find_head_end(bytes: &[u8]) -> Option<usize> {
        bytes.windows(4).position(|w| w == b"\r\n\r\n")
    }

    #[test]
    fn test_request_head_order() {
        let headers = vec![
            ("X-Datadog-Trace-Count".to_string(), "3".to_string()),
            ("Datadog-Meta-Lang".to_string(), "rust".to_string()),
        ];
        let request = HttpRequest {
            method: "POST",
            path: "/v0.4/traces",
            host: "localhost:8126",
            user_agent: "datadog-trace-pipeline/0.1.0",
            headers: &headers,
            body: b"abcd",
        };
        assert_eq!(
            request.head(),
            "POST /v0.4/traces HTTP/1.1\r\n\
             Host: localhost:8126\r\n\
             Accept-Encoding: identity\r\n\
             User-Agent: datadog-trace-pipeline/0.1.0\r\n\
             Content-Length: 4\r\n\
             X-Datadog-Trace-Count: 3\r\n\
             Datadog-Meta-Lang: rust\r\n\
             \r\n"
        );
    }

    #[tokio::test]
    async fn test_round_trip_over_stream() {
        let (mut client, server) = duplex(64 * 1024);
        let server_task = tokio::spawn(serve_once(
            server,
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 18\r\n\r\n{\"rate_by_service\"",
        ));

        let request = HttpRequest {
            method: "POST",
            path: "/v0.4/traces",
            host: "agent",
            user_agent: "test",
            headers: &[],
            body: b"payload",
        };
        let response = post(&mut client, &request).await.expect("request failed");
        assert_eq!(response.status(), 200);
        assert_eq!(response.reason(), "OK");
        assert!(response.is_success());
        assert_eq!(response.content_length(), Some(18));
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.content_encoding(), None);
        assert_eq!(response.body(), b"{\"rate_by_service\"");

        let received = server_task.await.expect("server task failed");
        assert!(received.starts_with(b"POST /v0.4/traces HTTP/1.1\r\n"));
        assert!(received.ends_with(b"\r\n\r\npayload"));
    }

    #[tokio::test]
    async fn test_short_body_is_protocol_error() {
        let (mut client, server) = duplex(64 * 1024);
        let body = [b'x'; 40];
        let mut response = b"HTTP/1.1 200 OK\r\nContent-Length: 50\r\n\r\n".to_vec();
        response.extend_from_slice(&body);
        let response: &'static [u8] = Box::leak(response.into_boxed_slice());
        tokio::spawn(serve_once(server, response));

        let request = HttpRequest {
            method: "POST",
            path: "/",
            host: "agent",
            user_agent: "test",
            headers: &[],
            body: b"",
        };
        match post(&mut client, &request).await {
            Err(TransportError::ContentLengthMismatch { declared, actual }) => {
                assert_eq!(declared, 50);
                assert_eq!(actual, 40);
            }
            other => panic!("expected a content length mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_long_body_is_protocol_error() {
        let mut raw = b"HTTP/1.1 200 OK\r\nContent-Length: 40\r\n\r\n".to_vec();
        raw.extend_from_slice(&[b'x'; 65]);
        match read_response(&raw[..]).await {
            Err(TransportError::ContentLengthMismatch { declared, actual }) => {
                assert_eq!(declared, 40);
                assert_eq!(actual, 65);
            }
            other => panic!("expected a content length mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_body_without_content_length_reads_to_end() {
        let response = read_response(&b"HTTP/1.0 404 Not Found\nContent-Encoding: gzip\n\nmissing"[..])
            .await
            .expect("response should parse");
        assert_eq!(response.status(), 404);
        assert!(!response.is_success());
        assert_eq!(response.content_length(), None);
        assert_eq!(response.content_encoding(), Some("gzip"));
        assert_eq!(response.body(), b"missing");
    }

    #[tokio::test]
    async fn test_empty_stream_is_connection_closed() {
        let result = read_response(&b""[..]).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
        let result = read_response(&b"HTTP/1.1 200 OK\r\nContent-Le"[..]).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_chunked_body_is_rejected() {
        let result =
            read_response(&b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nabcd\r\n0\r\n\r\n"[..])
                .await;
        assert!(matches!(
            result,
            Err(TransportError::UnsupportedTransferEncoding(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_head_is_rejected() {
        let mut raw = b"HTTP/1.1 200 OK\r\nX-Filler: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE));
        raw.extend_from_slice(b"\r\n\r\n");
        let result = read_response(&raw[..]).await;
        assert!(matches!(result, Err(TransportError::HeadTooLarge(_))));
    }

    #[duplicate_item(
        test_name                       line                            expected;
        [test_status_ok]                ["HTTP/1.1 200 OK"]             [Some((200, "OK"))];
        [test_status_multiword]         ["HTTP/1.1 503 Service Unavailable"] [Some((503, "Service Unavailable"))];
        [test_status_no_reason]         ["HTTP/1.1 202"]                [Some((202, ""))];
        [test_status_bad_version]       ["HTTX/1.1 200 OK"]             [None];
        [test_status_short_code]        ["HTTP/1.1 20 OK"]              [None];
        [test_status_alpha_code]        ["HTTP/1.1 2xx OK"]             [None];
        [test_status_empty]             [""]                            [None];
    )]
    #[test]
    fn test_name() {
        let parsed = parse_status_line(line).ok();
        let want: Option<(u16, &str)> = expected;
        assert_eq!(
            parsed.as_ref().map(|(code, reason)| (*code, reason.as_str())),
            want
        );
    }

    #[test]
    fn test_malformed_header() {
        assert!(parse_header("no colon here").is_err());
        assert!(parse_header(": empty name").is_err());
        assert_eq!(
            parse_header("Content-Length:  12 ").expect("valid header"),
            ("Content-Length".to_string(), "12".to_string())
        );
    }
}
