//! HTTP/1.1 framing for decrypted tunnel traffic
//!
//! Requests are decoded one at a time from a buffered stream (head via
//! `httparse`, body via Content-Length or chunked encoding). Responses are
//! always written back with an explicit Content-Length.

use crate::rules::MockResponse;
use bytes::Bytes;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING,
    UPGRADE,
};
use hyper::{Method, StatusCode};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Headers that only describe a single hop and are never relayed
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "proxy-connection",
    "connection",
    "keep-alive",
    "te",
    "trailers",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Strip a `:port` suffix, also unwrapping bracketed IPv6 literals
pub fn strip_port(host_port: &str) -> &str {
    split_host_port(host_port).0
}

/// Split `host[:port]` into its parts
pub fn split_host_port(host_port: &str) -> (&str, Option<u16>) {
    if let Some(rest) = host_port.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, tail)) => (host, tail.strip_prefix(':').and_then(|p| p.parse().ok())),
            None => (host_port, None),
        };
    }

    match host_port.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (host_port, None),
        },
        _ => (host_port, None),
    }
}

/// Host as it should appear upstream: the default HTTPS port is dropped,
/// any other port is kept
pub fn clean_host(host_port: &str) -> String {
    match split_host_port(host_port) {
        (host, Some(443)) if host.contains(':') => format!("[{}]", host),
        (host, Some(443)) => host.to_string(),
        _ => host_port.to_string(),
    }
}

/// Absolute URL for a request target: absolute-form targets are kept as-is,
/// origin-form targets are prefixed with `scheme://host`
pub fn absolute_url(scheme: &str, host: &str, target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_string();
    }

    if target.starts_with('/') {
        format!("{}://{}{}", scheme, host, target)
    } else {
        format!("{}://{}/{}", scheme, host, target)
    }
}

/// One HTTP/1.1 request read from a tunnel
#[derive(Debug)]
pub struct TunnelRequest {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TunnelRequest {
    pub fn header(&self, name: impl hyper::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header(UPGRADE)
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// True when the client asked to close the connection after this exchange
    pub fn wants_close(&self) -> bool {
        self.header(CONNECTION)
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }

    /// Point the request at `host`, replacing the Host header
    pub fn set_host(&mut self, host: &str) -> io::Result<()> {
        let value = HeaderValue::from_str(host)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.headers.insert(HOST, value);
        Ok(())
    }

    /// Path and query of the target, whatever form the client used
    pub fn path_and_query(&self) -> &str {
        for scheme in ["http://", "https://"] {
            if let Some(rest) = self.target.strip_prefix(scheme) {
                return rest.find('/').map(|i| &rest[i..]).unwrap_or("/");
            }
        }
        &self.target
    }

    /// Serialize the request line, headers and body for a raw upstream connection
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("{} {} HTTP/1.1\r\n", self.method, self.path_and_query()).as_bytes(),
        );

        for (name, value) in &self.headers {
            if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                continue;
            }
            push_header(&mut out, name.as_str(), value.as_bytes());
        }

        if !self.body.is_empty() {
            push_header(&mut out, "content-length", self.body.len().to_string().as_bytes());
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Read the next request from `reader`, `Ok(None)` on a clean end of stream
pub async fn read_request<R>(reader: &mut R) -> io::Result<Option<TunnelRequest>>
where
    R: AsyncBufRead + Unpin,
{
    let head = match read_head(reader).await? {
        Some(head) => head,
        None => return Ok(None),
    };

    let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut header_slots);
    match parsed.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(invalid_data("incomplete request head")),
        Err(e) => return Err(invalid_data(e)),
    }

    let method = parsed
        .method
        .ok_or_else(|| invalid_data("missing method"))
        .and_then(|m| Method::from_bytes(m.as_bytes()).map_err(invalid_data))?;
    let target = parsed
        .path
        .ok_or_else(|| invalid_data("missing request target"))?
        .to_string();

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(invalid_data)?;
        let value = HeaderValue::from_bytes(header.value).map_err(invalid_data)?;
        headers.append(name, value);
    }

    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"));

    let body = if chunked {
        headers.remove(TRANSFER_ENCODING);
        read_chunked_body(reader).await?
    } else {
        match headers.get(CONTENT_LENGTH) {
            Some(value) => {
                let length: usize = value
                    .to_str()
                    .ok()
                    .and_then(|v| v.trim().parse().ok())
                    .ok_or_else(|| invalid_data("invalid content-length"))?;
                if length > MAX_BODY_BYTES {
                    return Err(invalid_data("request body too large"));
                }
                let mut body = vec![0u8; length];
                reader.read_exact(&mut body).await?;
                Bytes::from(body)
            }
            None => Bytes::new(),
        }
    };

    Ok(Some(TunnelRequest {
        method,
        target,
        headers,
        body,
    }))
}

async fn read_head<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);

    loop {
        let line_start = head.len();
        let read = reader.read_until(b'\n', &mut head).await?;

        if read == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside request head",
            ));
        }

        let line = &head[line_start..];
        if line == b"\r\n" || line == b"\n" {
            // Tolerate stray blank lines between pipelined requests
            if line_start == 0 {
                head.clear();
                continue;
            }
            return Ok(Some(head));
        }

        if head.len() > MAX_HEAD_BYTES {
            return Err(invalid_data("request head too large"));
        }
    }
}

async fn read_chunked_body<R>(reader: &mut R) -> io::Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside chunked body",
            ));
        }

        let size_field = line.trim().split(';').next().unwrap_or("");
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| invalid_data("invalid chunk size"))?;

        if size == 0 {
            // Discard trailers up to the terminating blank line
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 || line.trim().is_empty() {
                    return Ok(Bytes::from(body));
                }
            }
        }

        let start = body.len();
        let end = start
            .checked_add(size)
            .filter(|end| *end <= MAX_BODY_BYTES)
            .ok_or_else(|| invalid_data("request body too large"))?;
        body.resize(end, 0);
        reader.read_exact(&mut body[start..]).await?;

        line.clear();
        reader.read_line(&mut line).await?;
        if !line.trim().is_empty() {
            return Err(invalid_data("missing chunk terminator"));
        }
    }
}

/// Response written back into a tunnel
#[derive(Debug)]
pub enum TunnelResponse {
    /// Response received from the real upstream
    Upstream {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    /// Response synthesized from a mock rule
    Mock(MockResponse),
    /// Response synthesized by the proxy itself when forwarding failed
    Error { status: StatusCode, message: &'static str },
}

impl TunnelResponse {
    /// Read a full upstream response
    pub async fn from_upstream(response: reqwest::Response) -> reqwest::Result<Self> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(Self::Upstream {
            status,
            headers,
            body,
        })
    }

    pub fn proxy_error() -> Self {
        Self::Error {
            status: StatusCode::BAD_GATEWAY,
            message: "Proxy Error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Upstream { status, .. } => *status,
            Self::Mock(mock) => mock.status(),
            Self::Error { status, .. } => *status,
        }
    }

    pub fn is_mocked(&self) -> bool {
        matches!(self, Self::Mock(_))
    }

    /// Serialize the response in HTTP/1.1 wire format and flush it
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = match self {
            Self::Upstream {
                status,
                headers,
                body,
            } => encode_response(*status, headers, body),
            Self::Mock(mock) => encode_response(mock.status(), &mock.header_map(), mock.body.as_bytes()),
            Self::Error { status, message } => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    hyper::header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                );
                encode_response(*status, &headers, message.as_bytes())
            }
        };

        writer.write_all(&encoded).await?;
        writer.flush().await
    }
}

fn encode_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );

    for (name, value) in headers {
        if name == CONTENT_LENGTH || HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        push_header(&mut out, name.as_str(), value.as_bytes());
    }

    push_header(&mut out, "content-length", body.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

fn invalid_data<E>(error: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, error)
}

/// Errors that simply mean the peer went away
pub fn is_closed_connection(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
