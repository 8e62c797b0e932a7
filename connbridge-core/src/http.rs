use bytes::{Bytes, BytesMut};
use hyper::header::{CONNECTION, CONTENT_LENGTH, HeaderName, HeaderValue, TRANSFER_ENCODING};
use hyper::{Method, Request, Version};
use std::error::Error;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_BUFFER_SIZE: usize = 16384;
pub(crate) const MAX_HEAD_SIZE: usize = READ_BUFFER_SIZE * 2;

#[derive(Debug)]
pub enum HttpError {
    Io(io::Error),
    InvalidRequest,
    HeadersTooLarge,
    BodyTooLarge,
    UnsupportedTransferEncoding,
    Timeout,
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::Io(e) => write!(f, "IO error: {}", e),
            HttpError::InvalidRequest => write!(f, "Invalid HTTP request"),
            HttpError::HeadersTooLarge => write!(f, "Request headers too large"),
            HttpError::BodyTooLarge => write!(f, "Request body too large"),
            HttpError::UnsupportedTransferEncoding => write!(f, "Unsupported transfer encoding"),
            HttpError::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl Error for HttpError {}

impl From<io::Error> for HttpError {
    fn from(err: io::Error) -> Self {
        HttpError::Io(err)
    }
}

impl From<tokio::time::error::Elapsed> for HttpError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        HttpError::Timeout
    }
}

impl From<hyper::http::Error> for HttpError {
    fn from(_: hyper::http::Error) -> Self {
        HttpError::InvalidRequest
    }
}

/// Reads one request head from `stream`, buffering through `buffer`.
///
/// Returns `Ok(None)` on a clean end of stream before any byte of a new
/// request. Bytes after the head stay in `buffer`.
pub(crate) async fn read_request_head<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
) -> Result<Option<Request<()>>, HttpError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(headers_end) = find_headers_end(buffer) {
            let head = buffer.split_to(headers_end);
            return parse_request_head(&head).map(Some);
        }

        if buffer.len() > MAX_HEAD_SIZE {
            return Err(HttpError::HeadersTooLarge);
        }

        buffer.reserve(READ_BUFFER_SIZE);
        let n = stream.read_buf(buffer).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(HttpError::InvalidRequest);
        }
    }
}

/// Reads a `Content-Length` body, consuming buffered bytes first.
pub(crate) async fn read_body<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    head: &Request<()>,
    max_body: usize,
) -> Result<Bytes, HttpError>
where
    S: AsyncRead + Unpin,
{
    if head.headers().contains_key(TRANSFER_ENCODING) {
        return Err(HttpError::UnsupportedTransferEncoding);
    }
    let length = match head.headers().get(CONTENT_LENGTH) {
        None => return Ok(Bytes::new()),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or(HttpError::InvalidRequest)?,
    };
    if length > max_body {
        return Err(HttpError::BodyTooLarge);
    }

    while buffer.len() < length {
        buffer.reserve(length - buffer.len());
        if stream.read_buf(buffer).await? == 0 {
            return Err(HttpError::InvalidRequest);
        }
    }
    Ok(buffer.split_to(length).freeze())
}

/// Whether the connection may carry another request after this one.
pub(crate) fn wants_keep_alive(head: &Request<()>) -> bool {
    let connection = head
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase());
    match head.version() {
        Version::HTTP_10 => connection.is_some_and(|v| v.contains("keep-alive")),
        _ => !connection.is_some_and(|v| v.contains("close")),
    }
}

/// The protocol token used on raw status lines, e.g. `HTTP/1.1`.
pub fn protocol_name(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

#[inline]
fn find_headers_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn parse_request_head(head: &[u8]) -> Result<Request<()>, HttpError> {
    let text = std::str::from_utf8(head).map_err(|_| HttpError::InvalidRequest)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(HttpError::InvalidRequest)?;
    let mut parts = request_line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
        _ => return Err(HttpError::InvalidRequest),
    };
    let version = match version {
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/1.1" => Version::HTTP_11,
        _ => return Err(HttpError::InvalidRequest),
    };
    let method = Method::from_bytes(method.as_bytes()).map_err(|_| HttpError::InvalidRequest)?;

    let mut builder = Request::builder().method(method).uri(target).version(version);
    for line in lines.take_while(|line| !line.is_empty()) {
        let (name, value) = line.split_once(':').ok_or(HttpError::InvalidRequest)?;
        let name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| HttpError::InvalidRequest)?;
        let value = HeaderValue::from_bytes(value.trim().as_bytes())
            .map_err(|_| HttpError::InvalidRequest)?;
        builder = builder.header(name, value);
    }
    Ok(builder.body(())?)
}
