//! Minimal HTTP/1.x front end with hijack support.
//!
//! Requests are read in full (head plus `Content-Length` body) and handed to
//! a [`RequestHandler`]. Unlike a general purpose server, the response writer
//! can give the raw TCP stream to the handler, which is what CONNECT tunnels
//! need.

use crate::handler::{BoxedConn, HijackError, RequestHandler, ResponseWriter, status_response};
use crate::http::{self, HttpError};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use hyper::header::{CONNECTION, CONTENT_LENGTH, HeaderValue};
use hyper::{Request, Response, StatusCode, Version};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info};

const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BODY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_BODY: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum time to receive a complete request head
    pub header_timeout: Duration,
    /// Maximum time to receive the request body once the head is read
    pub body_timeout: Duration,
    /// Largest accepted request body in bytes
    pub max_body: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            body_timeout: DEFAULT_BODY_TIMEOUT,
            max_body: DEFAULT_MAX_BODY,
        }
    }
}

/// A hijacked TCP stream. Bytes the client sent after the request head and
/// that were already buffered are replayed before reading the socket.
pub struct HijackedStream {
    buffered: Bytes,
    stream: TcpStream,
}

impl HijackedStream {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl AsyncRead for HijackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buffered.is_empty() {
            let n = self.buffered.len().min(buf.remaining());
            let chunk = self.buffered.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for HijackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Response writer for one HTTP/1.x connection.
pub struct Http1ResponseWriter {
    stream: Option<BufWriter<TcpStream>>,
    read_buf: BytesMut,
    version: Version,
    keep_alive: bool,
    responded: bool,
}

impl Http1ResponseWriter {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: Some(BufWriter::new(stream)),
            read_buf: BytesMut::new(),
            version: Version::HTTP_11,
            keep_alive: false,
            responded: false,
        }
    }

    fn begin(&mut self, version: Version, keep_alive: bool) {
        self.version = version;
        self.keep_alive = keep_alive;
        self.responded = false;
    }

    fn is_hijacked(&self) -> bool {
        self.stream.is_none()
    }

    /// Reads the next request, or `None` once the client is done.
    async fn next_request(&mut self, config: &ServerConfig) -> Result<Option<Request<Bytes>>, HttpError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        let read_buf = &mut self.read_buf;
        let head = match timeout(
            config.header_timeout,
            http::read_request_head(stream.get_mut(), read_buf),
        )
        .await??
        {
            Some(head) => head,
            None => return Ok(None),
        };
        let body = timeout(
            config.body_timeout,
            http::read_body(stream.get_mut(), read_buf, &head, config.max_body),
        )
        .await??;
        let keep_alive = http::wants_keep_alive(&head);
        self.begin(head.version(), keep_alive);
        let (parts, ()) = head.into_parts();
        Ok(Some(Request::from_parts(parts, body)))
    }

    async fn send(&mut self, response: Response<Bytes>) -> io::Result<()> {
        if self.responded {
            return Err(io::Error::other("response already written"));
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::other("connection hijacked"))?;
        self.responded = true;

        let (parts, body) = response.into_parts();
        let mut head = format!(
            "{} {} {}\r\n",
            http::protocol_name(self.version),
            parts.status.as_u16(),
            parts.status.canonical_reason().unwrap_or("")
        )
        .into_bytes();

        let mut headers = parts.headers;
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        if !self.keep_alive {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        } else if self.version == Version::HTTP_10 {
            headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }
        for (name, value) in headers.iter() {
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");

        stream.write_all(&head).await?;
        stream.write_all(&body).await?;
        stream.flush().await
    }

    async fn detach(&mut self) -> Result<BoxedConn, HijackError> {
        let mut stream = self.stream.take().ok_or(HijackError::AlreadyHijacked)?;
        stream.flush().await?;
        Ok(Box::new(HijackedStream {
            buffered: self.read_buf.split().freeze(),
            stream: stream.into_inner(),
        }))
    }
}

impl ResponseWriter for Http1ResponseWriter {
    fn write_response(&mut self, response: Response<Bytes>) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(self.send(response))
    }

    fn hijack(&mut self) -> BoxFuture<'_, Result<BoxedConn, HijackError>> {
        Box::pin(self.detach())
    }
}

fn error_status(err: &HttpError) -> Option<StatusCode> {
    match err {
        HttpError::InvalidRequest => Some(StatusCode::BAD_REQUEST),
        HttpError::HeadersTooLarge => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
        HttpError::BodyTooLarge => Some(StatusCode::PAYLOAD_TOO_LARGE),
        HttpError::UnsupportedTransferEncoding => Some(StatusCode::NOT_IMPLEMENTED),
        HttpError::Timeout => Some(StatusCode::REQUEST_TIMEOUT),
        HttpError::Io(_) => None,
    }
}

/// Serves HTTP/1.x requests on one accepted connection until the client
/// closes it, keep-alive ends, or a handler hijacks the stream.
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    config: ServerConfig,
) {
    let mut writer = Http1ResponseWriter::new(stream);
    loop {
        let req = match writer.next_request(&config).await {
            Ok(Some(req)) => req,
            Ok(None) => break,
            // Idle keep-alive connections time out quietly.
            Err(HttpError::Timeout) if writer.read_buf.is_empty() => break,
            Err(e) => {
                debug!(%peer, error = %e, "Client request rejected");
                if let Some(status) = error_status(&e) {
                    writer.begin(Version::HTTP_11, false);
                    let _ = writer.send(status_response(status)).await;
                }
                break;
            }
        };

        debug!(%peer, method = %req.method(), uri = %req.uri(), "Request");
        handler.serve(req, &mut writer).await;

        if writer.is_hijacked() {
            debug!(%peer, "Connection hijacked");
            return;
        }
        if !writer.responded {
            let response = Response::new(Bytes::new());
            if let Err(e) = writer.send(response).await {
                debug!(%peer, error = %e, "Failed to write default response");
                break;
            }
        }
        if !writer.keep_alive {
            break;
        }
    }

    if let Some(mut stream) = writer.stream.take() {
        let _ = stream.shutdown().await;
    }
}

/// Accepts connections on every listener until `shutdown` fires.
///
/// Connections already being served are not interrupted.
pub async fn serve(
    listeners: Vec<TcpListener>,
    handler: Arc<dyn RequestHandler>,
    config: ServerConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let mut accepts = FuturesUnordered::new();
        for listener in &listeners {
            accepts.push(listener.accept());
        }

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Received shutdown signal");
                break;
            }
            Some(result) = accepts.next() => {
                match result {
                    Ok((socket, peer)) => {
                        let handler = handler.clone();
                        let config = config.clone();
                        tokio::spawn(async move {
                            serve_connection(socket, peer, handler, config).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }
}
