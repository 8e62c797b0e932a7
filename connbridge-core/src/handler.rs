//! Request-handling contract between the HTTP layer and its handlers.
//!
//! A handler receives a fully read [`Request`] together with a
//! [`ResponseWriter`]. Ordinary handlers write one response; tunnel handlers
//! may instead hijack the transport and take ownership of the raw stream.

use bytes::Bytes;
use futures::future::BoxFuture;
use hyper::header::{CONTENT_TYPE, HeaderValue, X_CONTENT_TYPE_OPTIONS};
use hyper::{Request, Response, StatusCode};
use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// A bidirectional byte stream detached from the HTTP layer.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedConn = Box<dyn Connection>;

#[derive(Debug)]
pub enum HijackError {
    /// The transport behind this writer cannot be detached.
    Unsupported,
    /// The transport was already taken by an earlier hijack.
    AlreadyHijacked,
    /// Flushing buffered response bytes failed.
    Io(io::Error),
}

impl std::fmt::Display for HijackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HijackError::Unsupported => write!(f, "connection does not support hijacking"),
            HijackError::AlreadyHijacked => write!(f, "connection already hijacked"),
            HijackError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for HijackError {}

impl From<io::Error> for HijackError {
    fn from(err: io::Error) -> Self {
        HijackError::Io(err)
    }
}

pub trait ResponseWriter: Send {
    /// Writes a complete response. At most one response per request.
    fn write_response(&mut self, response: Response<Bytes>) -> BoxFuture<'_, io::Result<()>>;

    /// Flushes any buffered response bytes and hands over the raw transport.
    ///
    /// After a successful hijack the HTTP layer no longer reads, writes or
    /// closes the connection; the caller owns all of that.
    fn hijack(&mut self) -> BoxFuture<'_, Result<BoxedConn, HijackError>>;
}

pub trait RequestHandler: Send + Sync {
    fn serve<'a>(
        &'a self,
        req: Request<Bytes>,
        w: &'a mut dyn ResponseWriter,
    ) -> BoxFuture<'a, ()>;
}

/// Adapts an async `Request -> Response` function into a [`RequestHandler`].
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request<Bytes>) -> Fut + Send + Sync,
    Fut: Future<Output = Response<Bytes>> + Send + 'static,
{
    HandlerFn(f)
}

impl<F, Fut> RequestHandler for HandlerFn<F>
where
    F: Fn(Request<Bytes>) -> Fut + Send + Sync,
    Fut: Future<Output = Response<Bytes>> + Send + 'static,
{
    fn serve<'a>(
        &'a self,
        req: Request<Bytes>,
        w: &'a mut dyn ResponseWriter,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let response = (self.0)(req).await;
            if let Err(e) = w.write_response(response).await {
                debug!(error = %e, "Failed to write response");
            }
        })
    }
}

/// Builds a plain-text error response whose body is `message` plus a newline.
pub fn error_response(status: StatusCode, message: &str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(format!("{}\n", message)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

/// [`error_response`] with the canonical reason phrase as the message.
pub fn status_response(status: StatusCode) -> Response<Bytes> {
    error_response(status, status.canonical_reason().unwrap_or("Unknown Status"))
}
