//! The CONNECT bridge.
//!
//! A [`Bridge`] is two things at once. As a [`RequestHandler`] it sits in
//! front of an HTTP server: plain requests go to an optional delegate, and
//! CONNECT requests for configured targets are hijacked and queued. As a
//! [`ConnectionSource`] it behaves like a listener for an embedded server,
//! whose accept loop receives those hijacked connections as if they had
//! arrived on a socket of their own.
//!
//! CONNECT requests for other targets are rejected, or, when forwarding is
//! enabled, dialed directly and spliced.

use crate::handler::{
    BoxedConn, RequestHandler, ResponseWriter, error_response, status_response,
};
use crate::http::protocol_name;
use crate::metrics::BridgeMetrics;
use crate::queue::HandoffQueue;
use crate::splice::splice;
use crate::target::matches_target;
use bytes::Bytes;
use connbridge_config::Config;
use futures::future::BoxFuture;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use prometheus::Registry;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

const INVALID_ADDR: &str = "<invalid>";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeError {
    /// The bridge has been closed.
    Closed,
    /// The bridge closed while a connection waited for a consumer.
    Unavailable,
    /// No consumer took the connection before its deadline.
    Cancelled,
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::Closed => write!(f, "use of closed bridge"),
            BridgeError::Unavailable => write!(f, "connection unavailable"),
            BridgeError::Cancelled => write!(f, "handoff deadline exceeded"),
        }
    }
}

impl std::error::Error for BridgeError {}

/// The listener-like side of a [`Bridge`], consumed by an embedded server.
pub trait ConnectionSource: Send + Sync {
    /// Waits for the next tunneled connection, or [`BridgeError::Closed`].
    fn accept(&self) -> BoxFuture<'_, Result<BoxedConn, BridgeError>>;

    /// Closes the source and releases every waiter. Later calls report
    /// [`BridgeError::Closed`].
    fn close(&self) -> Result<(), BridgeError>;

    /// A nominal address; it cannot be dialed.
    fn local_addr(&self) -> NominalAddr;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NominalAddr(String);

impl NominalAddr {
    pub fn network(&self) -> &'static str {
        "tcp"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NominalAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
pub struct BridgeOptions {
    /// CONNECT targets (`host` or `host:port`) delivered through `accept`.
    pub targets: Vec<String>,
    /// Handler for requests other than CONNECT. Without one they get 404.
    pub handler: Option<Arc<dyn RequestHandler>>,
    /// Splice CONNECT requests for other targets instead of rejecting them.
    pub forward_connect: bool,
    /// Dial timeout for forwarded targets.
    pub connect_timeout: Duration,
    /// How long a hijacked connection waits for a consumer.
    pub handoff_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            handler: None,
            forward_connect: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
        }
    }
}

impl BridgeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            targets: config.targets.clone(),
            handler: None,
            forward_connect: config.forward_connect,
            connect_timeout: Duration::from_secs(config.timeouts.connect),
            handoff_timeout: Duration::from_secs(config.timeouts.handoff),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }
}

struct QueuedConn {
    conn: BoxedConn,
    version: Version,
    host: String,
}

pub struct Bridge {
    targets: Vec<String>,
    handler: Option<Arc<dyn RequestHandler>>,
    forward_connect: bool,
    connect_timeout: Duration,
    handoff_timeout: Duration,
    queue: HandoffQueue<QueuedConn>,
    metrics: BridgeMetrics,
}

fn status_line(version: Version, status: StatusCode) -> String {
    format!(
        "{} {} {}\r\n\r\n",
        protocol_name(version),
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
}

/// The `host:port` of a CONNECT request, if the target has that form.
fn connect_target(uri: &Uri) -> Option<String> {
    if uri.scheme().is_some() || uri.path_and_query().is_some() {
        return None;
    }
    uri.authority().map(|authority| authority.as_str().to_string())
}

async fn respond(w: &mut dyn ResponseWriter, response: Response<Bytes>) {
    if let Err(e) = w.write_response(response).await {
        debug!(error = %e, "Failed to write response");
    }
}

impl Bridge {
    pub fn new(options: BridgeOptions) -> Self {
        Self {
            targets: options.targets,
            handler: options.handler,
            forward_connect: options.forward_connect,
            connect_timeout: options.connect_timeout,
            handoff_timeout: options.handoff_timeout,
            queue: HandoffQueue::new(),
            metrics: BridgeMetrics::new(),
        }
    }

    /// Like [`Bridge::new`], with the counters registered in `registry`.
    pub fn with_registry(options: BridgeOptions, registry: &Registry) -> prometheus::Result<Self> {
        let bridge = Self::new(options);
        bridge.metrics.register(registry)?;
        Ok(bridge)
    }

    pub fn metrics(&self) -> &BridgeMetrics {
        &self.metrics
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Waits for the next tunneled connection.
    ///
    /// The client is told `200 OK` just before the connection is returned,
    /// so the first bytes it sees after its CONNECT are that status line.
    pub async fn accept(&self) -> Result<BoxedConn, BridgeError> {
        loop {
            let QueuedConn {
                mut conn,
                version,
                host,
            } = self.queue.pop().await?;

            match conn.write_all(status_line(version, StatusCode::OK).as_bytes()).await {
                Ok(()) => {
                    self.metrics.proxy_conn_accept.inc();
                    debug!(host = %host, "Accepted tunneled connection");
                    return Ok(conn);
                }
                Err(e) => {
                    self.metrics.proxy_conn_error.inc();
                    debug!(host = %host, error = %e, "Tunneled client went away before accept");
                }
            }
        }
    }

    /// Closes the bridge. Only the first call succeeds; it is safe to call
    /// concurrently.
    pub fn close(&self) -> Result<(), BridgeError> {
        self.queue.close()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn local_addr(&self) -> NominalAddr {
        match self.targets.first() {
            Some(target) => NominalAddr(target.clone()),
            None => NominalAddr(INVALID_ADDR.to_string()),
        }
    }

    async fn handle(&self, req: Request<Bytes>, w: &mut dyn ResponseWriter) {
        if req.method() != Method::CONNECT {
            self.delegate(req, w).await;
            return;
        }

        let Some(host) = connect_target(req.uri()) else {
            debug!(uri = %req.uri(), "Malformed CONNECT target");
            respond(w, status_response(StatusCode::BAD_REQUEST)).await;
            return;
        };

        if matches_target(&host, &self.targets) {
            self.proxy_connect(host, req.version(), w).await;
        } else {
            self.forward_connect(host, req.version(), w).await;
        }
    }

    async fn delegate(&self, req: Request<Bytes>, w: &mut dyn ResponseWriter) {
        match &self.handler {
            Some(handler) => {
                self.metrics.http_proxy_delegate.inc();
                handler.serve(req, w).await;
            }
            None => {
                self.metrics.http_proxy_reject.inc();
                info!(uri = %req.uri(), "Reject proxy request");
                respond(w, status_response(StatusCode::NOT_FOUND)).await;
            }
        }
    }

    /// Hijacks a CONNECT for a configured target and waits for a consumer.
    async fn proxy_connect(&self, host: String, version: Version, w: &mut dyn ResponseWriter) {
        self.metrics.proxy_conn_request.inc();

        let conn = match w.hijack().await {
            Ok(conn) => conn,
            Err(e) => {
                self.metrics.proxy_conn_error.inc();
                warn!(host = %host, error = %e, "Cannot hijack CONNECT request");
                respond(w, error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())).await;
                return;
            }
        };
        // From here on the HTTP layer no longer touches conn.

        let queued = QueuedConn {
            conn,
            version,
            host: host.clone(),
        };
        match self.queue.push(queued, self.handoff_timeout).await {
            Ok(()) => debug!(host = %host, "Handed off tunneled connection"),
            Err((err, QueuedConn { mut conn, .. })) => {
                self.metrics.proxy_conn_error.inc();
                warn!(host = %host, error = %err, "CONNECT handoff failed");
                let line = status_line(version, StatusCode::SERVICE_UNAVAILABLE);
                let _ = conn.write_all(line.as_bytes()).await;
                let _ = conn.shutdown().await;
            }
        }
    }

    /// Rejects, or dials and splices, a CONNECT for an unknown target.
    async fn forward_connect(&self, host: String, version: Version, w: &mut dyn ResponseWriter) {
        if !self.forward_connect {
            self.metrics.fwd_conn_reject.inc();
            info!(host = %host, "Reject CONNECT for unknown target");
            let message = format!("target address {:?} not recognized", host);
            respond(w, error_response(StatusCode::FORBIDDEN, &message)).await;
            return;
        }

        let remote = match timeout(self.connect_timeout, TcpStream::connect(host.as_str())).await {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                self.metrics.fwd_conn_error.inc();
                warn!(host = %host, error = %e, "Failed to dial CONNECT target");
                respond(w, error_response(StatusCode::BAD_GATEWAY, &e.to_string())).await;
                return;
            }
            Err(_) => {
                self.metrics.fwd_conn_error.inc();
                warn!(host = %host, "Timed out dialing CONNECT target");
                respond(w, error_response(StatusCode::BAD_GATEWAY, "connect timed out")).await;
                return;
            }
        };

        let mut client = match w.hijack().await {
            Ok(client) => client,
            Err(e) => {
                self.metrics.fwd_conn_error.inc();
                warn!(host = %host, error = %e, "Cannot hijack CONNECT request");
                respond(w, error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())).await;
                return;
            }
        };

        if let Err(e) = client.write_all(status_line(version, StatusCode::OK).as_bytes()).await {
            debug!(host = %host, error = %e, "Client went away before splice");
            return;
        }

        self.metrics.fwd_conn_splice.inc();
        debug!(host = %host, "Splicing CONNECT to target");
        splice(client, remote);
    }
}

impl RequestHandler for Bridge {
    fn serve<'a>(
        &'a self,
        req: Request<Bytes>,
        w: &'a mut dyn ResponseWriter,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.handle(req, w))
    }
}

impl ConnectionSource for Bridge {
    fn accept(&self) -> BoxFuture<'_, Result<BoxedConn, BridgeError>> {
        Box::pin(Bridge::accept(self))
    }

    fn close(&self) -> Result<(), BridgeError> {
        Bridge::close(self)
    }

    fn local_addr(&self) -> NominalAddr {
        Bridge::local_addr(self)
    }
}
