use bytes::Bytes;
use connbridge_config::Config;
use connbridge_core::handler::{HandlerFn, handler_fn, status_response};
use connbridge_core::{Bridge, BridgeOptions, run_bridge};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use std::convert::Infallible;
use std::error::Error;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

type RelayBody = BoxBody<Bytes, hyper::Error>;

pub async fn run(config_path: &Path) -> Result<(), Box<dyn Error>> {
    // Initialize logging
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("connbridge_core=debug".parse()?),
        )
        .with_target(false)
        .json()
        .init();

    // Load configuration
    let config = Config::from_file(config_path)?;
    config.validate()?;

    let mut options = BridgeOptions::from_config(&config);
    if config.serve_health {
        options = options.with_handler(Arc::new(health_handler()));
    }

    // Set up metrics
    let bridge = if config.metrics.enabled {
        let registry = Registry::new();
        let bridge = Bridge::with_registry(options, &registry)?;
        let metrics_addr: SocketAddr = config.metrics.address.parse()?;
        let metrics_listener = TcpListener::bind(metrics_addr).await?;
        info!("Serving metrics on {}", metrics_addr);
        tokio::spawn(serve_metrics(metrics_listener, registry));
        bridge
    } else {
        Bridge::new(options)
    };
    let bridge = Arc::new(bridge);

    // The embedded server behind the bridge
    let upstream: Option<Arc<str>> = config.upstream.as_deref().map(Arc::from);
    let consumer = tokio::spawn(run_consumer(bridge.clone(), upstream));

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Received shutdown signal");
            let _ = bridge.close();
            let _ = shutdown_tx.send(());
        });
    }

    // Run the bridge
    run_bridge(&config, bridge, shutdown_rx).await?;

    if let Err(e) = consumer.await {
        error!("Embedded server task failed: {}", e);
    }
    Ok(())
}

/// Serves the registry in the Prometheus text format on every request.
async fn serve_metrics(listener: TcpListener, registry: Registry) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };
        let registry = registry.clone();
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |_req: Request<Incoming>| {
                let registry = registry.clone();
                async move {
                    let encoder = TextEncoder::new();
                    let metric_families = registry.gather();
                    let mut buffer = vec![];
                    encoder
                        .encode(&metric_families, &mut buffer)
                        .map_err(|e| format!("Metrics encoding error: {}", e))?;
                    Ok::<_, String>(Response::new(Full::new(Bytes::from(buffer))))
                }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Metrics connection error: {}", err);
            }
        });
    }
}

/// Delegate for plain requests reaching the bridge: `GET /healthz` only.
pub fn health_handler() -> HandlerFn<impl Fn(Request<Bytes>) -> std::future::Ready<Response<Bytes>> + Send + Sync>
{
    handler_fn(|req: Request<Bytes>| {
        let response = if req.method() == Method::GET && req.uri().path() == "/healthz" {
            Response::new(Bytes::from_static(b"ok\n"))
        } else {
            status_response(StatusCode::NOT_FOUND)
        };
        std::future::ready(response)
    })
}

/// Accepts tunneled connections until the bridge closes, serving each one
/// as an HTTP/1 connection relayed to `upstream`.
pub async fn run_consumer(bridge: Arc<Bridge>, upstream: Option<Arc<str>>) {
    info!(addr = %bridge.local_addr(), "Embedded server accepting tunneled connections");
    while let Ok(conn) = bridge.accept().await {
        let upstream = upstream.clone();
        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req| relay(req, upstream.clone()));
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(conn), service)
                .await
            {
                debug!("Tunneled connection error: {}", err);
            }
        });
    }
    info!("Bridge closed, embedded server stopped");
}

fn bad_gateway(message: &str) -> Response<RelayBody> {
    let body = Full::new(Bytes::from(format!("{}\n", message)))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}

fn relay(
    req: Request<Incoming>,
    upstream: Option<Arc<str>>,
) -> impl Future<Output = Result<Response<RelayBody>, Infallible>> + Send {
    async move {
        let Some(addr) = upstream else {
            return Ok(bad_gateway("no upstream configured"));
        };
        match forward(req, &addr).await {
            Ok(response) => Ok(response.map(|body| body.boxed())),
            Err(e) => {
                warn!(upstream = %addr, error = %e, "Upstream request failed");
                Ok(bad_gateway("upstream request failed"))
            }
        }
    }
}

async fn forward(
    req: Request<Incoming>,
    addr: &str,
) -> Result<Response<Incoming>, Box<dyn Error + Send + Sync>> {
    let stream = TcpStream::connect(addr).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("Upstream connection error: {}", err);
        }
    });
    Ok(sender.send_request(req).await?)
}
