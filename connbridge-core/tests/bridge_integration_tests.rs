//! End-to-end tests for the bridge over real sockets.
//!
//! A client speaks raw HTTP/1.1 to the bridge front end; the embedded
//! consumer side is driven through `Bridge::accept`.

use bytes::Bytes;
use connbridge_config::{Config, Metrics, Timeouts};
use connbridge_core::handler::handler_fn;
use connbridge_core::metrics::{FWD_CONN_REJECT, FWD_CONN_SPLICE, PROXY_CONN_ACCEPT, PROXY_CONN_ERROR};
use connbridge_core::{Bridge, BridgeError, BridgeOptions, ServerConfig, run_bridge, server};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

const OK_LINE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";
const UNAVAILABLE_LINE: &str = "HTTP/1.1 503 Service Unavailable\r\n\r\n";

// Helper to start a bridge front end on an ephemeral port
async fn start_bridge(options: BridgeOptions) -> (SocketAddr, Arc<Bridge>, broadcast::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let bridge = Arc::new(Bridge::new(options));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(server::serve(
        vec![listener],
        bridge.clone(),
        ServerConfig::default(),
        shutdown_rx,
    ));
    (addr, bridge, shutdown_tx)
}

fn targets(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// Helper to send a raw request and read until the bridge closes the connection
async fn roundtrip(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("bridge did not close the connection")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

async fn connect_tunnel(addr: SocketAddr, target: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    stream.write_all(request.as_bytes()).await.unwrap();
    stream
}

async fn read_status_line(stream: &mut TcpStream) -> Vec<u8> {
    let mut status = vec![0u8; OK_LINE.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut status))
        .await
        .expect("no status line from bridge")
        .unwrap();
    status
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_matched_connect_reaches_embedded_server() {
    let (addr, bridge, _shutdown) = start_bridge(BridgeOptions {
        targets: targets(&["alpha"]),
        ..Default::default()
    })
    .await;

    // The embedded server: plain hyper over connections from the bridge.
    let consumer = bridge.clone();
    tokio::spawn(async move {
        while let Ok(conn) = consumer.accept().await {
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let body = format!("tunneled {}", req.uri().path());
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(conn), service)
                    .await;
            });
        }
    });

    let mut stream = connect_tunnel(addr, "alpha:443").await;
    assert_eq!(read_status_line(&mut stream).await, OK_LINE);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = Request::get("/hello")
        .header("host", "alpha")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"tunneled /hello");

    assert_eq!(bridge.metrics().get(PROXY_CONN_ACCEPT), Some(1));
    assert_eq!(bridge.close(), Ok(()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bytes_sent_with_connect_are_not_lost() {
    let (addr, bridge, _shutdown) = start_bridge(BridgeOptions {
        targets: targets(&["alpha"]),
        ..Default::default()
    })
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"CONNECT alpha HTTP/1.1\r\nHost: alpha\r\n\r\nearly")
        .await
        .unwrap();

    let mut tunnel = timeout(Duration::from_secs(5), bridge.accept())
        .await
        .unwrap()
        .unwrap();
    let mut early = [0u8; 5];
    tunnel.read_exact(&mut early).await.unwrap();
    assert_eq!(&early, b"early");
    assert_eq!(read_status_line(&mut stream).await, OK_LINE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_target_is_forbidden() {
    let (addr, bridge, _shutdown) = start_bridge(BridgeOptions {
        targets: targets(&["alpha", "beta:443"]),
        ..Default::default()
    })
    .await;

    let response = roundtrip(
        addr,
        "CONNECT gamma HTTP/1.1\r\nHost: gamma\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{}", response);
    assert!(response.contains("target address \"gamma\" not recognized"));
    assert_eq!(bridge.metrics().get(FWD_CONN_REJECT), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forwarded_target_is_spliced() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = echo.accept().await.unwrap();
        let (mut reader, mut writer) = socket.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });

    let (addr, bridge, _shutdown) = start_bridge(BridgeOptions {
        targets: targets(&["alpha"]),
        forward_connect: true,
        ..Default::default()
    })
    .await;

    let mut stream = connect_tunnel(addr, &echo_addr.to_string()).await;
    assert_eq!(read_status_line(&mut stream).await, OK_LINE);

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(bridge.metrics().get(FWD_CONN_SPLICE), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_answers_queued_client_with_503() {
    let (addr, bridge, _shutdown) = start_bridge(BridgeOptions {
        targets: targets(&["alpha"]),
        ..Default::default()
    })
    .await;

    let mut stream = connect_tunnel(addr, "alpha").await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(bridge.close(), Ok(()));

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&response), UNAVAILABLE_LINE);
    assert_eq!(bridge.metrics().get(PROXY_CONN_ERROR), Some(1));
    assert!(matches!(bridge.accept().await, Err(BridgeError::Closed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_releases_blocked_accept() {
    let (_addr, bridge, _shutdown) = start_bridge(BridgeOptions {
        targets: targets(&["alpha"]),
        ..Default::default()
    })
    .await;

    let blocked = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.accept().await.map(|_| ()) })
    };
    sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.close(), Ok(()));

    let result = timeout(Duration::from_secs(5), blocked).await.unwrap().unwrap();
    assert_eq!(result, Err(BridgeError::Closed));
    assert_eq!(bridge.close(), Err(BridgeError::Closed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handoff_timeout_answers_503() {
    let (addr, bridge, _shutdown) = start_bridge(BridgeOptions {
        targets: targets(&["alpha"]),
        handoff_timeout: Duration::from_millis(100),
        ..Default::default()
    })
    .await;

    let mut stream = connect_tunnel(addr, "alpha").await;
    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&response), UNAVAILABLE_LINE);
    assert_eq!(bridge.metrics().get(PROXY_CONN_ACCEPT), Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plain_requests_are_delegated_or_rejected() {
    let health = handler_fn(|req: Request<Bytes>| async move {
        match req.uri().path() {
            "/healthz" => Response::new(Bytes::from_static(b"ok\n")),
            _ => connbridge_core::handler::status_response(StatusCode::NOT_FOUND),
        }
    });
    let (addr, _bridge, _shutdown) = start_bridge(BridgeOptions {
        targets: targets(&["alpha"]),
        handler: Some(Arc::new(health)),
        ..Default::default()
    })
    .await;
    let response = roundtrip(
        addr,
        "GET /healthz HTTP/1.1\r\nHost: bridge\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.ends_with("\r\n\r\nok\n"));

    let (bare_addr, bare_bridge, _bare_shutdown) = start_bridge(BridgeOptions::default()).await;
    let response = roundtrip(
        bare_addr,
        "GET /healthz HTTP/1.1\r\nHost: bridge\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", response);
    assert_eq!(bare_bridge.metrics().get("http_proxy_reject"), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_with_path_is_bad_request() {
    let (addr, _bridge, _shutdown) = start_bridge(BridgeOptions {
        targets: targets(&["alpha"]),
        ..Default::default()
    })
    .await;

    let response = roundtrip(
        addr,
        "CONNECT /alpha HTTP/1.1\r\nHost: alpha\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);
}

// Helper to find an available port
async fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_bridge_serves_configured_listeners() {
    let port = find_available_port().await;
    let config = Config {
        listen_addrs: vec![format!("127.0.0.1:{}", port)],
        targets: targets(&["alpha"]),
        forward_connect: false,
        upstream: None,
        serve_health: false,
        timeouts: Timeouts::default(),
        metrics: Metrics {
            enabled: false,
            address: "127.0.0.1:0".to_string(),
        },
    };
    let bridge = Arc::new(Bridge::new(BridgeOptions::from_config(&config)));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let handle = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            run_bridge(&config, bridge, shutdown_rx)
                .await
                .map_err(|e| e.to_string())
        })
    };

    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let mut connected = None;
    for _ in 0..30 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            connected = Some(stream);
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    let mut stream = connected.expect("bridge should be listening");
    stream
        .write_all(b"CONNECT gamma:443 HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with(b"HTTP/1.1 403 Forbidden\r\n"));

    shutdown_tx.send(()).unwrap();
    let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(result.is_ok());
}
