//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use tunnel_proxy::config::ProxyConfig;
use tunnel_proxy::lifecycle::startup::{self, RunningProxy};

/// Request heads received by a mock origin, in arrival order.
pub type Captured = mpsc::UnboundedReceiver<String>;

/// Start an origin on a loopback port that answers every request with `response`.
///
/// Each request head (everything up to the blank line) is sent to the returned receiver.
pub async fn start_mock_origin(response: &'static str) -> (SocketAddr, Captured) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let head = read_head(&mut socket).await;
                let _ = tx.send(head);
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, rx)
}

/// Start an origin that accepts connections and never answers.
pub async fn start_silent_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    addr
}

/// An address nothing is listening on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn read_head(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Proxy configuration bound to an ephemeral loopback port.
pub fn proxy_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.timeouts.request_secs = 2;
    config.timeouts.shutdown_grace_secs = 2;
    config
}

pub async fn start_proxy(config: &ProxyConfig) -> RunningProxy {
    startup::start(config).await.unwrap()
}

/// Write `request` to the proxy, half-close, and read until it closes the connection.
pub async fn exchange(proxy: SocketAddr, request: &str) -> String {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(request.as_bytes()).await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
        .await
        .expect("proxy did not close the connection")
        .unwrap();
    String::from_utf8_lossy(&reply).into_owned()
}

/// Wait for the next captured request head.
pub async fn next_head(captured: &mut Captured) -> String {
    tokio::time::timeout(Duration::from_secs(5), captured.recv())
        .await
        .expect("origin saw no request")
        .expect("origin stopped")
}
