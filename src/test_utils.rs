//! Loopback servers for tests: a minimal no-auth SOCKS5 proxy and a tiny
//! HTTP/1.1 responder.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::catalog::{NodeTester, TestOutcome};
use crate::config::DispatchConfig;
use crate::error::{EgressError, Result};
use crate::exit::Exit;
use crate::health::ExitProbe;
use crate::models::{Node, NodeParams};
use crate::tunnel::TunnelLauncher;

/// Running SOCKS5 test proxy
pub struct TestSocksProxy {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
}

impl TestSocksProxy {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Start a SOCKS5 proxy (no auth, CONNECT only) on an ephemeral port
pub async fn spawn_socks5_proxy() -> TestSocksProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = spawn_socks5_on(listener);
    TestSocksProxy { addr, connections }
}

/// Serve SOCKS5 on an already bound listener
pub fn spawn_socks5_on(listener: TcpListener) -> Arc<AtomicUsize> {
    spawn_socks5_task(listener).0
}

/// Like [`spawn_socks5_on`]; aborting the handle closes the listener
pub fn spawn_socks5_task(listener: TcpListener) -> (Arc<AtomicUsize>, JoinHandle<()>) {
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    let handle = tokio::spawn(async move {
        while let Ok((client, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let _ = serve_socks5(client).await;
            });
        }
    });
    (connections, handle)
}

async fn serve_socks5(mut client: TcpStream) -> std::io::Result<()> {
    // Greeting: VER, NMETHODS, METHODS...
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await?;
    let mut methods = vec![0u8; header[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[0x05, 0x00]).await?;

    // Request: VER, CMD, RSV, ATYP
    let mut req = [0u8; 4];
    client.read_exact(&mut req).await?;
    let target = match req[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            format!("[{}]", Ipv6Addr::from(ip))
        }
        _ => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    let mut server = match TcpStream::connect(format!("{}:{}", target, port)).await {
        Ok(s) => s,
        Err(e) => {
            // Connection refused
            client
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            return Err(e);
        }
    };
    client
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;

    tokio::io::copy_bidirectional(&mut client, &mut server).await?;
    Ok(())
}

/// Start an HTTP server answering every request with `status` and `body`
pub async fn spawn_http_responder(status: u16, body: &str) -> SocketAddr {
    let body = body.to_string();
    spawn_http_server(move |_, _| (status, body.clone())).await
}

/// Start an HTTP server whose answer is computed from the request number
/// (0-based) and the raw request head.
pub async fn spawn_http_server<F>(handler: F) -> SocketAddr
where
    F: Fn(usize, &str) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    let seq = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let handler = handler.clone();
            let seq = seq.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let n = match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let head = String::from_utf8_lossy(&buf).into_owned();
                let (status, body) = handler(seq.fetch_add(1, Ordering::SeqCst), &head);
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{}",
                    status,
                    reason(status),
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    addr
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        302 => "Found",
        403 => "Forbidden",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

/// A free loopback port (bound then released)
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn test_node(i: usize) -> Node {
    Node {
        name: format!("test-{}", i),
        host: format!("n{}.example.net", i),
        port: 443,
        params: NodeParams::Trojan {
            password: "secret".to_string(),
            tls: None,
            transport: None,
        },
    }
}

/// Tunnel exit bound to `test_node(index)` on `port`
pub fn bound_exit(index: usize, port: u16, policy: &DispatchConfig) -> Arc<Exit> {
    let exit = Exit::tunnel(index, port, policy).unwrap();
    exit.bind(test_node(index)).unwrap();
    Arc::new(exit)
}

/// Tunnel launcher backed by in-process SOCKS5 proxies. Nodes marked broken
/// fail to start the way a crashing tunnel binary would.
#[derive(Default)]
pub struct SocksLauncher {
    broken: Mutex<HashSet<String>>,
    running: Mutex<HashMap<u16, JoinHandle<()>>>,
    pub starts: AtomicUsize,
    pub concurrent: AtomicUsize,
    pub peak: AtomicUsize,
}

impl SocksLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broken(nodes: &[usize]) -> Self {
        let launcher = Self::new();
        for &i in nodes {
            launcher.break_node(&test_node(i).key());
        }
        launcher
    }

    pub fn break_node(&self, key: &str) {
        self.broken.lock().insert(key.to_string());
    }

    /// Simulate the tunnel process on `port` dying
    pub async fn kill(&self, port: u16) {
        let handle = self.running.lock().remove(&port);
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl TunnelLauncher for SocksLauncher {
    async fn start(&self, port: u16, node: &Node) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.broken.lock().contains(&node.key()) {
            return Err(EgressError::Process("tunnel exited during startup".into()));
        }
        self.stop(port).await?;
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let (_, handle) = spawn_socks5_task(listener);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.running.lock().insert(port, handle);
        Ok(())
    }

    async fn stop(&self, port: u16) -> Result<()> {
        self.kill(port).await;
        Ok(())
    }

    fn is_running(&self, port: u16) -> bool {
        self.running.lock().contains_key(&port)
    }

    async fn stop_all(&self) {
        let ports: Vec<u16> = self.running.lock().keys().copied().collect();
        for port in ports {
            self.kill(port).await;
        }
    }
}

/// Probe that always succeeds and reports a fixed egress IP
pub struct StaticProbe {
    pub ip: IpAddr,
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        }
    }
}

#[async_trait]
impl ExitProbe for StaticProbe {
    async fn check(&self, _exit: &Exit) -> Result<Duration> {
        Ok(Duration::from_millis(5))
    }

    async fn detect_ip(&self, _exit: &Exit) -> Option<IpAddr> {
        Some(self.ip)
    }
}

/// Node tester that passes every node with a fixed latency
pub struct PassingTester;

#[async_trait]
impl NodeTester for PassingTester {
    async fn test_batch(&self, nodes: Vec<Node>) -> Vec<TestOutcome> {
        nodes
            .into_iter()
            .map(|n| TestOutcome {
                key: n.key(),
                latency: Some(Duration::from_millis(10)),
            })
            .collect()
    }
}

/// Contiguous run of `count` free loopback ports
pub fn free_port_range(count: usize) -> u16 {
    loop {
        let base = free_port();
        if base as usize + count >= u16::MAX as usize {
            continue;
        }
        let all_free = (0..count as u16)
            .all(|i| std::net::TcpListener::bind(("127.0.0.1", base + i)).is_ok());
        if all_free {
            return base;
        }
    }
}
