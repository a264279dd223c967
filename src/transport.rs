//! Lightweight HTTP/1.1 client for probes
//!
//! Dials either directly or through a tunnel's local SOCKS5 port and issues a
//! single plain-HTTP request over a hyper http1 connection. Forwarded user
//! traffic goes through the per-exit reqwest client instead.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Limited};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;
use url::Url;

use crate::error::{EgressError, Result};

const USER_AGENT: &str = concat!("egress-dispatch/", env!("CARGO_PKG_VERSION"));

/// Probe responses are small; anything past this is cut off
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Outcome of a probe request
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub elapsed: Duration,
}

/// Open a TCP stream to `host:port`, through the SOCKS5 listener on
/// `127.0.0.1:<socks_port>` when given.
pub async fn connect(socks_port: Option<u16>, host: &str, port: u16) -> Result<TcpStream> {
    let Some(socks_port) = socks_port else {
        return TcpStream::connect(format_tcp_addr(host, port))
            .await
            .map_err(|e| EgressError::transport("direct", format!("TCP connect failed: {}", e)));
    };

    let proxy_addr = format_tcp_addr("127.0.0.1", socks_port);
    connect_via_socks5(&proxy_addr, host, port).await.map_err(|e| {
        EgressError::transport(
            &proxy_addr,
            format!("SOCKS5 connect to {} failed: {}", format_tcp_addr(host, port), e),
        )
    })
}

async fn connect_via_socks5(
    proxy_addr: &str,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let socket = TcpStream::connect(proxy_addr).await?;
    // Hostname is passed through so the tunnel resolves it remotely
    let stream = Socks5Stream::connect_with_socket(socket, (target_host, target_port)).await?;
    Ok(stream.into_inner())
}

/// GET `url` (plain http only) with an overall deadline
pub async fn get(socks_port: Option<u16>, url: &str, deadline: Duration) -> Result<ProbeResponse> {
    timeout(deadline, get_inner(socks_port, url))
        .await
        .map_err(|_| EgressError::Timeout)?
}

async fn get_inner(socks_port: Option<u16>, url: &str) -> Result<ProbeResponse> {
    let (host, port, path) = parse_http_url(url)?;
    let started = Instant::now();

    let stream = connect(socks_port, &host, port).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| EgressError::Http(format!("Handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Probe connection ended: {}", e);
        }
    });

    let request = Request::get(path)
        .header(hyper::header::HOST, host_header(&host, port))
        .header(hyper::header::USER_AGENT, USER_AGENT)
        .header(hyper::header::ACCEPT, "*/*")
        .header(hyper::header::CONNECTION, "close")
        .body(Empty::<Bytes>::new())
        .map_err(|e| EgressError::InvalidRequest(format!("Failed to build request: {}", e)))?;

    let response = sender.send_request(request).await?;
    let status = response.status();
    let body = Limited::new(response.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| EgressError::Http(format!("Failed to read response: {}", e)))?
        .to_bytes();

    Ok(ProbeResponse {
        status,
        body,
        elapsed: started.elapsed(),
    })
}

/// Split an http URL into host, port and request target
pub fn parse_http_url(raw: &str) -> Result<(String, u16, String)> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" {
        return Err(EgressError::UnsupportedScheme(url.scheme().to_string()));
    }

    let host = url
        .host_str()
        .ok_or_else(|| EgressError::InvalidRequest(format!("Missing host in {}", raw)))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_string();
    let port = url.port_or_known_default().unwrap_or(80);

    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    Ok((host, port, path))
}

fn host_header(host: &str, port: u16) -> String {
    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    if port == 80 {
        host
    } else {
        format!("{}:{}", host, port)
    }
}

pub(crate) fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
