//! Tunnel process management
//!
//! One external tunnel process per local port, started as
//! `<binary> run -c <config>` and confirmed by connecting to the port.

pub mod config;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::TunnelConfig;
use crate::error::{EgressError, Result};
use crate::models::Node;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Starts and stops the tunnel serving a local SOCKS port
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    /// Bring up a tunnel for `node` on `port`, replacing whatever ran there.
    /// On error nothing is left running on the port.
    async fn start(&self, port: u16, node: &Node) -> Result<()>;

    /// Stop the tunnel on `port` and wait for the port to be released
    async fn stop(&self, port: u16) -> Result<()>;

    /// Whether a tunnel process is alive on `port`
    fn is_running(&self, port: u16) -> bool;

    /// Stop every tunnel
    async fn stop_all(&self);
}

/// Runs the tunnel binary as child processes
pub struct TunnelManager {
    config: TunnelConfig,
    processes: Mutex<HashMap<u16, Child>>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            processes: Mutex::new(HashMap::new()),
        }
    }

    fn config_path(&self, port: u16) -> PathBuf {
        self.config.work_dir.join(format!("tunnel-{}.json", port))
    }

    fn log_path(&self, port: u16) -> PathBuf {
        self.config.work_dir.join(format!("tunnel-{}.log", port))
    }

    async fn write_config(&self, port: u16, node: &Node) -> Result<PathBuf> {
        let rendered = config::render(node, port)?;
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        let path = self.config_path(port);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&rendered)?).await?;
        Ok(path)
    }

    async fn spawn(&self, port: u16, config_path: &Path) -> Result<Child> {
        let log = tokio::fs::File::create(self.log_path(port))
            .await?
            .into_std()
            .await;
        Command::new(&self.config.binary)
            .arg("run")
            .arg("-c")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EgressError::Process(format!(
                    "failed to launch {}: {}",
                    self.config.binary.display(),
                    e
                ))
            })
    }

    /// Wait until the child listens on `port`, exits, or the startup window ends
    async fn await_startup(&self, child: &mut Child, port: u16) -> Result<()> {
        let deadline = Instant::now() + self.config.startup_wait;
        loop {
            if let Some(status) = child.try_wait()? {
                let detail = self
                    .last_log_line(port)
                    .await
                    .map(|l| format!(": {}", l))
                    .unwrap_or_default();
                return Err(EgressError::Process(format!(
                    "tunnel on port {} exited during startup ({}){}",
                    port, status, detail
                )));
            }
            if port_is_listening(port).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EgressError::Process(format!(
                    "tunnel did not bind port {} within {:?}",
                    port, self.config.startup_wait
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn last_log_line(&self, port: u16) -> Option<String> {
        let content = tokio::fs::read_to_string(self.log_path(port)).await.ok()?;
        content
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
    }

    async fn cleanup_files(&self, port: u16) {
        for path in [self.config_path(port), self.log_path(port)] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }

    async fn terminate(&self, mut child: Child, port: u16) {
        send_sigterm(&mut child);
        match timeout(self.config.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!(port, %status, "Tunnel exited"),
            Ok(Err(e)) => warn!(port, "Failed waiting for tunnel: {}", e),
            Err(_) => {
                warn!(port, "Tunnel ignored SIGTERM; killing");
                if let Err(e) = child.kill().await {
                    warn!(port, "Failed to kill tunnel: {}", e);
                }
            }
        }
    }

    async fn wait_port_released(&self, port: u16) -> Result<()> {
        let deadline = Instant::now() + self.config.port_release_timeout;
        while !port_is_free(port).await {
            if Instant::now() >= deadline {
                return Err(EgressError::PortNotReleased { port });
            }
            sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelLauncher for TunnelManager {
    #[instrument(skip(self, node), fields(node = %node.key(), protocol = node.protocol()))]
    async fn start(&self, port: u16, node: &Node) -> Result<()> {
        node.validate()?;
        self.stop(port).await?;

        if !port_is_free(port).await {
            return Err(EgressError::PortInUse { port });
        }

        let config_path = self.write_config(port, node).await?;
        let mut child = match self.spawn(port, &config_path).await {
            Ok(child) => child,
            Err(e) => {
                self.cleanup_files(port).await;
                return Err(e);
            }
        };

        if let Err(e) = self.await_startup(&mut child, port).await {
            warn!(port, "Tunnel failed to start: {}", e);
            self.terminate(child, port).await;
            self.cleanup_files(port).await;
            return Err(e);
        }

        info!(port, pid = child.id().unwrap_or_default(), "Tunnel started");
        self.processes.lock().insert(port, child);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self, port: u16) -> Result<()> {
        let child = self.processes.lock().remove(&port);
        let Some(child) = child else {
            return Ok(());
        };

        self.terminate(child, port).await;
        self.cleanup_files(port).await;
        self.wait_port_released(port).await?;
        debug!(port, "Tunnel stopped and port released");
        Ok(())
    }

    fn is_running(&self, port: u16) -> bool {
        let mut processes = self.processes.lock();
        match processes.get_mut(&port) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn stop_all(&self) {
        let ports: Vec<u16> = self.processes.lock().keys().copied().collect();
        let results = futures::future::join_all(ports.iter().map(|&port| self.stop(port))).await;
        for (port, result) in ports.iter().zip(results) {
            if let Err(e) = result {
                warn!(port, "Failed to stop tunnel: {}", e);
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    let _ = child.start_kill();
}

/// Whether nothing is bound to `127.0.0.1:<port>`
pub async fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

/// Whether something accepts connections on `127.0.0.1:<port>`
pub async fn port_is_listening(port: u16) -> bool {
    matches!(
        timeout(
            Duration::from_millis(300),
            TcpStream::connect(("127.0.0.1", port))
        )
        .await,
        Ok(Ok(_))
    )
}
