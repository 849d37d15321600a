//! Host port inspection and release

use async_trait::async_trait;
use std::net::TcpListener;
use std::process::Stdio;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

use testenv_common::Result;

/// Observes and frees host ports
#[async_trait]
pub trait PortInspector: Send + Sync {
    /// True when nothing is listening on the port
    async fn is_free(&self, port: u16) -> bool;

    /// Terminate whatever host process holds the port. Returns the number of
    /// processes signalled.
    async fn release(&self, port: u16) -> Result<usize>;
}

/// [`PortInspector`] for the local host: wildcard bind checks plus
/// `lsof` + SIGKILL.
#[derive(Debug, Clone, Default)]
pub struct HostPorts;

impl HostPorts {
    pub fn new() -> Self {
        Self
    }

    /// PIDs with a listening socket on `port`, excluding this process.
    async fn listeners(&self, port: u16) -> Vec<i32> {
        let output = AsyncCommand::new("lsof")
            .args(["-t", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) => parse_pids(&String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                warn!("lsof unavailable, cannot identify holders of port {}: {}", port, e);
                vec![]
            }
        }
    }
}

#[async_trait]
impl PortInspector for HostPorts {
    async fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }

    async fn release(&self, port: u16) -> Result<usize> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let mut killed = 0;
        for pid in self.listeners(port).await {
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) => {
                    info!("Killed pid {} holding port {}", pid, port);
                    killed += 1;
                }
                Err(e) => warn!("Failed to kill pid {} holding port {}: {}", pid, port, e),
            }
        }
        if killed == 0 {
            debug!("No killable host process found on port {}", port);
        }
        Ok(killed)
    }
}

fn parse_pids(stdout: &str) -> Vec<i32> {
    let own = std::process::id() as i32;
    let mut pids: Vec<i32> = stdout
        .lines()
        .filter_map(|l| l.trim().parse::<i32>().ok())
        .filter(|pid| *pid > 1 && *pid != own)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}
