//! Container engine abstraction
//!
//! Everything the controller asks of Docker/Podman goes through
//! [`ContainerEngine`], so the lifecycle can be driven against the real CLI
//! ([`crate::docker::DockerCli`]) or an in-memory fake in tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use testenv_common::{EnvironmentIdentity, Result};

/// A compose project scoped to one environment identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeProject {
    /// Project name (`-p`); the environment identity
    pub name: String,

    /// Compose files (`-f`)
    pub files: Vec<PathBuf>,

    /// Working directory for compose commands
    pub project_dir: PathBuf,
}

impl ComposeProject {
    pub fn new(identity: &EnvironmentIdentity, files: Vec<PathBuf>, project_dir: PathBuf) -> Self {
        Self {
            name: identity.as_str().to_string(),
            files,
            project_dir,
        }
    }
}

/// Parameters for the runner session container
#[derive(Debug, Clone)]
pub struct SessionLaunch {
    pub name: String,
    pub image: String,
    pub network: String,
    pub workdir: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// Captured result of a command run inside a container
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `lines` lines of combined output, for diagnostics.
    pub fn tail(&self, lines: usize) -> String {
        let combined: Vec<&str> = self
            .stdout
            .lines()
            .chain(self.stderr.lines())
            .collect();
        let start = combined.len().saturating_sub(lines);
        combined[start..].join("\n")
    }
}

/// Operations the controller needs from a container runtime.
///
/// Removal operations are idempotent: removing something that does not exist
/// succeeds.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Build every image in the project
    async fn compose_build(&self, project: &ComposeProject, parallel: bool) -> Result<()>;

    /// Start every service detached
    async fn compose_up(&self, project: &ComposeProject) -> Result<()>;

    /// Stop and remove services, networks and volumes
    async fn compose_down(&self, project: &ComposeProject) -> Result<()>;

    /// Recent log output of one service
    async fn compose_logs(&self, project: &ComposeProject, service: &str, tail: u32)
        -> Result<String>;

    /// Run a readiness command inside a service container
    async fn compose_exec(
        &self,
        project: &ComposeProject,
        service: &str,
        command: &str,
    ) -> Result<ExecOutput>;

    /// Names of all containers, running or not
    async fn list_containers(&self) -> Result<Vec<String>>;

    /// Names of containers publishing a host port
    async fn containers_publishing(&self, port: u16) -> Result<Vec<String>>;

    /// Force-remove a container
    async fn remove_container(&self, name: &str) -> Result<()>;

    /// Names of all networks
    async fn list_networks(&self) -> Result<Vec<String>>;

    /// Remove a network
    async fn remove_network(&self, name: &str) -> Result<()>;

    /// Create and start the runner session container
    async fn create_session(&self, launch: &SessionLaunch) -> Result<()>;

    /// Extract a tar archive into `dest` inside the container
    async fn copy_archive_into(&self, container: &str, archive: &Path, dest: &str) -> Result<()>;

    /// Run a shell command inside the container
    async fn exec(
        &self,
        container: &str,
        workdir: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput>;

    /// Copy `src` out of the container to `dest`. Returns `false` when `src`
    /// does not exist.
    async fn copy_out(&self, container: &str, src: &str, dest: &Path) -> Result<bool>;
}
