//! Docker/Podman CLI backend.
//!
//! Provides [`DockerCli`], the [`ContainerEngine`] used in production. Every
//! invocation is bounded by a timeout and its child process is killed if the
//! surrounding future is dropped (e.g. on cancellation).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

use crate::engine::{ComposeProject, ContainerEngine, ExecOutput, SessionLaunch};
use testenv_common::{Error, Result};

/// Container runtime detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    /// Detect available container runtime
    pub async fn detect() -> Option<Self> {
        for runtime in [Self::Docker, Self::Podman] {
            let found = AsyncCommand::new(runtime.command())
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map(|s| s.success())
                .unwrap_or(false);
            if found {
                return Some(runtime);
            }
        }
        None
    }

    /// Get the CLI command name
    pub fn command(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

/// [`ContainerEngine`] backed by the `docker` (or `podman`) CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    runtime: ContainerRuntime,
    command_timeout: Duration,
}

impl DockerCli {
    pub fn new(runtime: ContainerRuntime, command_timeout: Duration) -> Self {
        Self {
            runtime,
            command_timeout,
        }
    }

    /// Use whichever runtime is installed, preferring Docker
    pub async fn detect(command_timeout: Duration) -> Result<Self> {
        let runtime = ContainerRuntime::detect()
            .await
            .ok_or_else(|| Error::Engine("neither docker nor podman found in PATH".to_string()))?;
        debug!("Using container runtime: {}", runtime.command());
        Ok(Self::new(runtime, command_timeout))
    }

    /// Shell-style rendering of an invocation, for logs and errors
    fn command_line(&self, args: &[String]) -> String {
        format!("{} {}", self.runtime.command(), args.join(" "))
    }

    fn compose_args(project: &ComposeProject) -> Vec<String> {
        let mut args = vec!["compose".to_string(), "-p".to_string(), project.name.clone()];
        for file in &project.files {
            args.push("-f".to_string());
            args.push(file.to_string_lossy().to_string());
        }
        args
    }

    async fn output(
        &self,
        args: &[String],
        stdin: Option<&Path>,
        timeout: Duration,
        cwd: Option<&Path>,
    ) -> Result<Output> {
        let shown = self.command_line(args);
        debug!("Running: {}", shown);

        let mut cmd = AsyncCommand::new(self.runtime.command());
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match stdin {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(Error::CommandTimeout {
                command: shown,
                seconds: timeout.as_secs(),
            }),
        }
    }

    /// Run and require success, returning stdout.
    async fn run(&self, args: &[String], cwd: Option<&Path>) -> Result<String> {
        let output = self.output(args, None, self.command_timeout, cwd).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(Error::Engine(format!(
                "`{}` failed: {}",
                self.command_line(args),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Like [`Self::run`], but treats "not found" failures as success.
    async fn run_idempotent(&self, args: &[String]) -> Result<()> {
        let output = self.output(args, None, self.command_timeout, None).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            debug!("Already absent: {}", stderr.trim());
            return Ok(());
        }
        Err(Error::Engine(format!(
            "`{}` failed: {}",
            self.command_line(args),
            stderr.trim()
        )))
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container")
        || lower.contains("no such network")
        || lower.contains("not found")
        || lower.contains("no such object")
}

fn lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn compose_build(&self, project: &ComposeProject, parallel: bool) -> Result<()> {
        let mut args = Self::compose_args(project);
        args.push("build".to_string());
        if parallel && self.runtime == ContainerRuntime::Docker {
            args.push("--parallel".to_string());
        }
        self.run(&args, Some(&project.project_dir)).await?;
        Ok(())
    }

    async fn compose_up(&self, project: &ComposeProject) -> Result<()> {
        let mut args = Self::compose_args(project);
        args.extend(to_args(&["up", "-d", "--no-build"]));
        self.run(&args, Some(&project.project_dir)).await?;
        Ok(())
    }

    async fn compose_down(&self, project: &ComposeProject) -> Result<()> {
        let mut args = Self::compose_args(project);
        args.extend(to_args(&["down", "--volumes", "--remove-orphans", "--timeout", "10"]));
        self.run(&args, Some(&project.project_dir)).await?;
        Ok(())
    }

    async fn compose_logs(
        &self,
        project: &ComposeProject,
        service: &str,
        tail: u32,
    ) -> Result<String> {
        let mut args = Self::compose_args(project);
        args.extend(to_args(&["logs", "--no-color", "--tail"]));
        args.push(tail.to_string());
        args.push(service.to_string());
        let output = self
            .output(&args, None, self.command_timeout, Some(&project.project_dir))
            .await?;
        let mut logs = String::from_utf8_lossy(&output.stdout).to_string();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    async fn compose_exec(
        &self,
        project: &ComposeProject,
        service: &str,
        command: &str,
    ) -> Result<ExecOutput> {
        let mut args = Self::compose_args(project);
        args.extend(to_args(&["exec", "-T", service, "sh", "-c", command]));
        let output = self
            .output(&args, None, self.command_timeout, Some(&project.project_dir))
            .await?;
        Ok(exec_output(output))
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let stdout = self
            .run(&to_args(&["ps", "-a", "--format", "{{.Names}}"]), None)
            .await?;
        Ok(lines(&stdout))
    }

    async fn containers_publishing(&self, port: u16) -> Result<Vec<String>> {
        let filter = format!("publish={}", port);
        let stdout = self
            .run(
                &to_args(&["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"]),
                None,
            )
            .await?;
        Ok(lines(&stdout))
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.run_idempotent(&to_args(&["rm", "-f", "-v", name])).await
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        let stdout = self
            .run(&to_args(&["network", "ls", "--format", "{{.Name}}"]), None)
            .await?;
        Ok(lines(&stdout))
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.run_idempotent(&to_args(&["network", "rm", name])).await
    }

    async fn create_session(&self, launch: &SessionLaunch) -> Result<()> {
        let mut args = to_args(&["run", "-d", "--name", &launch.name]);
        args.extend(to_args(&["--network", &launch.network, "-w", &launch.workdir]));
        for (key, value) in &launch.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &launch.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(launch.image.clone());
        args.extend(to_args(&["tail", "-f", "/dev/null"]));
        self.run(&args, None).await?;
        Ok(())
    }

    async fn copy_archive_into(&self, container: &str, archive: &Path, dest: &str) -> Result<()> {
        let target = format!("{}:{}", container, dest);
        let args = to_args(&["cp", "-", &target]);
        let output = self
            .output(&args, Some(archive), self.command_timeout, None)
            .await?;
        if !output.status.success() {
            return Err(Error::Engine(format!(
                "copy into {} failed: {}",
                target,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn exec(
        &self,
        container: &str,
        workdir: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let args = to_args(&["exec", "-w", workdir, container, "sh", "-c", command]);
        let output = self.output(&args, None, timeout, None).await?;
        Ok(exec_output(output))
    }

    async fn copy_out(&self, container: &str, src: &str, dest: &Path) -> Result<bool> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let source = format!("{}:{}", container, src);
        let args = vec![
            "cp".to_string(),
            source.clone(),
            dest.to_string_lossy().to_string(),
        ];
        let output = self
            .output(&args, None, self.command_timeout, None)
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) || stderr.contains("Could not find the file") {
            warn!("Nothing to copy at {}", source);
            return Ok(false);
        }
        Err(Error::Engine(format!(
            "copy out of {} failed: {}",
            source,
            stderr.trim()
        )))
    }
}

fn exec_output(output: Output) -> ExecOutput {
    ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }
}
