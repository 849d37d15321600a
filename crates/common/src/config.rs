//! Controller configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{
    EnvironmentIdentity, PollPolicy, PortReservation, Probe, RunnerSessionSpec, ServiceSet,
    ServiceSpec,
};

/// Controller configuration, loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Where reports and `run-report.json` land
    pub output_dir: PathBuf,

    /// Ceiling for each container-engine command
    pub command_timeout_secs: u64,

    /// Compose project settings
    pub project: ProjectConfig,

    /// Services, in declaration order
    pub services: ServiceSet,

    /// Reserved host ports
    pub ports: PortsConfig,

    /// Test runner session
    pub runner: RunnerSessionSpec,

    /// Cross-run isolation strategy
    pub isolation: IsolationConfig,

    /// Status and artifact reporting
    pub reporting: ReportingConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            project: ProjectConfig::default(),
            services: ServiceSet::new(vec![
                ServiceSpec {
                    name: "database".to_string(),
                    image: Some("postgres:16".to_string()),
                    build: None,
                    depends_on: vec![],
                    probe: Probe::Exec {
                        command: "pg_isready -U postgres".to_string(),
                    },
                    readiness: None,
                    log_tail: 100,
                },
                ServiceSpec {
                    name: "app".to_string(),
                    image: None,
                    build: Some(".".to_string()),
                    depends_on: vec!["database".to_string()],
                    probe: Probe::Http {
                        url: "http://127.0.0.1:3000/health".to_string(),
                    },
                    readiness: None,
                    log_tail: 100,
                },
            ]),
            ports: PortsConfig::default(),
            runner: RunnerSessionSpec::default(),
            isolation: IsolationConfig::default(),
            reporting: ReportingConfig::default(),
            output_dir: PathBuf::from("test-results"),
            command_timeout_secs: 600,
        }
    }
}

/// Compose project configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Prefix for the environment identity (`<prefix>-build-<id>`)
    pub identity_prefix: String,

    /// Compose files, relative to `project_dir`
    pub compose_files: Vec<PathBuf>,

    /// Working directory for compose commands
    pub project_dir: PathBuf,

    /// Fixed container/network names left behind by older pipelines
    pub legacy_names: Vec<String>,

    /// Compose network the runner session joins
    pub network: String,

    /// Build images with `--parallel`
    pub build_parallel: bool,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            identity_prefix: "env".to_string(),
            compose_files: vec![PathBuf::from("docker-compose.e2e.yml")],
            project_dir: PathBuf::from("."),
            legacy_names: vec![],
            network: "default".to_string(),
            build_parallel: true,
        }
    }
}

/// Reserved port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Host ports the environment binds exclusively
    pub reserved: PortReservation,

    /// Polling budget while waiting for ports to free up
    pub clear: PollPolicy,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            reserved: PortReservation::new([3000, 5432]),
            clear: PollPolicy::ports(),
        }
    }
}

/// Strategy keeping concurrent runs apart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum IsolationConfig {
    /// Every resource is named after the build-scoped identity
    UniqueIdentity,

    /// Exclusive file lock on a named resource
    CooperativeLock {
        lock_dir: PathBuf,
        resource: String,
        #[serde(default = "default_lock_timeout")]
        timeout_secs: u64,
    },
}

fn default_lock_timeout() -> u64 {
    1800
}

impl Default for IsolationConfig {
    fn default() -> Self {
        IsolationConfig::UniqueIdentity
    }
}

/// Status and artifact reporting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    /// Status context, e.g. `ci/e2e`
    pub context: String,

    /// Copy collected artifacts here when set
    pub archive_dir: Option<PathBuf>,

    /// Post commit statuses to GitHub when set
    pub github: Option<GitHubConfig>,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            context: "ci/e2e".to_string(),
            github: None,
            archive_dir: None,
        }
    }
}

/// GitHub commit status target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_github_api")]
    pub api_url: String,

    /// `owner/repo`
    pub repository: String,
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

/// Context the CI host provides for one build
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    pub build_id: String,
    pub commit_sha: Option<String>,
    pub github_token: Option<String>,
    pub branch: Option<String>,
    /// Link to the CI build page, attached to commit statuses
    pub build_url: Option<String>,
}

impl ControllerConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations the controller cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.project.compose_files.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one compose file is required".to_string(),
            ));
        }
        if self.runner.test_command.trim().is_empty() {
            return Err(Error::InvalidConfig("runner.test_command is empty".to_string()));
        }
        if self.runner.image.trim().is_empty() {
            return Err(Error::InvalidConfig("runner.image is empty".to_string()));
        }
        if self.ports.clear.attempts == 0 {
            return Err(Error::InvalidConfig(
                "ports.clear.attempts must be at least 1".to_string(),
            ));
        }
        for service in self.services.iter() {
            if service.poll_policy().attempts == 0 {
                return Err(Error::InvalidConfig(format!(
                    "service '{}' has a zero-attempt readiness budget",
                    service.name
                )));
            }
        }
        self.services.start_order()?;
        Ok(())
    }

    /// Identity for the build described by `host`.
    pub fn identity(&self, host: &HostContext) -> Result<EnvironmentIdentity> {
        if host.build_id.trim().is_empty() {
            return Err(Error::InvalidConfig("build id is empty".to_string()));
        }
        EnvironmentIdentity::from_build(&self.project.identity_prefix, &host.build_id)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Compose files resolved against the project directory
    pub fn compose_paths(&self) -> Vec<PathBuf> {
        self.project
            .compose_files
            .iter()
            .map(|f| {
                if f.is_absolute() {
                    f.clone()
                } else {
                    self.project.project_dir.join(f)
                }
            })
            .collect()
    }
}
