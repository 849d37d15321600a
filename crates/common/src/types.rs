//! Core types for testenv

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, FaultKind, Result};

/// Build-scoped namespace that qualifies every container, network and
/// session created for one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentIdentity(String);

impl EnvironmentIdentity {
    /// Derive the identity for a build, e.g. `env` + `101` -> `env-build-101`.
    pub fn from_build(prefix: &str, build_id: &str) -> Result<Self> {
        Self::new(&format!("{}-build-{}", prefix, build_id))
    }

    /// Create an identity from a raw name, sanitising it to the characters
    /// container runtimes accept in project names.
    pub fn new(raw: &str) -> Result<Self> {
        let mut name = String::with_capacity(raw.len());
        for c in raw.chars() {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                name.push(c);
            } else {
                name.push('-');
            }
        }
        let name = name.trim_matches(|c: char| c == '-' || c == '_').to_string();
        if name.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "environment identity derived from '{}' is empty",
                raw
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of a resource owned by this environment, e.g. `env-build-101-app`.
    pub fn resource(&self, name: &str) -> String {
        format!("{}-{}", self.0, name)
    }

    /// Compose-style network name, e.g. `env-build-101_default`.
    pub fn network(&self, name: &str) -> String {
        format!("{}_{}", self.0, name)
    }

    /// Unique runner session name; a fresh suffix per call.
    pub fn runner_session(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-runner-{}", self.0, &suffix[..8])
    }
}

impl std::fmt::Display for EnvironmentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bounded polling policy: `attempts` tries spaced `interval_ms` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval_ms: u64,
}

impl PollPolicy {
    pub const fn new(attempts: u32, interval_ms: u64) -> Self {
        Self {
            attempts,
            interval_ms,
        }
    }

    /// HTTP services: 60 attempts, 2 seconds apart.
    pub const fn http() -> Self {
        Self::new(60, 2000)
    }

    /// Databases and in-container readiness commands: 30 attempts, 2 seconds apart.
    pub const fn database() -> Self {
        Self::new(30, 2000)
    }

    /// Port clearing: 30 attempts, 1 second apart.
    pub const fn ports() -> Self {
        Self::new(30, 1000)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Health predicate for a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Probe {
    /// GET the URL; any 2xx is healthy
    Http { url: String },

    /// A TCP connection succeeds
    Tcp { host: String, port: u16 },

    /// Readiness command run inside the service container (via `sh -c`)
    Exec { command: String },
}

impl Probe {
    /// Default polling budget for this kind of probe.
    pub fn default_policy(&self) -> PollPolicy {
        match self {
            Probe::Http { .. } => PollPolicy::http(),
            Probe::Tcp { .. } | Probe::Exec { .. } => PollPolicy::database(),
        }
    }
}

impl std::fmt::Display for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Probe::Http { url } => write!(f, "http {}", url),
            Probe::Tcp { host, port } => write!(f, "tcp {}:{}", host, port),
            Probe::Exec { command } => write!(f, "exec `{}`", command),
        }
    }
}

/// One long-running container the test workload depends on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Compose service name; also the hostname on the internal network
    pub name: String,

    /// Image reference (informational; the compose file is authoritative)
    #[serde(default)]
    pub image: Option<String>,

    /// Build context (informational; the compose file is authoritative)
    #[serde(default)]
    pub build: Option<String>,

    /// Services that must be ready before this one is polled
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Log lines to capture when the service never becomes ready
    #[serde(default = "default_log_tail")]
    pub log_tail: u32,

    pub probe: Probe,

    /// Polling budget; defaults by probe kind
    #[serde(default)]
    pub readiness: Option<PollPolicy>,
}

fn default_log_tail() -> u32 {
    100
}

impl ServiceSpec {
    pub fn poll_policy(&self) -> PollPolicy {
        self.readiness.unwrap_or_else(|| self.probe.default_policy())
    }
}

/// Ordered collection of services
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceSet(Vec<ServiceSpec>);

impl ServiceSet {
    pub fn new(services: Vec<ServiceSpec>) -> Self {
        Self(services)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Dependency order. Independent services keep their declaration order.
    pub fn start_order(&self) -> Result<Vec<&ServiceSpec>> {
        let mut names = BTreeSet::new();
        for service in &self.0 {
            if !names.insert(service.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "service '{}' declared twice",
                    service.name
                )));
            }
        }
        for service in &self.0 {
            for dep in &service.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(Error::InvalidConfig(format!(
                        "service '{}' depends on unknown service '{}'",
                        service.name, dep
                    )));
                }
            }
        }

        let mut placed: BTreeSet<&str> = BTreeSet::new();
        let mut order = Vec::with_capacity(self.0.len());
        while order.len() < self.0.len() {
            let next = self.0.iter().find(|s| {
                !placed.contains(s.name.as_str())
                    && s.depends_on.iter().all(|d| placed.contains(d.as_str()))
            });
            match next {
                Some(service) => {
                    placed.insert(service.name.as_str());
                    order.push(service);
                }
                None => {
                    let stuck: Vec<&str> = self
                        .0
                        .iter()
                        .map(|s| s.name.as_str())
                        .filter(|n| !placed.contains(n))
                        .collect();
                    return Err(Error::InvalidConfig(format!(
                        "dependency cycle between services: {}",
                        stuck.join(", ")
                    )));
                }
            }
        }
        Ok(order)
    }
}

/// Host ports the environment needs exclusively
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<u16>", into = "Vec<u16>")]
pub struct PortReservation(BTreeSet<u16>);

impl PortReservation {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self(ports.into_iter().collect())
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u16>> for PortReservation {
    fn from(ports: Vec<u16>) -> Self {
        Self::new(ports)
    }
}

impl From<PortReservation> for Vec<u16> {
    fn from(reservation: PortReservation) -> Self {
        reservation.0.into_iter().collect()
    }
}

/// How a run's pass/fail is decided when the exit code and the structured
/// result disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCodePolicy {
    /// Trust failure/error counters when a structured result exists
    #[default]
    PreferStructured,
    /// Any non-zero exit is a failure
    ExitCodeOnly,
}

/// Machine-readable report format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFormat {
    #[default]
    Junit,
    Json,
}

/// Where to find the structured result and how to read it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredResultSpec {
    /// Path relative to the output directory, after report collection
    pub path: PathBuf,

    #[serde(default)]
    pub format: ResultFormat,

    /// JSON pointer to the failure counter (json format only)
    #[serde(default = "default_failures_pointer")]
    pub failures_pointer: String,

    /// JSON pointer to the error counter (json format only)
    #[serde(default = "default_errors_pointer")]
    pub errors_pointer: String,

    /// JSON pointer to the total test counter (json format only)
    #[serde(default = "default_tests_pointer")]
    pub tests_pointer: String,
}

fn default_failures_pointer() -> String {
    "/numFailedTests".to_string()
}

fn default_errors_pointer() -> String {
    "/numRuntimeErrorTestSuites".to_string()
}

fn default_tests_pointer() -> String {
    "/numTotalTests".to_string()
}

impl StructuredResultSpec {
    pub fn junit(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: ResultFormat::Junit,
            failures_pointer: default_failures_pointer(),
            errors_pointer: default_errors_pointer(),
            tests_pointer: default_tests_pointer(),
        }
    }

    pub fn json(path: impl Into<PathBuf>) -> Self {
        Self {
            format: ResultFormat::Json,
            ..Self::junit(path)
        }
    }
}

/// Ephemeral container that executes the test workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSessionSpec {
    pub image: String,

    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Host directory holding the code under test
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    /// File or directory names skipped anywhere in the tree
    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,

    #[serde(default)]
    pub install_command: Option<String>,

    pub test_command: String,

    /// Directories inside the session copied out after the run
    #[serde(default = "default_report_dirs")]
    pub report_dirs: Vec<String>,

    #[serde(default)]
    pub exit_code_policy: ExitCodePolicy,

    /// Ceiling for the test command
    #[serde(default = "default_runner_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Logical endpoints, e.g. `APP_URL = "http://app:3000"`
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,

    #[serde(default)]
    pub structured_result: Option<StructuredResultSpec>,
}

fn default_workdir() -> String {
    "/workspace".to_string()
}

fn default_source_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_excludes() -> Vec<String> {
    [
        ".git",
        "node_modules",
        "target",
        "dist",
        "build",
        "coverage",
        "reports",
        "test-results",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_report_dirs() -> Vec<String> {
    vec!["reports".to_string(), "coverage".to_string()]
}

fn default_runner_timeout() -> u64 {
    1800
}

impl Default for RunnerSessionSpec {
    fn default() -> Self {
        Self {
            image: "node:20-bookworm".to_string(),
            workdir: default_workdir(),
            source_dir: default_source_dir(),
            exclude: default_excludes(),
            install_command: Some("npm ci".to_string()),
            test_command: "npm run test:e2e".to_string(),
            env: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            report_dirs: default_report_dirs(),
            structured_result: Some(StructuredResultSpec::junit("reports/junit.xml")),
            exit_code_policy: ExitCodePolicy::default(),
            timeout_secs: default_runner_timeout(),
        }
    }
}

impl RunnerSessionSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Environment variables handed to the session: endpoints first, then
    /// explicit `env` entries, which win on conflict.
    pub fn session_env(&self) -> BTreeMap<String, String> {
        let mut vars = self.endpoints.clone();
        vars.extend(self.env.clone());
        vars
    }
}

/// Failure and error counters read from a machine-readable report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredResult {
    pub tests: u64,
    pub failures: u64,
    pub errors: u64,
    pub skipped: u64,
}

impl StructuredResult {
    pub fn is_clean(&self) -> bool {
        self.failures == 0 && self.errors == 0
    }
}

/// Terminal outcome of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The workload ran and reported no failures
    Passed,

    /// The workload ran to completion and reported failing tests
    Failed {
        failures: u64,
        errors: u64,
        exit_code: Option<i32>,
    },

    /// Infrastructure fault; tests did not produce a verdict
    Fault { kind: FaultKind, message: String },
}

impl RunOutcome {
    pub fn fault(error: &Error) -> Self {
        RunOutcome::Fault {
            kind: error.fault_kind(),
            message: error.to_string(),
        }
    }

    /// Process exit code: 0 pass, 1 failing tests, 2 infrastructure fault.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Passed => 0,
            RunOutcome::Failed { .. } => 1,
            RunOutcome::Fault { .. } => 2,
        }
    }

    pub fn status_state(&self) -> StatusState {
        match self {
            RunOutcome::Passed => StatusState::Success,
            RunOutcome::Failed { .. } => StatusState::Failure,
            RunOutcome::Fault { .. } => StatusState::Error,
        }
    }

    /// One-line description suitable for a commit status.
    pub fn describe(&self) -> String {
        match self {
            RunOutcome::Passed => "E2E tests passed".to_string(),
            RunOutcome::Failed {
                failures, errors, ..
            } => format!("E2E tests failed ({} failures, {} errors)", failures, errors),
            RunOutcome::Fault { kind, .. } => format!("E2E environment error: {}", kind),
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Passed => write!(f, "passed"),
            RunOutcome::Failed { .. } => write!(f, "failed"),
            RunOutcome::Fault { kind, message } => write!(f, "fault ({}): {}", kind, message),
        }
    }
}

/// State posted to the status reporter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

impl std::fmt::Display for StatusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusState::Pending => write!(f, "pending"),
            StatusState::Success => write!(f, "success"),
            StatusState::Failure => write!(f, "failure"),
            StatusState::Error => write!(f, "error"),
        }
    }
}

/// Kind of artifact handed to the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    TestReport,
    Coverage,
}

impl ArtifactKind {
    /// Classify a collected report directory by its name.
    pub fn for_path(path: &std::path::Path) -> Self {
        let is_coverage = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase().contains("coverage"))
            .unwrap_or(false);
        if is_coverage {
            ArtifactKind::Coverage
        } else {
            ArtifactKind::TestReport
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::TestReport => write!(f, "test-report"),
            ArtifactKind::Coverage => write!(f, "coverage"),
        }
    }
}

/// Summary of one run, written as `run-report.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub identity: String,
    pub build_id: String,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    pub outcome: RunOutcome,
    #[serde(default)]
    pub structured_result: Option<StructuredResult>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub teardown_warnings: Vec<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub duration_ms: u64,
}
