//! testenv Controller
//!
//! Drives an ephemeral, build-scoped test environment through its lifecycle:
//! - Reconciles the host (stale containers, networks and busy ports)
//! - Builds and starts the compose services, polling each until healthy
//! - Runs the test workload in a disposable runner session on the
//!   environment's internal network
//! - Collects reports, resolves pass/fail from structured results, and
//!   tears everything down on every path
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Controller::run                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  IsolationStrategy::acquire() -> IsolationGuard             │
//! │  Reconciler                                                 │
//! │    ├── remove_stale_resources()   (compose down + pattern)  │
//! │    └── clear_ports()              (PortInspector + poll)    │
//! │  bring_up()                                                 │
//! │    ├── compose build / up                                   │
//! │    └── wait_until_ready(service)  (Prober, dependency order)│
//! │  RunnerSession::execute()                                   │
//! │    ├── create → copy source → install → test                │
//! │    ├── collect_reports()          (always)                  │
//! │    └── resolve_outcome()          (structured result wins)  │
//! │  teardown()                       (always, idempotent)      │
//! │  ArtifactPublisher / StatusReporter                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ContainerEngine  ── DockerCli (docker / podman)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod controller;
pub mod docker;
pub mod engine;
pub mod isolation;
pub mod ports;
pub mod readiness;
pub mod reconcile;
pub mod reporter;
pub mod results;
pub mod session;

pub use controller::{write_report, Controller, ControllerParts};
pub use docker::{ContainerRuntime, DockerCli};
pub use engine::{ComposeProject, ContainerEngine, ExecOutput, SessionLaunch};
pub use isolation::{CooperativeLock, IsolationGuard, IsolationStrategy, UniqueIdentity};
pub use ports::{HostPorts, PortInspector};
pub use readiness::{wait_until_ready, HostProber, Prober};
pub use reconcile::{NamePattern, Reconciler};
pub use reporter::{
    ArtifactPublisher, DirectoryPublisher, GitHubStatusReporter, LogPublisher, LogReporter,
    StatusReporter,
};
pub use session::{ExecutionSummary, RunnerSession};
