//! In-memory collaborators for driving the controller without Docker.
//!
//! Every fake appends to one shared event log so tests can assert ordering
//! across the engine, the prober and the reporters.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use testenv_common::{
    ArtifactKind, ControllerConfig, Error, HostContext, PollPolicy, PortReservation, Probe,
    Result, ServiceSet, ServiceSpec, StatusState,
};
use testenv_controller::{
    ArtifactPublisher, ComposeProject, ContainerEngine, Controller, ControllerParts, ExecOutput,
    PortInspector, Prober, SessionLaunch, StatusReporter, UniqueIdentity,
};

pub type Events = Arc<Mutex<Vec<String>>>;

pub fn position(events: &Events, prefix: &str) -> Option<usize> {
    events.lock().iter().position(|e| e.starts_with(prefix))
}

pub fn last_position(events: &Events, prefix: &str) -> Option<usize> {
    events.lock().iter().rposition(|e| e.starts_with(prefix))
}

pub fn count(events: &Events, prefix: &str) -> usize {
    events.lock().iter().filter(|e| e.starts_with(prefix)).count()
}

#[derive(Default)]
struct EngineState {
    containers: BTreeSet<String>,
    networks: BTreeSet<String>,
    publishers: BTreeMap<u16, Vec<String>>,
    reports: BTreeMap<String, Vec<(String, String)>>,
    test_exit_code: i32,
    fail_install: bool,
    hang_tests: bool,
    fail_compose_down: bool,
    fail_create_session: bool,
    fail_copy_in: bool,
    stuck: Vec<String>,
    exec_probe_exit_code: i32,
    hang_exec_probes: bool,
}

/// Container engine that tracks containers and networks in memory
#[derive(Clone)]
pub struct FakeEngine {
    events: Events,
    state: Arc<Mutex<EngineState>>,
}

impl FakeEngine {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            state: Arc::new(Mutex::new(EngineState::default())),
        }
    }

    fn record(&self, event: String) {
        self.events.lock().push(event);
    }

    pub fn add_container(&self, name: &str) {
        self.state.lock().containers.insert(name.to_string());
    }

    pub fn add_network(&self, name: &str) {
        self.state.lock().networks.insert(name.to_string());
    }

    pub fn publish(&self, port: u16, container: &str) {
        let mut state = self.state.lock();
        state.containers.insert(container.to_string());
        state
            .publishers
            .entry(port)
            .or_default()
            .push(container.to_string());
    }

    /// Files the workload leaves in `src` inside the session.
    pub fn with_report(&self, src: &str, file: &str, content: &str) {
        self.state
            .lock()
            .reports
            .entry(src.to_string())
            .or_default()
            .push((file.to_string(), content.to_string()));
    }

    pub fn set_test_exit_code(&self, code: i32) {
        self.state.lock().test_exit_code = code;
    }

    pub fn fail_install(&self) {
        self.state.lock().fail_install = true;
    }

    pub fn hang_tests(&self) {
        self.state.lock().hang_tests = true;
    }

    pub fn fail_compose_down(&self) {
        self.state.lock().fail_compose_down = true;
    }

    pub fn fail_create_session(&self) {
        self.state.lock().fail_create_session = true;
    }

    pub fn fail_copy_in(&self) {
        self.state.lock().fail_copy_in = true;
    }

    /// Containers whose name starts with `prefix` refuse removal.
    pub fn stick(&self, prefix: &str) {
        self.state.lock().stuck.push(prefix.to_string());
    }

    /// Exit code of `compose exec` readiness commands.
    pub fn set_exec_probe_exit_code(&self, code: i32) {
        self.state.lock().exec_probe_exit_code = code;
    }

    pub fn hang_exec_probes(&self) {
        self.state.lock().hang_exec_probes = true;
    }

    pub fn containers(&self) -> Vec<String> {
        self.state.lock().containers.iter().cloned().collect()
    }

    pub fn networks(&self) -> Vec<String> {
        self.state.lock().networks.iter().cloned().collect()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn compose_build(&self, project: &ComposeProject, _parallel: bool) -> Result<()> {
        self.record(format!("compose build {}", project.name));
        Ok(())
    }

    async fn compose_up(&self, project: &ComposeProject) -> Result<()> {
        self.record(format!("compose up {}", project.name));
        let mut state = self.state.lock();
        state.containers.insert(format!("{}-database-1", project.name));
        state.containers.insert(format!("{}-app-1", project.name));
        state.networks.insert(format!("{}_default", project.name));
        Ok(())
    }

    async fn compose_down(&self, project: &ComposeProject) -> Result<()> {
        self.record(format!("compose down {}", project.name));
        if self.state.lock().fail_compose_down {
            return Err(Error::Engine("compose down: daemon not responding".into()));
        }
        let prefix = format!("{}-", project.name);
        let mut state = self.state.lock();
        state
            .containers
            .retain(|c| !(c.starts_with(&prefix) && !c.contains("-runner-")));
        state.networks.remove(&format!("{}_default", project.name));
        Ok(())
    }

    async fn compose_logs(
        &self,
        project: &ComposeProject,
        service: &str,
        tail: u32,
    ) -> Result<String> {
        self.record(format!("compose logs {} {} {}", project.name, service, tail));
        Ok(format!("{} | FATAL: could not bind socket", service))
    }

    async fn compose_exec(
        &self,
        _project: &ComposeProject,
        service: &str,
        command: &str,
    ) -> Result<ExecOutput> {
        self.record(format!("compose exec {} {}", service, command));
        let (hang, exit_code) = {
            let state = self.state.lock();
            (state.hang_exec_probes, state.exec_probe_exit_code)
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(ExecOutput {
            exit_code,
            ..Default::default()
        })
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        Ok(self.containers())
    }

    async fn containers_publishing(&self, port: u16) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .publishers
            .get(&port)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.record(format!("rm {}", name));
        let mut state = self.state.lock();
        if state.stuck.iter().any(|prefix| name.starts_with(prefix.as_str())) {
            return Err(Error::Engine(format!("{}: device or resource busy", name)));
        }
        state.containers.remove(name);
        for names in state.publishers.values_mut() {
            names.retain(|n| n != name);
        }
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        Ok(self.networks())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.record(format!("network rm {}", name));
        self.state.lock().networks.remove(name);
        Ok(())
    }

    async fn create_session(&self, launch: &SessionLaunch) -> Result<()> {
        self.record(format!("create session {} on {}", launch.name, launch.network));
        if self.state.lock().fail_create_session {
            return Err(Error::Engine(format!("image {} not found", launch.image)));
        }
        self.state.lock().containers.insert(launch.name.clone());
        Ok(())
    }

    async fn copy_archive_into(&self, container: &str, archive: &Path, dest: &str) -> Result<()> {
        assert!(archive.is_file(), "archive must exist while copying");
        self.record(format!("copy in {}:{}", container, dest));
        if self.state.lock().fail_copy_in {
            return Err(Error::Engine("no space left on device".into()));
        }
        Ok(())
    }

    async fn exec(
        &self,
        _container: &str,
        _workdir: &str,
        command: &str,
        _timeout: Duration,
    ) -> Result<ExecOutput> {
        self.record(format!("exec {}", command));
        let (fail_install, hang, exit_code) = {
            let state = self.state.lock();
            (state.fail_install, state.hang_tests, state.test_exit_code)
        };
        if command == "npm ci" {
            return Ok(ExecOutput {
                exit_code: if fail_install { 1 } else { 0 },
                stdout: String::new(),
                stderr: if fail_install {
                    "npm ERR! missing lockfile".into()
                } else {
                    String::new()
                },
            });
        }
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(ExecOutput {
            exit_code,
            stdout: "tests done".into(),
            stderr: String::new(),
        })
    }

    async fn copy_out(&self, container: &str, src: &str, dest: &Path) -> Result<bool> {
        self.record(format!("copy out {}:{}", container, src));
        let files = self.state.lock().reports.get(src).cloned();
        match files {
            Some(files) => {
                std::fs::create_dir_all(dest)?;
                for (name, content) in files {
                    std::fs::write(dest.join(name), content)?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Ports that are busy until released; stubborn ports never free up.
#[derive(Clone, Default)]
pub struct FakePorts {
    events: Events,
    busy: Arc<Mutex<BTreeSet<u16>>>,
    stubborn: Arc<Mutex<BTreeSet<u16>>>,
}

impl FakePorts {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    pub fn occupy(&self, port: u16) {
        self.busy.lock().insert(port);
    }

    pub fn occupy_stubbornly(&self, port: u16) {
        self.busy.lock().insert(port);
        self.stubborn.lock().insert(port);
    }
}

#[async_trait]
impl PortInspector for FakePorts {
    async fn is_free(&self, port: u16) -> bool {
        !self.busy.lock().contains(&port)
    }

    async fn release(&self, port: u16) -> Result<usize> {
        self.events.lock().push(format!("release {}", port));
        if self.stubborn.lock().contains(&port) {
            return Ok(0);
        }
        Ok(usize::from(self.busy.lock().remove(&port)))
    }
}

/// Real host ports held by listeners in this process; release drops them.
#[derive(Default)]
pub struct ListenerPorts {
    listeners: Mutex<BTreeMap<u16, TcpListener>>,
}

impl ListenerPorts {
    /// Bind an ephemeral port and return its number.
    pub fn hold(&self) -> u16 {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        self.listeners.lock().insert(port, listener);
        port
    }
}

#[async_trait]
impl PortInspector for ListenerPorts {
    async fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }

    async fn release(&self, port: u16) -> Result<usize> {
        Ok(usize::from(self.listeners.lock().remove(&port).is_some()))
    }
}

/// Prober that reports each service unhealthy a configured number of times
#[derive(Clone, Default)]
pub struct FakeProber {
    events: Events,
    failures: Arc<Mutex<BTreeMap<String, u32>>>,
    never: Arc<Mutex<BTreeSet<String>>>,
}

impl FakeProber {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    pub fn fail_times(&self, service: &str, times: u32) {
        self.failures.lock().insert(service.to_string(), times);
    }

    pub fn never_ready(&self, service: &str) {
        self.never.lock().insert(service.to_string());
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, service: &ServiceSpec) -> Result<bool> {
        let ready = if self.never.lock().contains(&service.name) {
            false
        } else {
            let mut failures = self.failures.lock();
            match failures.get_mut(&service.name) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    false
                }
                _ => true,
            }
        };
        self.events
            .lock()
            .push(format!("probe {} {}", service.name, ready));
        Ok(ready)
    }
}

/// Status reporter that records every state it is given
#[derive(Clone, Default)]
pub struct RecordingReporter {
    events: Events,
    pub states: Arc<Mutex<Vec<StatusState>>>,
    unreachable: Arc<Mutex<bool>>,
}

impl RecordingReporter {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    /// Every later report fails as if the status endpoint were down.
    pub fn go_unreachable(&self) {
        *self.unreachable.lock() = true;
    }

    pub fn last(&self) -> Option<StatusState> {
        self.states.lock().last().copied()
    }
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn report(&self, state: StatusState, context: &str, description: &str) -> Result<()> {
        self.events
            .lock()
            .push(format!("status {} {} {}", state, context, description));
        if *self.unreachable.lock() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "status endpoint unreachable",
            )));
        }
        self.states.lock().push(state);
        Ok(())
    }
}

/// Artifact publisher that records what it was asked to publish
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    events: Events,
    pub published: Arc<Mutex<Vec<(ArtifactKind, PathBuf)>>>,
    full: Arc<Mutex<bool>>,
}

impl RecordingPublisher {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    /// Every later publish fails as if the archive were out of space.
    pub fn fill_up(&self) {
        *self.full.lock() = true;
    }
}

#[async_trait]
impl ArtifactPublisher for RecordingPublisher {
    async fn publish(&self, kind: ArtifactKind, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(Error::ExecutionFault(format!("{} missing", path.display())));
        }
        if *self.full.lock() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "archive volume full",
            )));
        }
        self.events
            .lock()
            .push(format!("publish {} {}", kind, path.display()));
        self.published.lock().push((kind, path.to_path_buf()));
        Ok(())
    }
}

pub const JUNIT_CLEAN: &str =
    r#"<testsuites tests="4" failures="0" errors="0"><testsuite name="e2e" tests="4" failures="0" errors="0"/></testsuites>"#;

pub const JUNIT_FAILING: &str =
    r#"<testsuites tests="4" failures="2" errors="0"><testsuite name="e2e" tests="4" failures="2" errors="0"/></testsuites>"#;

/// A controller wired to fakes, with its scratch directories
pub struct Harness {
    pub events: Events,
    pub engine: FakeEngine,
    pub ports: FakePorts,
    pub prober: FakeProber,
    pub reporter: RecordingReporter,
    pub publisher: RecordingPublisher,
    pub config: ControllerConfig,
    pub workspace: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let events: Events = Arc::default();
        let workspace = tempfile::tempdir().unwrap();
        let source = workspace.path().join("src");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("package.json"), "{}").unwrap();

        let fast = Some(PollPolicy::new(3, 1));
        let mut config = ControllerConfig::default();
        config.output_dir = workspace.path().join("test-results");
        config.ports.reserved = PortReservation::new([3000, 5432]);
        config.ports.clear = PollPolicy::new(3, 1);
        config.services = ServiceSet::new(vec![
            ServiceSpec {
                name: "database".into(),
                image: Some("postgres:16".into()),
                build: None,
                depends_on: vec![],
                log_tail: 50,
                probe: Probe::Exec {
                    command: "pg_isready -U postgres".into(),
                },
                readiness: fast,
            },
            ServiceSpec {
                name: "app".into(),
                image: None,
                build: Some(".".into()),
                depends_on: vec!["database".into()],
                log_tail: 50,
                probe: Probe::Http {
                    url: "http://127.0.0.1:3000/health".into(),
                },
                readiness: fast,
            },
        ]);
        config.runner.source_dir = source;

        Self {
            engine: FakeEngine::new(events.clone()),
            ports: FakePorts::new(events.clone()),
            prober: FakeProber::new(events.clone()),
            reporter: RecordingReporter::new(events.clone()),
            publisher: RecordingPublisher::new(events.clone()),
            events,
            config,
            workspace,
        }
    }

    pub fn host(build_id: &str) -> HostContext {
        HostContext {
            build_id: build_id.to_string(),
            commit_sha: Some("0123abcd".into()),
            branch: Some("main".into()),
            ..Default::default()
        }
    }

    pub fn controller(&self, build_id: &str) -> Controller {
        Controller::new(
            self.config.clone(),
            Self::host(build_id),
            ControllerParts {
                engine: Arc::new(self.engine.clone()),
                ports: Arc::new(self.ports.clone()),
                prober: Arc::new(self.prober.clone()),
                reporter: Box::new(self.reporter.clone()),
                publisher: Box::new(self.publisher.clone()),
                isolation: Box::new(UniqueIdentity),
            },
        )
        .unwrap()
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }
}
