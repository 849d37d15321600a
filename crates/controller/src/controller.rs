//! Main controller that orchestrates reconciliation, bring-up, the runner
//! session and teardown for one build.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::docker::DockerCli;
use crate::engine::{ComposeProject, ContainerEngine};
use crate::isolation::{self, IsolationStrategy};
use crate::ports::{HostPorts, PortInspector};
use crate::readiness::{wait_until_ready, HostProber, Prober};
use crate::reconcile::{NamePattern, Reconciler};
use crate::reporter::{
    ArtifactPublisher, DirectoryPublisher, GitHubStatusReporter, LogPublisher, LogReporter,
    StatusReporter,
};
use crate::session::{ExecutionSummary, RunnerSession};
use testenv_common::{
    ArtifactKind, ControllerConfig, EnvironmentIdentity, Error, HostContext, Result, RunOutcome,
    RunReport, StatusState, RUN_REPORT_FILE,
};

/// Pluggable collaborators of a [`Controller`]
pub struct ControllerParts {
    pub engine: Arc<dyn ContainerEngine>,
    pub ports: Arc<dyn PortInspector>,
    pub prober: Arc<dyn Prober>,
    pub reporter: Box<dyn StatusReporter>,
    pub publisher: Box<dyn ArtifactPublisher>,
    pub isolation: Box<dyn IsolationStrategy>,
}

/// Owns one environment for the duration of one run
pub struct Controller {
    config: ControllerConfig,
    host: HostContext,
    identity: EnvironmentIdentity,
    project: ComposeProject,
    engine: Arc<dyn ContainerEngine>,
    prober: Arc<dyn Prober>,
    reporter: Box<dyn StatusReporter>,
    publisher: Box<dyn ArtifactPublisher>,
    isolation: Box<dyn IsolationStrategy>,
    reconciler: Reconciler,
}

impl Controller {
    /// Create a controller with explicit collaborators
    pub fn new(config: ControllerConfig, host: HostContext, parts: ControllerParts) -> Result<Self> {
        config.validate()?;
        let identity = config.identity(&host)?;
        let project = ComposeProject::new(
            &identity,
            config.compose_paths(),
            config.project.project_dir.clone(),
        );
        let reconciler = Reconciler::new(
            parts.engine.clone(),
            parts.ports.clone(),
            project.clone(),
            NamePattern::new(identity.clone(), config.project.legacy_names.clone()),
            config.ports.reserved.clone(),
            config.ports.clear,
        );

        Ok(Self {
            config,
            host,
            identity,
            project,
            engine: parts.engine,
            prober: parts.prober,
            reporter: parts.reporter,
            publisher: parts.publisher,
            isolation: parts.isolation,
            reconciler,
        })
    }

    /// Create a controller wired to the local container runtime and the
    /// collaborators selected by configuration
    pub async fn from_config(config: ControllerConfig, host: HostContext) -> Result<Self> {
        let engine: Arc<dyn ContainerEngine> =
            Arc::new(DockerCli::detect(config.command_timeout()).await?);
        let identity = config.identity(&host)?;
        let project = ComposeProject::new(
            &identity,
            config.compose_paths(),
            config.project.project_dir.clone(),
        );
        let prober: Arc<dyn Prober> = Arc::new(HostProber::new(engine.clone(), project)?);
        let reporter = build_reporter(&config, &host)?;
        let publisher: Box<dyn ArtifactPublisher> = match &config.reporting.archive_dir {
            Some(dir) => Box::new(DirectoryPublisher::new(dir.clone())),
            None => Box::new(LogPublisher),
        };
        let isolation = isolation::from_config(&config.isolation);

        Self::new(
            config,
            host,
            ControllerParts {
                engine,
                ports: Arc::new(HostPorts::new()),
                prober,
                reporter,
                publisher,
                isolation,
            },
        )
    }

    pub fn identity(&self) -> &EnvironmentIdentity {
        &self.identity
    }

    /// Pre-run reconciliation on its own
    pub async fn reconcile(&self) -> Result<()> {
        self.reconciler.reconcile().await
    }

    /// Run the full lifecycle. Always returns a report; teardown has run by
    /// the time it does, whatever happened before.
    pub async fn run(&self, cancel: CancellationToken) -> RunReport {
        let span = info_span!(
            "run",
            identity = %self.identity,
            branch = self.host.branch.as_deref().unwrap_or("-"),
        );
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(&self, cancel: CancellationToken) -> RunReport {
        let started_at = chrono::Utc::now();
        let start = Instant::now();
        let mut warnings = Vec::new();

        self.post_status(
            StatusState::Pending,
            "E2E environment starting",
            &mut warnings,
        )
        .await;

        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            guard = self.isolation.acquire(&self.identity) => guard,
        };
        let guard = match guard {
            Ok(guard) => guard,
            Err(e) => {
                // Without the lock the environment may belong to another run;
                // leave it alone.
                error!("Could not isolate run: {}", e);
                let outcome = RunOutcome::fault(&e);
                return self
                    .finish(outcome, None, started_at, start, warnings)
                    .await;
            }
        };

        let session_name = self.identity.runner_session();
        let result = self.execute(&session_name, &cancel).await;

        warnings.extend(self.teardown(Some(&session_name)).await);
        drop(guard);

        let (outcome, summary) = match result {
            Ok(summary) => (summary.outcome.clone(), Some(summary)),
            Err(e) => {
                error!("Run aborted: {}", e);
                if let Error::EnvironmentNotReady { logs, .. } = &e {
                    self.save_diagnostics(logs, &mut warnings).await;
                }
                (RunOutcome::fault(&e), None)
            }
        };

        // Published whatever the outcome, partial reports of a fault included
        if let Some(summary) = &summary {
            for artifact in &summary.artifacts {
                let kind = ArtifactKind::for_path(artifact);
                if let Err(e) = self.publisher.publish(kind, artifact).await {
                    let warning = format!("failed to publish {}: {}", artifact.display(), e);
                    warn!("{}", warning);
                    warnings.push(warning);
                }
            }
        }

        self.finish(outcome, summary, started_at, start, warnings)
            .await
    }

    /// Reconcile, bring up, run the session. Cancellation before the session
    /// starts is an error; once it runs, the session itself observes the
    /// token so its reports are still collected.
    async fn execute(&self, session_name: &str, cancel: &CancellationToken) -> Result<ExecutionSummary> {
        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Run cancelled, tearing down");
                Err(Error::Cancelled)
            }
            prepared = async {
                self.reconciler.reconcile().await?;
                self.bring_up().await
            } => prepared,
        };
        prepared?;

        let session = RunnerSession::new(
            self.engine.clone(),
            self.config.runner.clone(),
            session_name.to_string(),
            self.identity.network(&self.config.project.network),
            self.identity.clone(),
        );
        Ok(session.execute(&self.config.output_dir, cancel).await)
    }

    /// Build images, re-clear ports, start services and wait for every one
    /// of them to pass its probe.
    pub async fn bring_up(&self) -> Result<()> {
        info!("Building images for {}", self.project.name);
        self.engine
            .compose_build(&self.project, self.config.project.build_parallel)
            .await?;

        // A long build gives other processes time to grab a reserved port.
        self.reconciler.clear_ports().await?;

        info!("Starting services for {}", self.project.name);
        self.engine.compose_up(&self.project).await?;

        for service in self.config.services.start_order()? {
            wait_until_ready(
                self.prober.as_ref(),
                self.engine.as_ref(),
                &self.project,
                service,
            )
            .await?;
        }
        info!("All {} services ready", self.config.services.len());
        Ok(())
    }

    /// Release everything this environment owns. Never fails; problems come
    /// back as warnings. Safe to call repeatedly.
    pub async fn teardown(&self, session: Option<&str>) -> Vec<String> {
        info!("Tearing down {}", self.project.name);
        let mut warnings = Vec::new();

        if let Some(name) = session {
            if let Err(e) = self.engine.remove_container(name).await {
                warnings.push(format!("failed to remove runner session {}: {}", name, e));
            }
        }

        warnings.extend(self.reconciler.remove_stale_resources().await);

        if let Err(e) = self.reconciler.clear_ports().await {
            warnings.push(format!("port cleanup after teardown: {}", e));
        }

        for warning in &warnings {
            warn!("Teardown: {}", warning);
        }
        warnings
    }

    async fn finish(
        &self,
        outcome: RunOutcome,
        summary: Option<ExecutionSummary>,
        started_at: chrono::DateTime<chrono::Utc>,
        start: Instant,
        mut warnings: Vec<String>,
    ) -> RunReport {
        self.post_status(outcome.status_state(), &outcome.describe(), &mut warnings)
            .await;

        let report = RunReport {
            identity: self.identity.to_string(),
            build_id: self.host.build_id.clone(),
            commit_sha: self.host.commit_sha.clone(),
            branch: self.host.branch.clone(),
            outcome,
            structured_result: summary.as_ref().and_then(|s| s.structured),
            exit_code: summary.as_ref().and_then(|s| s.exit_code),
            artifacts: summary.map(|s| s.artifacts).unwrap_or_default(),
            teardown_warnings: warnings,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        match write_report(&self.config.output_dir, &report) {
            Ok(path) => info!("Run report written to {}", path.display()),
            Err(e) => warn!("Failed to write run report: {}", e),
        }
        info!("Run finished: {}", report.outcome);
        report
    }

    async fn post_status(&self, state: StatusState, description: &str, warnings: &mut Vec<String>) {
        let context = &self.config.reporting.context;
        if let Err(e) = self.reporter.report(state, context, description).await {
            let warning = format!("failed to report {} status: {}", state, e);
            warn!("{}", warning);
            warnings.push(warning);
        }
    }

    async fn save_diagnostics(&self, logs: &str, warnings: &mut Vec<String>) {
        let dir = &self.config.output_dir;
        let path = dir.join("service-logs.txt");
        let result = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, logs).await
        }
        .await;
        if let Err(e) = result {
            warnings.push(format!("failed to save service logs: {}", e));
        }
    }
}

fn build_reporter(config: &ControllerConfig, host: &HostContext) -> Result<Box<dyn StatusReporter>> {
    let github = match &config.reporting.github {
        Some(github) => github,
        None => return Ok(Box::new(LogReporter)),
    };
    match (&host.commit_sha, &host.github_token) {
        (Some(sha), Some(token)) => {
            let mut reporter =
                GitHubStatusReporter::new(&github.api_url, &github.repository, sha, token.clone())?;
            if let Some(url) = &host.build_url {
                reporter = reporter.with_target_url(url);
            }
            Ok(Box::new(reporter))
        }
        _ => {
            warn!("GitHub reporting configured but commit sha or token missing; logging statuses only");
            Ok(Box::new(LogReporter))
        }
    }
}

/// Write the run report as pretty JSON into `output_dir`.
pub fn write_report(output_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join(RUN_REPORT_FILE);
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(&path, json)?;
    Ok(path)
}
