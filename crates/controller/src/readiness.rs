//! Service readiness - probing and bounded polling

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::engine::{ComposeProject, ContainerEngine};
use testenv_common::{Error, Probe, Result, ServiceSpec};

/// Budget for one in-container readiness command, `compose exec` startup included
const EXEC_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Evaluates a service's health predicate once
#[async_trait]
pub trait Prober: Send + Sync {
    /// `Ok(true)` when healthy, `Ok(false)` when not yet. Errors are treated
    /// as "not yet" by the poller.
    async fn probe(&self, service: &ServiceSpec) -> Result<bool>;
}

/// [`Prober`] that runs HTTP and TCP probes from the host and exec probes
/// inside the service container.
pub struct HostProber {
    engine: Arc<dyn ContainerEngine>,
    project: ComposeProject,
    client: reqwest::Client,
    connect_timeout: Duration,
    exec_timeout: Duration,
}

impl HostProber {
    pub fn new(engine: Arc<dyn ContainerEngine>, project: ComposeProject) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            engine,
            project,
            client,
            connect_timeout: Duration::from_secs(2),
            exec_timeout: EXEC_PROBE_TIMEOUT,
        })
    }

    pub fn with_exec_timeout(mut self, limit: Duration) -> Self {
        self.exec_timeout = limit;
        self
    }
}

#[async_trait]
impl Prober for HostProber {
    async fn probe(&self, service: &ServiceSpec) -> Result<bool> {
        match &service.probe {
            Probe::Http { url } => match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => Ok(true),
                Ok(resp) => {
                    debug!("{} health check returned {}", service.name, resp.status());
                    Ok(false)
                }
                Err(e) => {
                    // Connection refused is expected while the service is starting
                    if !e.is_connect() {
                        debug!("{} health check error: {}", service.name, e);
                    }
                    Ok(false)
                }
            },
            Probe::Tcp { host, port } => {
                let connect = TcpStream::connect((host.as_str(), *port));
                Ok(matches!(timeout(self.connect_timeout, connect).await, Ok(Ok(_))))
            }
            Probe::Exec { command } => {
                let exec = self.engine.compose_exec(&self.project, &service.name, command);
                match timeout(self.exec_timeout, exec).await {
                    Ok(output) => Ok(output?.success()),
                    Err(_) => {
                        debug!(
                            "{} readiness command timed out after {:?}",
                            service.name, self.exec_timeout
                        );
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// Poll one service until its probe succeeds or its attempt budget runs out.
///
/// On exhaustion the service's recent logs are captured and the run fails
/// with `EnvironmentNotReady`. Returns the number of attempts used.
pub async fn wait_until_ready(
    prober: &dyn Prober,
    engine: &dyn ContainerEngine,
    project: &ComposeProject,
    service: &ServiceSpec,
) -> Result<u32> {
    let policy = service.poll_policy();
    info!(
        "Waiting for {} ({}; up to {} x {}ms)",
        service.name, service.probe, policy.attempts, policy.interval_ms
    );

    for attempt in 1..=policy.attempts {
        match prober.probe(service).await {
            Ok(true) => {
                info!("{} is ready after {} attempt(s)", service.name, attempt);
                return Ok(attempt);
            }
            Ok(false) => debug!(
                "{} not ready (attempt {}/{})",
                service.name, attempt, policy.attempts
            ),
            Err(e) => debug!(
                "{} probe error (attempt {}/{}): {}",
                service.name, attempt, policy.attempts, e
            ),
        }
        if attempt < policy.attempts {
            sleep(policy.interval()).await;
        }
    }

    let logs = match engine
        .compose_logs(project, &service.name, service.log_tail)
        .await
    {
        Ok(logs) => logs,
        Err(e) => format!("<failed to capture logs: {}>", e),
    };
    warn!(
        "{} never became ready; last {} log lines:\n{}",
        service.name, service.log_tail, logs
    );

    Err(Error::EnvironmentNotReady {
        service: service.name.clone(),
        attempts: policy.attempts,
        logs,
    })
}
