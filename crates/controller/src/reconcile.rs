//! Environment reconciliation
//!
//! One idempotent routine that drives the host to a clean state: no
//! containers or networks left over from earlier runs, and every reserved
//! port free. It runs before bring-up and again during teardown.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::{ComposeProject, ContainerEngine};
use crate::ports::PortInspector;
use testenv_common::{EnvironmentIdentity, Error, PollPolicy, PortReservation, Result};

/// Names of resources that belong to an environment: identity-scoped names
/// plus fixed legacy names.
#[derive(Debug, Clone)]
pub struct NamePattern {
    identity: EnvironmentIdentity,
    legacy: Vec<String>,
}

impl NamePattern {
    pub fn new(identity: EnvironmentIdentity, legacy: Vec<String>) -> Self {
        Self { identity, legacy }
    }

    /// Matches `<identity>`, `<identity>-*`, `<identity>_*` and legacy names.
    /// `env-build-1` does not match `env-build-10-app`.
    pub fn matches(&self, name: &str) -> bool {
        let name = name.trim_start_matches('/');
        if self.legacy.iter().any(|l| l == name) {
            return true;
        }
        let id = self.identity.as_str();
        match name.strip_prefix(id) {
            Some("") => true,
            Some(rest) => rest.starts_with('-') || rest.starts_with('_'),
            None => false,
        }
    }
}

/// Drives the host to a clean state for one environment
pub struct Reconciler {
    engine: Arc<dyn ContainerEngine>,
    ports: Arc<dyn PortInspector>,
    project: ComposeProject,
    pattern: NamePattern,
    reservation: PortReservation,
    policy: PollPolicy,
}

impl Reconciler {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        ports: Arc<dyn PortInspector>,
        project: ComposeProject,
        pattern: NamePattern,
        reservation: PortReservation,
        policy: PollPolicy,
    ) -> Self {
        Self {
            engine,
            ports,
            project,
            pattern,
            reservation,
            policy,
        }
    }

    /// Full pre-run reconciliation. Fails with `EnvironmentDirty` when
    /// reserved ports stay occupied.
    pub async fn reconcile(&self) -> Result<()> {
        info!("Reconciling environment {}", self.project.name);
        for warning in self.remove_stale_resources().await {
            warn!("{}", warning);
        }
        self.clear_ports().await
    }

    /// Remove the compose project, then every container and network matching
    /// the name pattern. Failures are returned as warnings; the port poll is
    /// the arbiter of cleanliness.
    pub async fn remove_stale_resources(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = self.engine.compose_down(&self.project).await {
            warnings.push(format!("compose down for {} failed: {}", self.project.name, e));
        }

        match self.engine.list_containers().await {
            Ok(names) => {
                for name in names.iter().filter(|n| self.pattern.matches(n)) {
                    debug!("Removing stale container {}", name);
                    if let Err(e) = self.engine.remove_container(name).await {
                        warnings.push(format!("failed to remove container {}: {}", name, e));
                    }
                }
            }
            Err(e) => warnings.push(format!("failed to list containers: {}", e)),
        }

        match self.engine.list_networks().await {
            Ok(names) => {
                for name in names.iter().filter(|n| self.pattern.matches(n)) {
                    debug!("Removing stale network {}", name);
                    if let Err(e) = self.engine.remove_network(name).await {
                        warnings.push(format!("failed to remove network {}: {}", name, e));
                    }
                }
            }
            Err(e) => warnings.push(format!("failed to list networks: {}", e)),
        }

        warnings
    }

    /// Free every reserved port and wait until each is observably free.
    pub async fn clear_ports(&self) -> Result<()> {
        if self.reservation.is_empty() {
            return Ok(());
        }

        for port in self.reservation.ports() {
            if self.ports.is_free(port).await {
                continue;
            }
            info!("Port {} is busy, clearing", port);
            match self.engine.containers_publishing(port).await {
                Ok(names) => {
                    for name in names {
                        info!("Removing container {} publishing port {}", name, port);
                        if let Err(e) = self.engine.remove_container(&name).await {
                            warn!("Failed to remove container {}: {}", name, e);
                        }
                    }
                }
                Err(e) => warn!("Failed to list containers publishing {}: {}", port, e),
            }
            if let Err(e) = self.ports.release(port).await {
                warn!("Failed to release port {}: {}", port, e);
            }
        }

        self.wait_for_free_ports().await
    }

    async fn wait_for_free_ports(&self) -> Result<()> {
        let mut busy = Vec::new();
        for attempt in 1..=self.policy.attempts {
            busy.clear();
            for port in self.reservation.ports() {
                if !self.ports.is_free(port).await {
                    busy.push(port);
                }
            }
            if busy.is_empty() {
                debug!("All reserved ports free after {} attempt(s)", attempt);
                return Ok(());
            }
            debug!(
                "Ports still busy (attempt {}/{}): {:?}",
                attempt, self.policy.attempts, busy
            );
            if attempt < self.policy.attempts {
                tokio::time::sleep(self.policy.interval()).await;
            }
        }
        Err(Error::EnvironmentDirty { ports: busy })
    }
}
