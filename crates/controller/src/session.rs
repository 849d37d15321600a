//! Runner session - the disposable container that executes the test workload
//!
//! The session joins the environment's internal network and reaches services
//! by their logical names, never through host-mapped ports. Its lifecycle is
//! create → copy source → install → test → collect reports → remove, and the
//! last two steps run on every path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::engine::{ContainerEngine, ExecOutput, SessionLaunch};
use crate::results::{load_structured_result, resolve_outcome};
use testenv_common::{
    EnvironmentIdentity, Error, Result, RunOutcome, RunnerSessionSpec, StructuredResult,
};

/// What one session produced. A session that faulted or was cancelled still
/// carries whatever reports it left behind.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
    pub structured: Option<StructuredResult>,
    pub artifacts: Vec<PathBuf>,
}

/// A runner session bound to one environment
pub struct RunnerSession {
    engine: Arc<dyn ContainerEngine>,
    spec: RunnerSessionSpec,
    name: String,
    network: String,
    identity: EnvironmentIdentity,
}

impl RunnerSession {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        spec: RunnerSessionSpec,
        name: String,
        network: String,
        identity: EnvironmentIdentity,
    ) -> Self {
        Self {
            engine,
            spec,
            name,
            network,
            identity,
        }
    }

    /// Run the workload and collect its reports into `output_dir`.
    ///
    /// Cancellation interrupts the workload but not collection: reports are
    /// copied out and the session container is removed on every path.
    pub async fn execute(&self, output_dir: &Path, cancel: &CancellationToken) -> ExecutionSummary {
        let run = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Runner session {} interrupted", self.name);
                Err(Error::Cancelled)
            }
            run = self.drive() => run,
        };

        let artifacts = self.collect_reports(output_dir).await;

        if let Err(e) = self.engine.remove_container(&self.name).await {
            warn!("Failed to remove runner session {}: {}", self.name, e);
        }

        let output = match run {
            Ok(output) => output,
            Err(e) => {
                return ExecutionSummary {
                    outcome: RunOutcome::fault(&e),
                    exit_code: None,
                    structured: None,
                    artifacts,
                }
            }
        };

        let structured = match &self.spec.structured_result {
            Some(spec) => match load_structured_result(spec, output_dir) {
                Ok(result) => result,
                Err(e) => {
                    warn!("Could not read structured result: {}", e);
                    None
                }
            },
            None => None,
        };
        let outcome = resolve_outcome(
            self.spec.exit_code_policy,
            output.exit_code,
            structured.as_ref(),
        );

        ExecutionSummary {
            outcome,
            exit_code: Some(output.exit_code),
            structured,
            artifacts,
        }
    }

    /// Create, populate, install and run. Returns the test command's output.
    async fn drive(&self) -> Result<ExecOutput> {
        let mut labels = BTreeMap::new();
        labels.insert("testenv.identity".to_string(), self.identity.to_string());
        labels.insert("testenv.role".to_string(), "runner".to_string());

        let launch = SessionLaunch {
            name: self.name.clone(),
            image: self.spec.image.clone(),
            network: self.network.clone(),
            workdir: self.spec.workdir.clone(),
            env: self.spec.session_env(),
            labels,
        };

        info!("Creating runner session {} on {}", self.name, self.network);
        self.engine
            .create_session(&launch)
            .await
            .map_err(|e| Error::ExecutionFault(format!("cannot create runner session: {}", e)))?;

        let archive = archive_source(&self.spec.source_dir, &self.spec.exclude).await?;
        self.engine
            .copy_archive_into(&self.name, archive.path(), &self.spec.workdir)
            .await
            .map_err(|e| Error::ExecutionFault(format!("cannot copy sources: {}", e)))?;

        if let Some(install) = &self.spec.install_command {
            info!("Installing runner dependencies: {}", install);
            let output = self
                .engine
                .exec(&self.name, &self.spec.workdir, install, self.spec.timeout())
                .await
                .map_err(|e| Error::ExecutionFault(format!("dependency install: {}", e)))?;
            if !output.success() {
                return Err(Error::ExecutionFault(format!(
                    "dependency install exited {}:\n{}",
                    output.exit_code,
                    output.tail(40)
                )));
            }
        }

        info!("Running tests: {}", self.spec.test_command);
        let output = self
            .engine
            .exec(
                &self.name,
                &self.spec.workdir,
                &self.spec.test_command,
                self.spec.timeout(),
            )
            .await?;
        info!("Test command exited {}", output.exit_code);
        debug!("Test output tail:\n{}", output.tail(60));
        Ok(output)
    }

    /// Copy each report directory to `<output_dir>/<basename>`.
    async fn collect_reports(&self, output_dir: &Path) -> Vec<PathBuf> {
        let mut collected = Vec::new();
        if let Err(e) = tokio::fs::create_dir_all(output_dir).await {
            warn!("Cannot create output dir {}: {}", output_dir.display(), e);
            return collected;
        }

        for dir in &self.spec.report_dirs {
            let src = if dir.starts_with('/') {
                dir.clone()
            } else {
                format!("{}/{}", self.spec.workdir.trim_end_matches('/'), dir)
            };
            let name = Path::new(dir)
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| dir.into());
            let dest = output_dir.join(name);
            // Stale reports from an earlier run must not be mistaken for this one's.
            if dest.exists() {
                if let Err(e) = tokio::fs::remove_dir_all(&dest).await {
                    warn!("Cannot clear stale {}: {}", dest.display(), e);
                }
            }

            match self.engine.copy_out(&self.name, &src, &dest).await {
                Ok(true) => {
                    info!("Collected {} -> {}", src, dest.display());
                    collected.push(dest);
                }
                Ok(false) => warn!("Report directory {} not produced", src),
                Err(e) => warn!("Failed to collect {}: {}", src, e),
            }
        }
        collected
    }
}

/// Tar `source_dir` into a temp file, skipping excluded names at any depth.
pub async fn archive_source(source_dir: &Path, exclude: &[String]) -> Result<NamedTempFile> {
    let source_dir = source_dir.to_path_buf();
    let exclude = exclude.to_vec();
    tokio::task::spawn_blocking(move || build_archive(&source_dir, &exclude))
        .await
        .map_err(|e| Error::ExecutionFault(format!("archive task failed: {}", e)))?
}

fn build_archive(source_dir: &Path, exclude: &[String]) -> Result<NamedTempFile> {
    if !source_dir.is_dir() {
        return Err(Error::ExecutionFault(format!(
            "source directory {} does not exist",
            source_dir.display()
        )));
    }

    let file = NamedTempFile::new()?;
    let mut builder = tar::Builder::new(file.reopen()?);
    builder.follow_symlinks(false);

    let walker = WalkDir::new(source_dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !exclude.iter().any(|x| x.as_str() == name)
        });

    let mut count = 0usize;
    for entry in walker {
        let entry = entry.map_err(|e| Error::ExecutionFault(format!("walking sources: {}", e)))?;
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|e| Error::ExecutionFault(e.to_string()))?;
        if entry.file_type().is_dir() {
            builder.append_dir(relative, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), relative)?;
            count += 1;
        }
    }
    builder.finish()?;
    debug!("Archived {} files from {}", count, source_dir.display());
    Ok(file)
}
