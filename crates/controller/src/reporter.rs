//! External collaborators: status reporting and artifact publishing

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use walkdir::WalkDir;

use testenv_common::{ArtifactKind, Error, Result, StatusState};

/// Posts build status to a VCS host
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, state: StatusState, context: &str, description: &str) -> Result<()>;
}

/// Archives test and coverage artifacts
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn publish(&self, kind: ArtifactKind, path: &Path) -> Result<()>;
}

/// Status reporter that only logs
#[derive(Debug, Clone, Default)]
pub struct LogReporter;

#[async_trait]
impl StatusReporter for LogReporter {
    async fn report(&self, state: StatusState, context: &str, description: &str) -> Result<()> {
        info!("[{}] {}: {}", context, state, description);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct CommitStatus<'a> {
    state: StatusState,
    context: &'a str,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_url: Option<&'a str>,
}

/// GitHub commit status API (`POST /repos/{repo}/statuses/{sha}`)
pub struct GitHubStatusReporter {
    client: reqwest::Client,
    url: String,
    token: String,
    target_url: Option<String>,
}

impl GitHubStatusReporter {
    pub fn new(api_url: &str, repository: &str, sha: &str, token: String) -> Result<Self> {
        if repository.split('/').count() != 2 {
            return Err(Error::InvalidConfig(format!(
                "GitHub repository '{}' is not of the form owner/repo",
                repository
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(format!("testenv/{}", testenv_common::VERSION))
            .build()?;
        Ok(Self {
            client,
            url: format!(
                "{}/repos/{}/statuses/{}",
                api_url.trim_end_matches('/'),
                repository,
                sha
            ),
            token,
            target_url: None,
        })
    }

    /// Link shown next to the status, typically the CI build page
    pub fn with_target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl StatusReporter for GitHubStatusReporter {
    async fn report(&self, state: StatusState, context: &str, description: &str) -> Result<()> {
        // GitHub rejects descriptions longer than 140 characters
        let description: String = description.chars().take(140).collect();
        let body = CommitStatus {
            state,
            context,
            description,
            target_url: self.target_url.as_deref(),
        };
        debug!("Posting {} status to {}", state, self.url);
        self.client
            .post(&self.url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Artifact publisher that only logs
#[derive(Debug, Clone, Default)]
pub struct LogPublisher;

#[async_trait]
impl ArtifactPublisher for LogPublisher {
    async fn publish(&self, kind: ArtifactKind, path: &Path) -> Result<()> {
        info!("Artifact ({}): {}", kind, path.display());
        Ok(())
    }
}

/// Copies artifacts into `<archive_dir>/<kind>/<name>`
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    archive_dir: PathBuf,
}

impl DirectoryPublisher {
    pub fn new(archive_dir: PathBuf) -> Self {
        Self { archive_dir }
    }
}

#[async_trait]
impl ArtifactPublisher for DirectoryPublisher {
    async fn publish(&self, kind: ArtifactKind, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .ok_or_else(|| Error::InvalidConfig(format!("artifact path {} has no name", path.display())))?;
        let dest = self.archive_dir.join(kind.to_string()).join(name);
        let src = path.to_path_buf();
        let copied = tokio::task::spawn_blocking(move || copy_tree(&src, &dest))
            .await
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        info!("Published {} ({} files) as {}", path.display(), copied, kind);
        Ok(())
    }
}

/// Copy a file or directory tree; returns the number of files copied.
fn copy_tree(src: &Path, dest: &Path) -> Result<usize> {
    if src.is_file() {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dest)?;
        return Ok(1);
    }

    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
