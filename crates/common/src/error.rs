//! Error types for testenv

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the testenv Error
pub type Result<T> = std::result::Result<T, Error>;

/// testenv error types
///
/// Every variant except the plumbing ones (`Io`, `Serialization`, ...) is
/// fatal for a run: it aborts bring-up or execution and the controller moves
/// straight to teardown. A failing test suite is *not* an error; it is a
/// [`crate::types::RunOutcome::Failed`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("Environment is dirty: reserved ports still in use after cleanup: {ports:?}")]
    EnvironmentDirty { ports: Vec<u16> },

    #[error("Service '{service}' not ready after {attempts} attempts")]
    EnvironmentNotReady {
        service: String,
        attempts: u32,
        logs: String,
    },

    #[error("Execution fault: {0}")]
    ExecutionFault(String),

    #[error("Timed out after {seconds}s waiting for lock on '{resource}'")]
    LockTimeout { resource: String, seconds: u64 },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Command '{command}' timed out after {seconds}s")]
    CommandTimeout { command: String, seconds: u64 },

    #[error("Container engine error: {0}")]
    Engine(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML write error: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Coarse classification of a fatal error, used in run reports and
/// status descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    EnvironmentDirty,
    EnvironmentNotReady,
    ExecutionFault,
    LockTimeout,
    Cancelled,
    Configuration,
    Internal,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::EnvironmentDirty => write!(f, "environment dirty"),
            FaultKind::EnvironmentNotReady => write!(f, "environment not ready"),
            FaultKind::ExecutionFault => write!(f, "execution fault"),
            FaultKind::LockTimeout => write!(f, "lock timeout"),
            FaultKind::Cancelled => write!(f, "cancelled"),
            FaultKind::Configuration => write!(f, "configuration"),
            FaultKind::Internal => write!(f, "internal"),
        }
    }
}

impl Error {
    /// Classify this error for reporting.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            Error::EnvironmentDirty { .. } => FaultKind::EnvironmentDirty,
            Error::EnvironmentNotReady { .. } => FaultKind::EnvironmentNotReady,
            Error::ExecutionFault(_) | Error::CommandTimeout { .. } => FaultKind::ExecutionFault,
            Error::LockTimeout { .. } => FaultKind::LockTimeout,
            Error::Cancelled => FaultKind::Cancelled,
            Error::InvalidConfig(_) | Error::Toml(_) | Error::TomlWrite(_) => {
                FaultKind::Configuration
            }
            Error::Engine(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Http(_) => FaultKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_kind_classification() {
        let dirty = Error::EnvironmentDirty { ports: vec![5432] };
        assert_eq!(dirty.fault_kind(), FaultKind::EnvironmentDirty);

        let timeout = Error::CommandTimeout {
            command: "docker exec".into(),
            seconds: 10,
        };
        assert_eq!(timeout.fault_kind(), FaultKind::ExecutionFault);

        let config = Error::InvalidConfig("bad".into());
        assert_eq!(config.fault_kind(), FaultKind::Configuration);
    }

    #[test]
    fn test_not_ready_message_names_service() {
        let err = Error::EnvironmentNotReady {
            service: "database".into(),
            attempts: 30,
            logs: String::new(),
        };
        assert_eq!(err.to_string(), "Service 'database' not ready after 30 attempts");
    }
}
