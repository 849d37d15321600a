//! testenv Common Library
//!
//! Shared types, error taxonomy and configuration for the testenv
//! end-to-end environment controller.

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{ControllerConfig, HostContext, IsolationConfig};
pub use error::{Error, FaultKind, Result};
pub use types::*;

/// testenv version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "testenv.toml";

/// Name of the run summary written to the output directory
pub const RUN_REPORT_FILE: &str = "run-report.json";
