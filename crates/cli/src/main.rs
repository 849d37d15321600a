//! testenv CLI - Main Entry Point
//!
//! Drives ephemeral end-to-end test environments from CI: full runs,
//! reconciliation, teardown and port checks.
//!
//! Exit codes: 0 tests passed, 1 tests failed, 2 infrastructure or
//! configuration fault.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{config, env, run};
use testenv_common::{ControllerConfig, HostContext, DEFAULT_CONFIG_FILE};

/// testenv - isolated end-to-end test environments for CI
#[derive(Parser)]
#[command(name = "testenv")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// CI build number; scopes every resource name
    #[arg(long, env = "BUILD_NUMBER", global = true)]
    build_id: Option<String>,

    /// Commit to report status against
    #[arg(long, env = "GIT_COMMIT", global = true)]
    commit: Option<String>,

    /// Token for commit status reporting
    #[arg(long, env = "GITHUB_TOKEN", global = true, hide_env_values = true)]
    github_token: Option<String>,

    /// Branch being built
    #[arg(long, env = "BRANCH_NAME", global = true)]
    branch: Option<String>,

    /// CI build page, linked from commit statuses
    #[arg(long, env = "BUILD_URL", global = true)]
    build_url: Option<String>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full lifecycle: reconcile, bring up, test, tear down
    Run(run::RunArgs),

    /// Remove stale resources and clear reserved ports
    Reconcile,

    /// Tear down everything belonging to this build
    Teardown,

    /// Show whether each reserved port is free
    CheckPorts,

    /// Inspect or create configuration
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

impl Cli {
    fn host(&self) -> Result<HostContext> {
        let build_id = self
            .build_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .context("a build id is required (--build-id or BUILD_NUMBER)")?;
        Ok(HostContext {
            build_id,
            commit_sha: self.commit.clone(),
            github_token: self.github_token.clone(),
            branch: self.branch.clone(),
            build_url: self.build_url.clone(),
        })
    }

    fn load_config(&self) -> Result<ControllerConfig> {
        let config = ControllerConfig::load(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        Ok(config)
    }
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match &cli.command {
        Commands::Run(args) => run::execute(cli.load_config()?, cli.host()?, args, cli.format).await,
        Commands::Reconcile => env::reconcile(cli.load_config()?, cli.host()?).await,
        Commands::Teardown => env::teardown(cli.load_config()?, cli.host()?).await,
        Commands::CheckPorts => env::check_ports(&cli.load_config()?, cli.format).await,
        Commands::Config(cmd) => config::execute(cmd, &cli.config, cli.format),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            output::print_failure(&format!("{:#}", e));
            2
        }
    };
    std::process::exit(code);
}
