//! Run Command

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::output::{print_failure, print_item, print_success, print_warning, OutputFormat, TableDisplay};
use testenv_common::{ControllerConfig, HostContext, RunOutcome, RunReport};
use testenv_controller::Controller;

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Cancel the run (and tear down) after this many seconds
    #[arg(long)]
    pub deadline_secs: Option<u64>,
}

/// Run summary row
#[derive(Serialize)]
#[serde(transparent)]
pub struct RunDisplay<'a> {
    report: &'a RunReport,
}

impl TableDisplay for RunDisplay<'_> {
    fn headers() -> Vec<&'static str> {
        vec!["Identity", "Outcome", "Tests", "Failures", "Exit Code", "Artifacts", "Duration"]
    }

    fn row(&self) -> Vec<String> {
        let r = self.report;
        let (tests, failures) = match &r.structured_result {
            Some(s) => (s.tests.to_string(), (s.failures + s.errors).to_string()),
            None => ("-".to_string(), "-".to_string()),
        };
        vec![
            r.identity.clone(),
            r.outcome.to_string(),
            tests,
            failures,
            r.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            r.artifacts.len().to_string(),
            format!("{:.1}s", r.duration_ms as f64 / 1000.0),
        ]
    }
}

/// Cancel `token` on SIGINT or SIGTERM. The handlers are installed by the
/// time this returns, so neither signal kills the process before teardown.
pub fn cancel_on_signals(token: CancellationToken) -> std::io::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => warn!("Interrupt received, cancelling run"),
            _ = terminate.recv() => warn!("SIGTERM received, cancelling run"),
        }
        token.cancel();
    });
    Ok(())
}

pub async fn execute(
    config: ControllerConfig,
    host: HostContext,
    args: &RunArgs,
    format: OutputFormat,
) -> Result<i32> {
    let controller = Controller::from_config(config, host).await?;
    let cancel = CancellationToken::new();

    cancel_on_signals(cancel.clone())?;

    if let Some(secs) = args.deadline_secs {
        let on_deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!("Deadline of {}s reached, cancelling run", secs);
            on_deadline.cancel();
        });
    }

    let report = controller.run(cancel).await;
    print_item(&RunDisplay { report: &report }, format);

    for warning in &report.teardown_warnings {
        print_warning(warning);
    }
    match &report.outcome {
        RunOutcome::Passed => print_success(&report.outcome.describe()),
        RunOutcome::Failed { .. } => print_failure(&report.outcome.describe()),
        RunOutcome::Fault { message, .. } => {
            print_failure(&format!("{}: {}", report.outcome.describe(), message))
        }
    }

    Ok(report.outcome.exit_code())
}
