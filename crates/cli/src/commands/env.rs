//! Environment maintenance commands: reconcile, teardown, check-ports

use anyhow::Result;
use serde::Serialize;

use crate::output::{print_list, print_success, print_warning, OutputFormat, TableDisplay};
use testenv_common::{ControllerConfig, HostContext};
use testenv_controller::{Controller, HostPorts, PortInspector};

pub async fn reconcile(config: ControllerConfig, host: HostContext) -> Result<i32> {
    let controller = Controller::from_config(config, host).await?;
    controller.reconcile().await?;
    print_success(&format!("Environment {} is clean", controller.identity()));
    Ok(0)
}

pub async fn teardown(config: ControllerConfig, host: HostContext) -> Result<i32> {
    let controller = Controller::from_config(config, host).await?;
    let warnings = controller.teardown(None).await;
    for warning in &warnings {
        print_warning(warning);
    }
    print_success(&format!("Environment {} torn down", controller.identity()));
    Ok(0)
}

/// Reserved port state
#[derive(Debug, Serialize)]
pub struct PortStatus {
    pub port: u16,
    pub free: bool,
}

impl TableDisplay for PortStatus {
    fn headers() -> Vec<&'static str> {
        vec!["Port", "State"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.port.to_string(),
            if self.free { "free" } else { "busy" }.to_string(),
        ]
    }
}

pub async fn port_statuses(config: &ControllerConfig, inspector: &dyn PortInspector) -> Vec<PortStatus> {
    let mut statuses = Vec::new();
    for port in config.ports.reserved.ports() {
        statuses.push(PortStatus {
            port,
            free: inspector.is_free(port).await,
        });
    }
    statuses
}

pub async fn check_ports(config: &ControllerConfig, format: OutputFormat) -> Result<i32> {
    let statuses = port_statuses(config, &HostPorts::new()).await;
    print_list(&statuses, format);
    if statuses.iter().all(|s| s.free) {
        Ok(0)
    } else {
        Ok(2)
    }
}
