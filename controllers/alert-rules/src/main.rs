//! Alert Rules Controller
//!
//! Derives PrometheusRule resources from annotations on Ingress, Deployment,
//! and Service workloads and keeps them continuously synchronized:
//! - directives (`alertops.microscaler.io/<template>: "<threshold>"`) select
//!   a rule template and its parameter;
//! - ownership metadata is read from the workload or resolved through its
//!   backing service, pods, and replica sets to the owning deployment;
//! - exactly one rule exists per (workload, template) pair, created, updated
//!   and deleted by a diff-based sync pass.

mod annotations;
mod backoff;
mod controller;
mod error;
mod legacy;
mod owner;
mod queue;
mod reconciler;
mod sink;
mod watcher;

#[cfg(test)]
mod test_utils;

use std::env;
use std::path::Path;
use std::time::Duration;

use kube::Client;
use rule_templates::TemplateRegistry;
use tracing::info;

use crate::controller::{Controller, OutputMode, Settings};
use crate::error::ControllerError;

fn settings_from_env() -> Result<Settings, ControllerError> {
    let namespace = env::var("WATCH_NAMESPACE").ok();

    let output = match env::var("RULES_OUTPUT").as_deref() {
        Err(_) | Ok("prometheusrules") => OutputMode::PrometheusRules,
        Ok("configmap") => {
            let target = env::var("RULES_CONFIGMAP").map_err(|_| {
                ControllerError::InvalidConfig(
                    "RULES_CONFIGMAP is required when RULES_OUTPUT=configmap".to_string(),
                )
            })?;
            let Some((namespace, name)) = target.split_once('/') else {
                return Err(ControllerError::InvalidConfig(format!(
                    "RULES_CONFIGMAP must be namespace/name, got \"{target}\""
                )));
            };
            OutputMode::ConfigMap { namespace: namespace.to_string(), name: name.to_string() }
        }
        Ok(other) => {
            return Err(ControllerError::InvalidConfig(format!(
                "unknown RULES_OUTPUT \"{other}\", expected prometheusrules or configmap"
            )));
        }
    };

    let cache_sync_timeout = match env::var("CACHE_SYNC_TIMEOUT_SECS") {
        Ok(raw) => Duration::from_secs(raw.parse().map_err(|_| {
            ControllerError::InvalidConfig(format!("CACHE_SYNC_TIMEOUT_SECS must be seconds, got \"{raw}\""))
        })?),
        Err(_) => Duration::from_secs(120),
    };

    let workers_per_kind = match env::var("WORKERS_PER_KIND") {
        Ok(raw) => raw.parse().map_err(|_| {
            ControllerError::InvalidConfig(format!("WORKERS_PER_KIND must be a count, got \"{raw}\""))
        })?,
        Err(_) => 2,
    };

    Ok(Settings { namespace, output, cache_sync_timeout, workers_per_kind })
}

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting alert rules controller");

    let templates_dir = env::var("TEMPLATES_DIR").unwrap_or_else(|_| "templates".to_string());
    let settings = settings_from_env()?;

    // Zero templates is fatal: nothing this controller could ever produce.
    let templates = TemplateRegistry::load(Path::new(&templates_dir))?;
    info!("Loaded templates: {:?}", templates.names());
    info!("Configuration:");
    info!("  Namespace: {}", settings.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Output: {:?}", settings.output);

    let client = Client::try_default().await?;

    let controller = Controller::new(client, templates, settings)?;
    controller.run().await?;

    Ok(())
}
