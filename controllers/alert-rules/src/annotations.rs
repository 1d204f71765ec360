//! Annotation and label contract.
//!
//! Workloads opt into alerting by carrying directive annotations of the form
//! `alertops.microscaler.io/<template-name>: "<threshold>"`. Ownership
//! metadata lives under separate governance keys so it can never collide
//! with a template name.

use std::collections::BTreeMap;

/// Prefix for alert rule directive annotation keys.
pub const DIRECTIVE_PREFIX: &str = "alertops.microscaler.io";

/// Ownership annotation keys, read from a workload or its resolved deployment.
pub mod governance {
    /// Owning team
    pub const OWNER: &str = "governance.microscaler.io/owner";
    /// Deployment environment (e.g. "prod", "staging")
    pub const ENVIRONMENT: &str = "governance.microscaler.io/environment";
    /// Business criticality tier
    pub const CRITICALITY: &str = "governance.microscaler.io/criticality";
    /// Data sensitivity classification
    pub const SENSITIVITY: &str = "governance.microscaler.io/sensitivity";
}

/// Namespace annotation naming the Prometheus instance deployments report to.
pub const NAMESPACE_PROMETHEUS: &str = "prometheus";

/// Label key marking resources managed by this controller.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Label value marking resources managed by this controller.
pub const MANAGED_BY_VALUE: &str = "alertops";

/// Extracts `(template name, threshold)` directives from a workload's
/// annotations. Iteration over the `BTreeMap` keeps the result ordering
/// deterministic.
pub fn directives(annotations: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let prefix = format!("{DIRECTIVE_PREFIX}/");
    annotations
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(&prefix)
                .filter(|template| !template.is_empty())
                .map(|template| (template.to_string(), value.clone()))
        })
        .collect()
}
