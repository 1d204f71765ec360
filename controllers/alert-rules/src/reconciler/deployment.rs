//! Deployment workload sync.
//!
//! Deployments additionally expose their selector to templates as PromQL
//! label matchers (`generated_labels`) and the Prometheus instance recorded
//! on their namespace (`prometheus`).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, ResourceExt};
use rule_templates::RuleParams;
use tracing::{debug, warn};

use super::{Reconciler, WorkloadRef};
use crate::annotations;
use crate::error::ControllerError;

/// Renders a selector map as `,key="value"` pairs for splicing into PromQL
/// matchers. BTreeMap iteration keeps the output deterministic.
pub(crate) fn generated_labels(selector: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in selector {
        out.push_str(&format!(",{key}=\"{value}\""));
    }
    out
}

impl Reconciler {
    /// Syncs the derived rules for one deployment.
    pub async fn sync_deployment(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        let Some(deployment) = self.deployments.get(namespace, name) else {
            debug!("Deployment {namespace}/{name} no longer exists");
            return Ok(());
        };

        let Some(uid) = deployment.uid() else {
            warn!("Deployment {namespace}/{name} has no uid, skipping");
            return Ok(());
        };

        let workload = WorkloadRef {
            api_version: "apps/v1",
            kind: "Deployment",
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid,
        };

        let directives = annotations::directives(deployment.annotations());
        let (ownership, prometheus) = if directives.is_empty() {
            (Ok(Default::default()), String::new())
        } else {
            (
                self.resolver.resolve_deployment(&deployment),
                self.namespace_prometheus(namespace).await?,
            )
        };

        let selector = deployment
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default();

        let params = RuleParams {
            identifier: workload.identifier(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            generated_labels: generated_labels(&selector),
            prometheus,
            ..RuleParams::default()
        };

        self.sync_directives(&workload, directives, ownership, params).await
    }

    /// The Prometheus instance the namespace reports to, from its
    /// `prometheus` annotation. A missing namespace or annotation resolves
    /// to empty rather than failing the pass.
    async fn namespace_prometheus(&self, namespace: &str) -> Result<String, ControllerError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get_opt(namespace).await? {
            Some(ns) => Ok(ns
                .annotations()
                .get(annotations::NAMESPACE_PROMETHEUS)
                .cloned()
                .unwrap_or_default()),
            None => {
                warn!("namespace {namespace} not found while resolving its prometheus annotation");
                Ok(String::new())
            }
        }
    }
}
