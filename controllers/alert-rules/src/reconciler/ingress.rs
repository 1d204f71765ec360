//! Ingress workload sync.

use kube::ResourceExt;
use rule_templates::RuleParams;
use tracing::{debug, warn};

use super::{Reconciler, WorkloadRef};
use crate::annotations;
use crate::error::ControllerError;

impl Reconciler {
    /// Syncs the derived rules for one ingress.
    pub async fn sync_ingress(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        let Some(ingress) = self.ingresses.get(namespace, name) else {
            // Deleted while queued; its rules are garbage-collected through
            // the owner reference.
            debug!("Ingress {namespace}/{name} no longer exists");
            return Ok(());
        };

        let Some(uid) = ingress.uid() else {
            warn!("Ingress {namespace}/{name} has no uid, skipping");
            return Ok(());
        };

        let workload = WorkloadRef {
            api_version: "networking.k8s.io/v1",
            kind: "Ingress",
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid,
        };

        let directives = annotations::directives(ingress.annotations());
        let ownership = if directives.is_empty() {
            Ok(Default::default())
        } else {
            self.resolver.resolve_ingress(&ingress)
        };

        let params = RuleParams {
            identifier: workload.identifier(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            ..RuleParams::default()
        };

        self.sync_directives(&workload, directives, ownership, params).await
    }
}
