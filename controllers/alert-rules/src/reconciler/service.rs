//! Service workload sync.

use kube::ResourceExt;
use rule_templates::RuleParams;
use tracing::{debug, warn};

use super::deployment::generated_labels;
use super::{Reconciler, WorkloadRef};
use crate::annotations;
use crate::error::ControllerError;

impl Reconciler {
    /// Syncs the derived rules for one service.
    pub async fn sync_service(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        let Some(service) = self.services.get(namespace, name) else {
            debug!("Service {namespace}/{name} no longer exists");
            return Ok(());
        };

        let Some(uid) = service.uid() else {
            warn!("Service {namespace}/{name} has no uid, skipping");
            return Ok(());
        };

        let workload = WorkloadRef {
            api_version: "v1",
            kind: "Service",
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid,
        };

        let directives = annotations::directives(service.annotations());
        let ownership = if directives.is_empty() {
            Ok(Default::default())
        } else {
            self.resolver.resolve_service(&service)
        };

        let selector = service
            .spec
            .as_ref()
            .and_then(|s| s.selector.clone())
            .unwrap_or_default();

        let params = RuleParams {
            identifier: workload.identifier(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            generated_labels: generated_labels(&selector),
            ..RuleParams::default()
        };

        self.sync_directives(&workload, directives, ownership, params).await
    }
}
