//! Legacy ConfigMap output mode.
//!
//! Instead of typed PrometheusRule resources, rendered rule bodies are
//! written as keyed entries into one shared ConfigMap, fully overwriting
//! its contents each pass. There is no per-key diff in this mode: the
//! whole document is recomputed from the caches on every queue event.
//! Mutually exclusive with the CRD output mode.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use rule_templates::{RuleParams, TemplateRegistry};
use tracing::{info, warn};

use crate::annotations;
use crate::error::ControllerError;
use crate::owner::OwnershipAttributes;
use crate::reconciler::deployment::generated_labels;
use crate::sink::AlertSink;
use crate::watcher::Cache;

/// Rewrites the shared rules ConfigMap from the current cache state.
pub struct LegacySync {
    client: Client,
    templates: TemplateRegistry,
    ingresses: Cache<Ingress>,
    deployments: Cache<Deployment>,
    services: Cache<Service>,
    config_namespace: String,
    config_name: String,
    sink: Arc<dyn AlertSink>,
}

/// ConfigMap key for one (template, workload) rule; must stay filename-safe.
pub(crate) fn rule_key(template: &str, namespace: &str, name: &str) -> String {
    format!("{template}_{namespace}-{name}.rules")
}

impl LegacySync {
    /// Creates the legacy syncer targeting `config_namespace/config_name`.
    #[allow(clippy::too_many_arguments)] // Constructor wires the shared caches
    pub fn new(
        client: Client,
        templates: TemplateRegistry,
        ingresses: Cache<Ingress>,
        deployments: Cache<Deployment>,
        services: Cache<Service>,
        config_namespace: String,
        config_name: String,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            client,
            templates,
            ingresses,
            deployments,
            services,
            config_namespace,
            config_name,
            sink,
        }
    }

    /// Re-renders every directive from every cached workload and replaces
    /// the ConfigMap's data wholesale, keeping it in step with current state.
    pub async fn sync_all(&self) -> Result<(), ControllerError> {
        let mut data: BTreeMap<String, String> = BTreeMap::new();

        for ingress in self.ingresses.list() {
            let params = self.base_params(ingress.as_ref(), String::new());
            self.collect(&mut data, "ingress", ingress.annotations(), params);
        }
        for deployment in self.deployments.list() {
            let selector = deployment
                .spec
                .as_ref()
                .and_then(|s| s.selector.match_labels.clone())
                .unwrap_or_default();
            let params = self.base_params(deployment.as_ref(), generated_labels(&selector));
            self.collect(&mut data, "deployment", deployment.annotations(), params);
        }
        for service in self.services.list() {
            let selector =
                service.spec.as_ref().and_then(|s| s.selector.clone()).unwrap_or_default();
            let params = self.base_params(service.as_ref(), generated_labels(&selector));
            self.collect(&mut data, "service", service.annotations(), params);
        }

        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.config_namespace);
        let mut config_map = api.get(&self.config_name).await?;
        // Cleared each pass so removed directives disappear with it.
        config_map.data = Some(data);
        config_map.metadata.managed_fields = None;
        api.replace(&self.config_name, &PostParams::default(), &config_map).await?;

        info!("updated rules configmap {}/{}", self.config_namespace, self.config_name);
        Ok(())
    }

    fn base_params<K: kube::Resource>(&self, workload: &K, generated_labels: String) -> RuleParams {
        let namespace = workload.namespace().unwrap_or_default();
        let name = workload.name_any();
        let attrs = OwnershipAttributes::from_annotations(workload.annotations());
        RuleParams {
            identifier: format!("{namespace}.{name}"),
            namespace,
            name,
            generated_labels,
            owner: attrs.owner,
            environment: attrs.environment,
            criticality: attrs.criticality,
            sensitivity: attrs.sensitivity,
            ..RuleParams::default()
        }
    }

    fn collect(
        &self,
        data: &mut BTreeMap<String, String>,
        kind: &str,
        workload_annotations: &BTreeMap<String, String>,
        base_params: RuleParams,
    ) {
        for (template, threshold) in annotations::directives(workload_annotations) {
            let mut params = base_params.clone();
            params.threshold = threshold;
            match self.templates.render(&template, &params) {
                Ok(document) => {
                    data.insert(
                        rule_key(&template, &base_params.namespace, &base_params.name),
                        document,
                    );
                }
                Err(e) => {
                    let message = format!(
                        "[{kind}][{}] error expanding template \"{template}\": {e}",
                        base_params.identifier
                    );
                    warn!("{message}");
                    self.sink.report(&message);
                }
            }
        }
    }
}
