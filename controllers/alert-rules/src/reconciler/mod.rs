//! Reconciliation logic for annotation-derived alert rules.
//!
//! One sync entry point per workload kind:
//! - `ingress`: Ingress workloads
//! - `deployment`: Deployment workloads (adds selector labels and the
//!   namespace's Prometheus instance to the template parameters)
//! - `service`: Service workloads
//!
//! Every sync pass computes the desired rule set from the workload's
//! directives, fetches the existing set owned by the workload, and applies
//! the minimal create/update/delete diff.

pub mod deployment;
pub mod ingress;
pub mod service;

#[cfg(test)]
mod sync_test;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crds::PrometheusRule;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use rule_templates::{RuleParams, TemplateRegistry};
use tracing::{debug, info, warn};

use crate::annotations::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::error::ControllerError;
use crate::owner::{OwnerResolver, OwnershipAttributes, ResolveError};
use crate::sink::AlertSink;
use crate::watcher::Cache;

/// Workload kinds the controller reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    /// `networking.k8s.io/v1` Ingress
    Ingress,
    /// `apps/v1` Deployment
    Deployment,
    /// core `v1` Service
    Service,
}

impl WorkloadKind {
    /// Kind name as it appears in owner references.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Ingress => "Ingress",
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::Service => "Service",
        }
    }
}

/// Identity of the workload a sync pass is running for; becomes the owner
/// reference on every rule it produces.
#[derive(Debug, Clone)]
pub(crate) struct WorkloadRef {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl WorkloadRef {
    pub fn identifier(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    pub fn controller_owner_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.to_string(),
            kind: self.kind.to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

/// Minimal set of writes needed to converge one workload's rules.
#[derive(Debug, Default)]
pub(crate) struct SyncPlan {
    pub create: Vec<PrometheusRule>,
    pub update: Vec<PrometheusRule>,
    pub delete: Vec<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Deterministic derived-rule name for a (workload, template) pair.
pub(crate) fn rule_name(template: &str, namespace: &str, name: &str) -> String {
    format!("{template}-{namespace}-{name}")
}

/// Renders one directive into a fully-attributed rule: deterministic name,
/// workload namespace, ownership and managed-by labels, owner reference.
/// The name the template document carries is overridden so the mapping
/// (workload, template) → rule name stays total and deterministic.
pub(crate) fn render_rule(
    templates: &TemplateRegistry,
    template: &str,
    params: &RuleParams,
    workload: &WorkloadRef,
    attrs: &OwnershipAttributes,
) -> Result<PrometheusRule, rule_templates::TemplateError> {
    let document = templates.render(template, params)?;
    let mut rule = rule_templates::parse_rule(&document)?;

    rule.metadata.name = Some(rule_name(template, &workload.namespace, &workload.name));
    rule.metadata.namespace = Some(workload.namespace.clone());
    rule.metadata.owner_references = Some(vec![workload.controller_owner_ref()]);

    let labels = rule.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert("owner".to_string(), attrs.owner.clone());
    labels.insert("environment".to_string(), attrs.environment.clone());
    labels.insert("criticality".to_string(), attrs.criticality.clone());
    labels.insert("sensitivity".to_string(), attrs.sensitivity.clone());

    Ok(rule)
}

/// Whether the desired rule's content differs from the existing resource.
/// Compares everything the controller owns: spec, labels, annotations, and
/// the owner reference.
fn rule_content_differs(desired: &PrometheusRule, existing: &PrometheusRule) -> bool {
    desired.spec != existing.spec
        || desired.metadata.labels != existing.metadata.labels
        || desired.metadata.annotations != existing.metadata.annotations
        || desired.metadata.owner_references != existing.metadata.owner_references
}

/// Diffs desired against existing rules by name.
///
/// Names in `preserve` belong to directives that failed soft this pass;
/// their existing rules are neither updated nor deleted. Updates carry the
/// existing resource's version token so conflicting concurrent writes are
/// rejected by the API server rather than silently overwritten.
pub(crate) fn plan(
    desired: BTreeMap<String, PrometheusRule>,
    existing: &[Arc<PrometheusRule>],
    preserve: &BTreeSet<String>,
) -> SyncPlan {
    let existing_by_name: BTreeMap<String, &Arc<PrometheusRule>> = existing
        .iter()
        .filter_map(|rule| rule.metadata.name.clone().map(|name| (name, rule)))
        .collect();

    let desired_names: BTreeSet<String> = desired.keys().cloned().collect();
    let mut sync_plan = SyncPlan::default();

    for (name, rule) in desired {
        match existing_by_name.get(&name) {
            None => sync_plan.create.push(rule),
            Some(current) => {
                if rule_content_differs(&rule, current) {
                    let mut updated = rule;
                    updated.metadata.resource_version = current.metadata.resource_version.clone();
                    sync_plan.update.push(updated);
                }
            }
        }
    }

    for name in existing_by_name.keys() {
        if !desired_names.contains(name) && !preserve.contains(name) {
            sync_plan.delete.push(name.clone());
        }
    }

    sync_plan
}

/// Reconciles workloads into their derived PrometheusRule sets.
pub struct Reconciler {
    pub(crate) client: Client,
    pub(crate) templates: TemplateRegistry,
    pub(crate) resolver: OwnerResolver,
    pub(crate) ingresses: Cache<Ingress>,
    pub(crate) deployments: Cache<Deployment>,
    pub(crate) services: Cache<Service>,
    pub(crate) rules: Cache<PrometheusRule>,
    pub(crate) sink: Arc<dyn AlertSink>,
}

impl Reconciler {
    /// Creates a reconciler over the shared caches.
    #[allow(clippy::too_many_arguments)] // Constructor wires the shared caches
    pub fn new(
        client: Client,
        templates: TemplateRegistry,
        resolver: OwnerResolver,
        ingresses: Cache<Ingress>,
        deployments: Cache<Deployment>,
        services: Cache<Service>,
        rules: Cache<PrometheusRule>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self { client, templates, resolver, ingresses, deployments, services, rules, sink }
    }

    /// Dispatches one queue key to the matching workload sync.
    pub async fn sync(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        match kind {
            WorkloadKind::Ingress => self.sync_ingress(namespace, name).await,
            WorkloadKind::Deployment => self.sync_deployment(namespace, name).await,
            WorkloadKind::Service => self.sync_service(namespace, name).await,
        }
    }

    /// Existing rules owned by the workload with `uid`, from the rule cache.
    pub(crate) fn rules_owned_by(&self, uid: &str) -> Vec<Arc<PrometheusRule>> {
        self.rules
            .list()
            .into_iter()
            .filter(|rule| rule.owner_references().iter().any(|owner| owner.uid == uid))
            .collect()
    }

    /// Shared sync core: expands directives into the desired set, diffs
    /// against the existing set, applies the plan.
    ///
    /// A directive that fails soft (unresolved owner, missing template,
    /// render or parse error) is reported, and its deterministic rule name
    /// is preserved so the diff never deletes a rule because this pass
    /// could not recompute it.
    pub(crate) async fn sync_directives(
        &self,
        workload: &WorkloadRef,
        directives: Vec<(String, String)>,
        ownership: Result<OwnershipAttributes, ResolveError>,
        base_params: RuleParams,
    ) -> Result<(), ControllerError> {
        let mut desired: BTreeMap<String, PrometheusRule> = BTreeMap::new();
        let mut preserve: BTreeSet<String> = BTreeSet::new();

        let attrs = match ownership {
            Ok(attrs) => Some(attrs),
            Err(e) => {
                let message = format!(
                    "[{}][{}] error resolving owner: {e}",
                    workload.kind.to_lowercase(),
                    workload.identifier()
                );
                warn!("{message}");
                self.sink.report(&message);
                None
            }
        };

        for (template, threshold) in directives {
            let name = rule_name(&template, &workload.namespace, &workload.name);

            let Some(attrs) = attrs.as_ref() else {
                preserve.insert(name);
                continue;
            };

            let mut params = base_params.clone();
            params.threshold = threshold;
            params.owner = attrs.owner.clone();
            params.environment = attrs.environment.clone();
            params.criticality = attrs.criticality.clone();
            params.sensitivity = attrs.sensitivity.clone();

            match render_rule(&self.templates, &template, &params, workload, attrs) {
                Ok(rule) => {
                    desired.insert(name, rule);
                }
                Err(e) => {
                    let message = format!(
                        "[{}][{}] error expanding template \"{template}\": {e}",
                        workload.kind.to_lowercase(),
                        workload.identifier()
                    );
                    warn!("{message}");
                    self.sink.report(&message);
                    preserve.insert(name);
                }
            }
        }

        let existing = self.rules_owned_by(&workload.uid);
        let sync_plan = plan(desired, &existing, &preserve);
        self.apply(&workload.namespace, sync_plan).await
    }

    /// Applies a plan in create/update/delete order. The first API failure
    /// aborts the pass; the queue retries and the next pass re-diffs from
    /// current state.
    async fn apply(&self, namespace: &str, sync_plan: SyncPlan) -> Result<(), ControllerError> {
        if sync_plan.is_empty() {
            debug!("rules for namespace {namespace} already converged");
            return Ok(());
        }

        let api: Api<PrometheusRule> = Api::namespaced(self.client.clone(), namespace);
        let pp = PostParams::default();

        for rule in &sync_plan.create {
            api.create(&pp, rule).await?;
            info!("created PrometheusRule {namespace}/{}", rule.name_any());
        }
        for rule in &sync_plan.update {
            let name = rule.name_any();
            api.replace(&name, &pp, rule).await?;
            info!("updated PrometheusRule {namespace}/{name}");
        }
        for name in &sync_plan.delete {
            api.delete(name, &DeleteParams::default()).await?;
            info!("deleted PrometheusRule {namespace}/{name}");
        }

        Ok(())
    }
}
