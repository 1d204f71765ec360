//! Ownership attribution resolver.
//!
//! Derived rules carry owner/environment/criticality/sensitivity labels.
//! When a workload does not declare them directly, the resolver walks the
//! object graph (backing service, its pods, their replica sets, the owning
//! deployment) and attributes the deployment's governance annotations to
//! the rule. The walk is read-only over the caches, iterative, and
//! deduplicates at every hop; any ambiguity or missing intermediate fails
//! the resolution rather than guessing an owner.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use thiserror::Error;

use crate::annotations::governance;
use crate::watcher::Cache;

/// Reasons ownership resolution can fail. All of these are soft: the
/// reconciler skips the affected directives and preserves their rules.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// The ingress references no backend service at all
    #[error("ingress references no backend service")]
    NoBackend,

    /// The ingress routes reference more than one distinct backend service
    #[error("ingress references multiple backend services")]
    AmbiguousBackend,

    /// An intermediate object of the walk is missing from the cache
    #[error("{kind} {namespace}/{name} not found")]
    MissingObject {
        /// Kind of the missing object
        kind: &'static str,
        /// Namespace searched
        namespace: String,
        /// Name searched
        name: String,
    },

    /// A pod or replica set is controlled by something other than the
    /// expected ReplicaSet/Deployment chain
    #[error("owned by unexpected controller kind {0}")]
    UnexpectedOwnerKind(String),

    /// The walk converged on zero deployments
    #[error("no owning deployment found")]
    OwnerNotFound,

    /// The walk converged on more than one deployment
    #[error("workload resolves to {0} distinct deployments")]
    AmbiguousOwner(usize),
}

/// The four governance attributes attached to every derived rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnershipAttributes {
    /// Owning team
    pub owner: String,
    /// Deployment environment
    pub environment: String,
    /// Business criticality tier
    pub criticality: String,
    /// Data sensitivity classification
    pub sensitivity: String,
}

impl OwnershipAttributes {
    /// Reads the governance annotations, defaulting absent keys to empty.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        let read = |key: &str| annotations.get(key).cloned().unwrap_or_default();
        Self {
            owner: read(governance::OWNER),
            environment: read(governance::ENVIRONMENT),
            criticality: read(governance::CRITICALITY),
            sensitivity: read(governance::SENSITIVITY),
        }
    }

    /// Fast path: all four annotations present on the workload itself.
    pub fn direct(annotations: &BTreeMap<String, String>) -> Option<Self> {
        let all_present = [
            governance::OWNER,
            governance::ENVIRONMENT,
            governance::CRITICALITY,
            governance::SENSITIVITY,
        ]
        .iter()
        .all(|key| annotations.contains_key(*key));
        all_present.then(|| Self::from_annotations(annotations))
    }
}

/// Resolves ownership attributes by walking the workload graph over the
/// read-through caches.
#[derive(Debug, Clone)]
pub struct OwnerResolver {
    services: Cache<Service>,
    pods: Cache<Pod>,
    replica_sets: Cache<ReplicaSet>,
    deployments: Cache<Deployment>,
}

impl OwnerResolver {
    /// Creates a resolver over the shared caches.
    pub fn new(
        services: Cache<Service>,
        pods: Cache<Pod>,
        replica_sets: Cache<ReplicaSet>,
        deployments: Cache<Deployment>,
    ) -> Self {
        Self { services, pods, replica_sets, deployments }
    }

    /// Resolves ownership for an ingress via its single backend service.
    pub fn resolve_ingress(&self, ingress: &Ingress) -> Result<OwnershipAttributes, ResolveError> {
        if let Some(attrs) = OwnershipAttributes::direct(ingress.annotations()) {
            return Ok(attrs);
        }

        let namespace = ingress.namespace().unwrap_or_default();
        let backend = backend_service(ingress)?;
        let service =
            self.services.get(&namespace, &backend).ok_or_else(|| ResolveError::MissingObject {
                kind: "Service",
                namespace: namespace.clone(),
                name: backend,
            })?;
        let selector =
            service.spec.as_ref().and_then(|s| s.selector.clone()).unwrap_or_default();
        self.resolve_selector(&namespace, &selector)
    }

    /// Resolves ownership for a service via its own selector.
    pub fn resolve_service(&self, service: &Service) -> Result<OwnershipAttributes, ResolveError> {
        if let Some(attrs) = OwnershipAttributes::direct(service.annotations()) {
            return Ok(attrs);
        }

        let namespace = service.namespace().unwrap_or_default();
        let selector =
            service.spec.as_ref().and_then(|s| s.selector.clone()).unwrap_or_default();
        self.resolve_selector(&namespace, &selector)
    }

    /// Resolves ownership for a deployment via its own selector.
    pub fn resolve_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<OwnershipAttributes, ResolveError> {
        if let Some(attrs) = OwnershipAttributes::direct(deployment.annotations()) {
            return Ok(attrs);
        }

        let namespace = deployment.namespace().unwrap_or_default();
        let selector = deployment
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default();
        self.resolve_selector(&namespace, &selector)
    }

    /// The shared walk: pods matching `selector` → their controlling replica
    /// sets → the single owning deployment.
    fn resolve_selector(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<OwnershipAttributes, ResolveError> {
        if selector.is_empty() {
            return Err(ResolveError::OwnerNotFound);
        }

        // Hop 1: distinct pod controllers, deduplicated by (apiVersion, kind, name).
        let mut pod_controllers: BTreeSet<(String, String, String)> = BTreeSet::new();
        for pod in self.pods.list() {
            if pod.namespace().as_deref() != Some(namespace) {
                continue;
            }
            if !selector_matches(selector, pod.labels()) {
                continue;
            }
            for owner in pod.owner_references() {
                if owner.controller == Some(true) {
                    pod_controllers.insert((
                        owner.api_version.clone(),
                        owner.kind.clone(),
                        owner.name.clone(),
                    ));
                }
            }
        }

        // Hop 2: each replica set's controlling deployment, deduplicated again.
        let mut deployment_owners: BTreeSet<(String, String, String)> = BTreeSet::new();
        for (_, kind, name) in &pod_controllers {
            if kind != "ReplicaSet" {
                return Err(ResolveError::UnexpectedOwnerKind(kind.clone()));
            }
            let replica_set = self.replica_sets.get(namespace, name).ok_or_else(|| {
                ResolveError::MissingObject {
                    kind: "ReplicaSet",
                    namespace: namespace.to_string(),
                    name: name.clone(),
                }
            })?;
            for owner in replica_set.owner_references() {
                if owner.controller == Some(true) {
                    deployment_owners.insert((
                        owner.api_version.clone(),
                        owner.kind.clone(),
                        owner.name.clone(),
                    ));
                }
            }
        }

        match deployment_owners.len() {
            0 => Err(ResolveError::OwnerNotFound),
            1 => {
                let Some((_, kind, name)) = deployment_owners.into_iter().next() else {
                    return Err(ResolveError::OwnerNotFound);
                };
                if kind != "Deployment" {
                    return Err(ResolveError::UnexpectedOwnerKind(kind));
                }
                let deployment = self.deployments.get(namespace, &name).ok_or_else(|| {
                    ResolveError::MissingObject {
                        kind: "Deployment",
                        namespace: namespace.to_string(),
                        name,
                    }
                })?;
                Ok(OwnershipAttributes::from_annotations(deployment.annotations()))
            }
            n => Err(ResolveError::AmbiguousOwner(n)),
        }
    }
}

/// The single service referenced by all of the ingress's routing rules and
/// its default backend. Empty → `NoBackend`; not unanimous → `AmbiguousBackend`.
fn backend_service(ingress: &Ingress) -> Result<String, ResolveError> {
    let mut names: BTreeSet<String> = BTreeSet::new();

    if let Some(spec) = &ingress.spec {
        if let Some(service) = spec.default_backend.as_ref().and_then(|b| b.service.as_ref()) {
            names.insert(service.name.clone());
        }
        for rule in spec.rules.as_deref().unwrap_or_default() {
            let paths = rule.http.as_ref().map(|h| h.paths.as_slice()).unwrap_or_default();
            for path in paths {
                if let Some(service) = path.backend.service.as_ref() {
                    names.insert(service.name.clone());
                }
            }
        }
    }

    if names.len() > 1 {
        return Err(ResolveError::AmbiguousBackend);
    }
    names.pop_first().ok_or(ResolveError::NoBackend)
}

fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(key, value)| labels.get(key) == Some(value))
}
