//! Test utilities for unit testing the resolver and reconciler.
//!
//! Fixture builders for the workload graph (ingress → service → pod →
//! replica set → deployment) and a recording sink for asserting on
//! reported failures.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crds::{PrometheusRule, PrometheusRuleSpec, Rule, RuleGroup};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, ReplicaSet};
use k8s_openapi::api::core::v1::{Pod, Service, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};

use crate::sink::AlertSink;

/// Builds a string map from pairs.
pub fn btree(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        uid: Some(format!("uid-{namespace}-{name}")),
        ..Default::default()
    }
}

/// Controller owner reference as the workload graph carries it.
pub fn controller_ref(api_version: &str, kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("uid-{name}"),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Pod with labels, optionally controlled by `(api_version, kind, name)`.
pub fn make_pod(
    namespace: &str,
    name: &str,
    labels: &[(&str, &str)],
    owner: Option<(&str, &str, &str)>,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            labels: Some(btree(labels)),
            owner_references: owner.map(|(av, kind, n)| vec![controller_ref(av, kind, n)]),
            ..meta(namespace, name)
        },
        ..Default::default()
    }
}

/// ReplicaSet, optionally controlled by a deployment.
pub fn make_replica_set(namespace: &str, name: &str, owner_deployment: Option<&str>) -> ReplicaSet {
    ReplicaSet {
        metadata: ObjectMeta {
            owner_references: owner_deployment
                .map(|d| vec![controller_ref("apps/v1", "Deployment", d)]),
            ..meta(namespace, name)
        },
        ..Default::default()
    }
}

/// Deployment with annotations and a match-labels selector.
pub fn make_deployment(
    namespace: &str,
    name: &str,
    annotations: &[(&str, &str)],
    selector: &[(&str, &str)],
) -> Deployment {
    Deployment {
        metadata: ObjectMeta { annotations: Some(btree(annotations)), ..meta(namespace, name) },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(btree(selector)),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service with annotations and a selector.
pub fn make_service(
    namespace: &str,
    name: &str,
    annotations: &[(&str, &str)],
    selector: &[(&str, &str)],
) -> Service {
    Service {
        metadata: ObjectMeta { annotations: Some(btree(annotations)), ..meta(namespace, name) },
        spec: Some(ServiceSpec { selector: Some(btree(selector)), ..Default::default() }),
        ..Default::default()
    }
}

fn service_backend(name: &str) -> IngressBackend {
    IngressBackend {
        service: Some(IngressServiceBackend { name: name.to_string(), port: None }),
        ..Default::default()
    }
}

/// Ingress with annotations, one HTTP path per entry in `rule_backends`,
/// and an optional default backend.
pub fn make_ingress(
    namespace: &str,
    name: &str,
    annotations: &[(&str, &str)],
    rule_backends: &[&str],
    default_backend: Option<&str>,
) -> Ingress {
    let rules: Vec<IngressRule> = rule_backends
        .iter()
        .map(|backend| IngressRule {
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    backend: service_backend(backend),
                    path: Some("/".to_string()),
                    path_type: "Prefix".to_string(),
                }],
            }),
            ..Default::default()
        })
        .collect();

    Ingress {
        metadata: ObjectMeta { annotations: Some(btree(annotations)), ..meta(namespace, name) },
        spec: Some(IngressSpec {
            default_backend: default_backend.map(service_backend),
            rules: (!rules.is_empty()).then_some(rules),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Existing derived rule owned by `owner_uid`, with a single-alert group.
pub fn make_rule(namespace: &str, name: &str, owner_uid: &str, expr: &str) -> PrometheusRule {
    let mut rule = PrometheusRule::new(
        name,
        PrometheusRuleSpec {
            groups: vec![RuleGroup {
                name: format!("{namespace}.{name}"),
                interval: None,
                rules: vec![Rule {
                    alert: Some("Alert".to_string()),
                    expr: expr.to_string(),
                    ..Default::default()
                }],
            }],
        },
    );
    rule.metadata.namespace = Some(namespace.to_string());
    rule.metadata.resource_version = Some("1".to_string());
    rule.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name: "workload".to_string(),
        uid: owner_uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);
    rule
}

/// Sink capturing reported failures for assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl RecordingSink {
    /// Snapshot of everything reported so far.
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

impl AlertSink for RecordingSink {
    fn report(&self, message: &str) {
        self.messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(message.to_string());
    }
}
