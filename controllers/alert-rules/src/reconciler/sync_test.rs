//! Unit tests for the diff planner and rule expansion.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crds::PrometheusRule;
use rule_templates::{RuleParams, TemplateRegistry};

use super::deployment::generated_labels;
use super::{plan, render_rule, rule_name, WorkloadRef};
use crate::annotations::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::owner::OwnershipAttributes;
use crate::test_utils::{btree, make_rule};

const OWNER_UID: &str = "uid-1234";

const REPLICAS_TEMPLATE: &str = r#"apiVersion: monitoring.coreos.com/v1
kind: PrometheusRule
metadata:
  name: placeholder
spec:
  groups:
    - name: {{identifier}}
      rules:
        - alert: DeploymentReplicasAvailability
          expr: kube_deployment_status_replicas_available{namespace="{{namespace}}", deployment="{{name}}"} / kube_deployment_spec_replicas{namespace="{{namespace}}", deployment="{{name}}"} <= {{threshold}}
          for: 5m
"#;

fn workload(namespace: &str, name: &str) -> WorkloadRef {
    WorkloadRef {
        api_version: "apps/v1",
        kind: "Deployment",
        namespace: namespace.to_string(),
        name: name.to_string(),
        uid: OWNER_UID.to_string(),
    }
}

fn desired_from(rules: Vec<PrometheusRule>) -> BTreeMap<String, PrometheusRule> {
    rules
        .into_iter()
        .filter_map(|rule| rule.metadata.name.clone().map(|name| (name, rule)))
        .collect()
}

fn arc_rules(rules: Vec<PrometheusRule>) -> Vec<Arc<PrometheusRule>> {
    rules.into_iter().map(Arc::new).collect()
}

#[test]
fn empty_desired_and_existing_is_a_noop() {
    let sync_plan = plan(BTreeMap::new(), &[], &BTreeSet::new());
    assert!(sync_plan.is_empty());
}

#[test]
fn diff_creates_deletes_and_updates_minimally() {
    // Existing {A, B, C}; desired {B, C, D} where B is unchanged and C's
    // content differs. Exactly: create D, delete A, update C.
    let existing_b = make_rule("shop", "b", OWNER_UID, "up == 0");
    let existing = arc_rules(vec![
        make_rule("shop", "a", OWNER_UID, "up == 0"),
        existing_b.clone(),
        make_rule("shop", "c", OWNER_UID, "up == 0"),
    ]);

    let mut desired_b = existing_b;
    desired_b.metadata.resource_version = None; // fresh render carries no version
    let mut desired_c = make_rule("shop", "c", OWNER_UID, "rate(errors[5m]) > 1");
    desired_c.metadata.resource_version = None;
    let mut desired_d = make_rule("shop", "d", OWNER_UID, "up == 0");
    desired_d.metadata.resource_version = None;

    let sync_plan = plan(
        desired_from(vec![desired_b, desired_c, desired_d]),
        &existing,
        &BTreeSet::new(),
    );

    let created: Vec<_> = sync_plan.create.iter().map(|r| r.metadata.name.clone()).collect();
    let updated: Vec<_> = sync_plan.update.iter().map(|r| r.metadata.name.clone()).collect();
    assert_eq!(created, vec![Some("d".to_string())]);
    assert_eq!(updated, vec![Some("c".to_string())]);
    assert_eq!(sync_plan.delete, vec!["a".to_string()]);
}

#[test]
fn identical_content_plans_zero_writes() {
    // Second sync with unchanged inputs must not issue any write.
    let existing = arc_rules(vec![
        make_rule("shop", "a", OWNER_UID, "up == 0"),
        make_rule("shop", "b", OWNER_UID, "up == 1"),
    ]);
    let mut desired_a = make_rule("shop", "a", OWNER_UID, "up == 0");
    desired_a.metadata.resource_version = None;
    let mut desired_b = make_rule("shop", "b", OWNER_UID, "up == 1");
    desired_b.metadata.resource_version = None;

    let sync_plan = plan(desired_from(vec![desired_a, desired_b]), &existing, &BTreeSet::new());
    assert!(sync_plan.is_empty());
}

#[test]
fn updates_carry_the_existing_resource_version() {
    let mut current = make_rule("shop", "a", OWNER_UID, "up == 0");
    current.metadata.resource_version = Some("41".to_string());
    let mut desired = make_rule("shop", "a", OWNER_UID, "up == 1");
    desired.metadata.resource_version = None;

    let sync_plan = plan(desired_from(vec![desired]), &arc_rules(vec![current]), &BTreeSet::new());
    assert_eq!(sync_plan.update.len(), 1);
    assert_eq!(sync_plan.update[0].metadata.resource_version.as_deref(), Some("41"));
}

#[test]
fn removing_a_directive_deletes_exactly_its_rule() {
    let existing = arc_rules(vec![
        make_rule("shop", "error-rate-shop-web", OWNER_UID, "up == 0"),
        make_rule("shop", "latency-shop-web", OWNER_UID, "up == 1"),
    ]);
    // The latency directive remains; the error-rate directive was removed.
    let mut kept = make_rule("shop", "latency-shop-web", OWNER_UID, "up == 1");
    kept.metadata.resource_version = None;

    let sync_plan = plan(desired_from(vec![kept]), &existing, &BTreeSet::new());
    assert!(sync_plan.create.is_empty());
    assert!(sync_plan.update.is_empty());
    assert_eq!(sync_plan.delete, vec!["error-rate-shop-web".to_string()]);
}

#[test]
fn preserved_rules_are_never_deleted() {
    // A directive that failed soft this pass keeps its existing rule.
    let existing = arc_rules(vec![make_rule("shop", "error-rate-shop-web", OWNER_UID, "up == 0")]);
    let preserve: BTreeSet<String> = ["error-rate-shop-web".to_string()].into_iter().collect();

    let sync_plan = plan(BTreeMap::new(), &existing, &preserve);
    assert!(sync_plan.is_empty());
}

#[test]
fn rule_names_are_deterministic_per_workload_and_template() {
    assert_eq!(
        rule_name("replicas-availability-deployment", "testNamespace", "testApp"),
        "replicas-availability-deployment-testNamespace-testApp"
    );
    assert_eq!(
        rule_name("replicas-availability-deployment", "testNamespace", "testApp"),
        rule_name("replicas-availability-deployment", "testNamespace", "testApp"),
    );
}

#[test]
fn generated_labels_render_selectors_deterministically() {
    let selector = btree(&[("app", "web"), ("tier", "frontend")]);
    assert_eq!(generated_labels(&selector), ",app=\"web\",tier=\"frontend\"");
    assert_eq!(generated_labels(&BTreeMap::new()), "");
}

#[test]
fn replicas_availability_scenario_yields_one_fully_attributed_rule() {
    let registry = TemplateRegistry::from_sources([(
        "replicas-availability-deployment".to_string(),
        REPLICAS_TEMPLATE.to_string(),
    )])
    .expect("template compiles");

    let workload = workload("testNamespace", "testApp");
    let attrs = OwnershipAttributes {
        owner: "team-platform".to_string(),
        environment: "prod".to_string(),
        criticality: "high".to_string(),
        sensitivity: "internal".to_string(),
    };
    let params = RuleParams {
        identifier: workload.identifier(),
        namespace: workload.namespace.clone(),
        name: workload.name.clone(),
        threshold: "1".to_string(),
        owner: attrs.owner.clone(),
        environment: attrs.environment.clone(),
        criticality: attrs.criticality.clone(),
        sensitivity: attrs.sensitivity.clone(),
        ..RuleParams::default()
    };

    let rule = render_rule(&registry, "replicas-availability-deployment", &params, &workload, &attrs)
        .expect("rule renders");

    // Deterministic identity, not whatever the template document claimed.
    assert_eq!(
        rule.metadata.name.as_deref(),
        Some("replicas-availability-deployment-testNamespace-testApp")
    );
    assert_eq!(rule.metadata.namespace.as_deref(), Some("testNamespace"));

    // Exactly one rule with the literal expression.
    assert_eq!(rule.spec.groups.len(), 1);
    assert_eq!(rule.spec.groups[0].rules.len(), 1);
    assert_eq!(
        rule.spec.groups[0].rules[0].expr,
        "kube_deployment_status_replicas_available{namespace=\"testNamespace\", deployment=\"testApp\"} \
         / kube_deployment_spec_replicas{namespace=\"testNamespace\", deployment=\"testApp\"} <= 1"
    );

    // Ownership and managed-by labels.
    let labels = rule.metadata.labels.as_ref().expect("labels set");
    assert_eq!(labels.get("owner").map(String::as_str), Some("team-platform"));
    assert_eq!(labels.get("environment").map(String::as_str), Some("prod"));
    assert_eq!(labels.get(MANAGED_BY_LABEL).map(String::as_str), Some(MANAGED_BY_VALUE));

    // Owner reference back to the workload.
    let owners = rule.metadata.owner_references.as_ref().expect("owner refs set");
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].uid, OWNER_UID);
    assert_eq!(owners[0].kind, "Deployment");
    assert_eq!(owners[0].controller, Some(true));
}

#[test]
fn failed_render_preserves_existing_rule_via_plan() {
    // End-to-end shape of fail-soft: the directive's rule name goes into
    // the preserve set instead of desired, and the plan leaves its existing
    // rule untouched while still deleting true orphans.
    let name = rule_name("error-rate", "shop", "web");
    let existing = arc_rules(vec![
        make_rule("shop", &name, OWNER_UID, "up == 0"),
        make_rule("shop", "orphaned-rule", OWNER_UID, "up == 0"),
    ]);
    let preserve: BTreeSet<String> = [name].into_iter().collect();

    let sync_plan = plan(BTreeMap::new(), &existing, &preserve);
    assert_eq!(sync_plan.delete, vec!["orphaned-rule".to_string()]);
    assert!(sync_plan.create.is_empty());
    assert!(sync_plan.update.is_empty());
}
