//! PrometheusRule CRD
//!
//! Typed view of the prometheus-operator `PrometheusRule` resource
//! (`monitoring.coreos.com/v1`). The CRD itself is installed by the
//! prometheus-operator; alertops only creates and owns instances of it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "PrometheusRule",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusRuleSpec {
    /// Rule groups evaluated by Prometheus
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<RuleGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuleGroup {
    /// Group name, unique within the resource
    pub name: String,

    /// Evaluation interval override (e.g. "30s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Alerting/recording rules in this group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,
}

/// A single alerting or recording rule.
///
/// Exactly one of `alert` / `record` is expected to be set; the controller
/// does not validate rule semantics, it only carries them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Alert name (alerting rules)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,

    /// Recorded metric name (recording rules)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,

    /// PromQL expression
    pub expr: String,

    /// Duration the expression must hold before firing (e.g. "5m")
    #[serde(default, rename = "for", skip_serializing_if = "Option::is_none")]
    pub for_: Option<String>,

    /// Labels attached to the fired alert / recorded series
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations attached to the fired alert
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_yaml_round_trips_reserved_for_keyword() {
        let yaml = r#"
alert: HighErrorRate
expr: rate(errors_total[5m]) > 0.5
for: 10m
labels:
  severity: critical
"#;
        let rule: Rule = serde_yaml::from_str(yaml).expect("rule should parse");
        assert_eq!(rule.alert.as_deref(), Some("HighErrorRate"));
        assert_eq!(rule.for_.as_deref(), Some("10m"));
        assert_eq!(rule.labels.get("severity").map(String::as_str), Some("critical"));

        let out = serde_yaml::to_string(&rule).expect("rule should serialize");
        assert!(out.contains("for: 10m"), "serialized rule must use the `for` key: {out}");
    }

    #[test]
    fn prometheus_rule_parses_full_document() {
        let yaml = r#"
apiVersion: monitoring.coreos.com/v1
kind: PrometheusRule
metadata:
  name: sample
  namespace: default
spec:
  groups:
    - name: sample-group
      rules:
        - alert: Sample
          expr: up == 0
"#;
        let rule: PrometheusRule = serde_yaml::from_str(yaml).expect("document should parse");
        assert_eq!(rule.metadata.name.as_deref(), Some("sample"));
        assert_eq!(rule.spec.groups.len(), 1);
        assert_eq!(rule.spec.groups[0].rules[0].expr, "up == 0");
    }
}
