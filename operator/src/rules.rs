//! Distribution of rule files over ConfigMaps.
//!
//! A ConfigMap can't hold more than [`MAX_SECRET_SIZE`] bytes, so the rule
//! files selected for a Prometheus are packed into as many ConfigMaps as
//! needed. Packing is deterministic: the same rule files always produce the
//! same ConfigMaps, in the same order, under the same names.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::ConfigMap,
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};
use kube::ResourceExt;

use crate::{
    config::Config,
    crd::{PrometheusRule, PrometheusWorkload},
    error::Error,
    labels::merge_labels,
};

/// Size limit enforced by the API server on a single object's data.
pub const MAX_SECRET_SIZE: usize = 1024 * 1024;

/// Packing capacity of one ConfigMap. Half of the hard limit leaves room for
/// the object metadata and the keys.
pub const MAX_CONFIG_MAP_DATA_SIZE: usize = MAX_SECRET_SIZE / 2;

pub type RuleFiles = BTreeMap<String, String>;

/// Packs rule files into buckets of at most [`MAX_CONFIG_MAP_DATA_SIZE`]
/// content bytes.
///
/// Files are visited in lexicographic order and appended to the current
/// bucket until the next one doesn't fit. The result always holds at least
/// one (possibly empty) bucket.
pub fn pack_rule_files(rule_files: &RuleFiles) -> Result<Vec<RuleFiles>, Error> {
    if let Some((name, _)) = rule_files
        .iter()
        .find(|(_, content)| content.len() > MAX_CONFIG_MAP_DATA_SIZE)
    {
        return Err(Error::OversizedRuleFile(name.clone()));
    }

    let mut buckets = Vec::new();
    let mut current = RuleFiles::new();
    let mut current_size = 0;

    for (name, content) in rule_files {
        if current_size + content.len() > MAX_CONFIG_MAP_DATA_SIZE {
            buckets.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += content.len();
        current.insert(name.clone(), content.clone());
    }
    buckets.push(current);

    Ok(buckets)
}

pub fn rule_config_map_name(name: &str, index: usize) -> String {
    format!("{}-{index}", rule_config_map_prefix(name))
}

/// Common prefix of the rule ConfigMaps of one Prometheus.
pub fn rule_config_map_prefix(name: &str) -> String {
    format!("prometheus-{name}-rulefiles")
}

/// Builds the ConfigMaps holding `rule_files` for `resource`.
pub fn make_rules_config_maps<P: PrometheusWorkload>(
    resource: &P,
    rule_files: &RuleFiles,
    config: &Config,
) -> Result<Vec<ConfigMap>, Error> {
    let name = resource.name_any();
    let conventions = &config.label_conventions;
    let labels = merge_labels(
        &config.labels,
        &BTreeMap::from([
            (conventions.name.clone(), name.clone()),
            (
                conventions.managed_by.clone(),
                conventions.managed_by_value.clone(),
            ),
        ]),
    );

    Ok(pack_rule_files(rule_files)?
        .into_iter()
        .enumerate()
        .map(|(index, data)| ConfigMap {
            metadata: ObjectMeta {
                name: Some(rule_config_map_name(&name, index)),
                namespace: resource.namespace(),
                labels: Some(labels.clone()),
                owner_references: resource.controller_owner_ref(&()).map(|o| vec![o]),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        })
        .collect())
}

/// Renders a PrometheusRule as a Prometheus rule file.
///
/// Returns the file name, `<namespace>-<name>-<uid>.yaml`, and its content.
pub fn render_rule_file(rule: &PrometheusRule) -> Result<(String, String), Error> {
    let namespace = rule
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let uid = rule.uid().ok_or(Error::MissingObjectKey("metadata.uid"))?;

    let key = format!("{namespace}-{}-{uid}.yaml", rule.name_any());
    Ok((key, serde_yaml::to_string(&rule.spec)?))
}

/// Renders a label selector in the syntax accepted by list calls.
///
/// An empty selector selects everything and renders as an empty string.
pub fn selector_string(selector: &LabelSelector) -> String {
    let mut terms: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();

    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.clone().unwrap_or_default().join(",");
        terms.push(match expr.operator.as_str() {
            "In" => format!("{} in ({values})", expr.key),
            "NotIn" => format!("{} notin ({values})", expr.key),
            "Exists" => expr.key.clone(),
            "DoesNotExist" => format!("!{}", expr.key),
            other => format!("{} {} ({values})", expr.key, other.to_ascii_lowercase()),
        });
    }

    terms.join(",")
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    use super::*;
    use crate::crd::{Prometheus, PrometheusRuleSpec, PrometheusSpec, Rule, RuleGroup};

    fn files(entries: &[(&str, String)]) -> RuleFiles {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn prometheus() -> Prometheus {
        let mut prometheus = Prometheus::new("test", PrometheusSpec::default());
        prometheus.metadata.namespace = Some("monitoring".into());
        prometheus
    }

    #[test]
    fn returns_at_least_one_config_map() {
        let buckets = pack_rule_files(&RuleFiles::new()).unwrap();
        assert_eq!(buckets, vec![RuleFiles::new()]);

        let config_maps =
            make_rules_config_maps(&prometheus(), &RuleFiles::new(), &Config::default()).unwrap();
        assert_eq!(config_maps.len(), 1);
        assert_eq!(
            config_maps[0].metadata.name.as_deref(),
            Some("prometheus-test-rulefiles-0")
        );
    }

    #[test]
    fn errors_on_too_large_rule_file() {
        let rule_files = files(&[
            ("my-rule-file", "a".repeat(MAX_SECRET_SIZE + 1)),
            ("small", "a".into()),
        ]);
        let err = make_rules_config_maps(&prometheus(), &rule_files, &Config::default())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "rule file 'my-rule-file' is too large for a single Kubernetes ConfigMap"
        );

        // Anything above the packing capacity can never fit either.
        let rule_files = files(&[("f", "a".repeat(MAX_CONFIG_MAP_DATA_SIZE + 1))]);
        assert!(matches!(
            pack_rule_files(&rule_files),
            Err(Error::OversizedRuleFile(name)) if name == "f"
        ));
    }

    #[test]
    fn splits_large_and_small_into_two() {
        let rule_files = files(&[
            ("first", "a".repeat(MAX_CONFIG_MAP_DATA_SIZE)),
            ("second", "a".into()),
        ]);
        let config_maps =
            make_rules_config_maps(&prometheus(), &rule_files, &Config::default()).unwrap();

        assert_eq!(config_maps.len(), 2);
        let data = |i: usize| config_maps[i].data.clone().unwrap();
        assert_eq!(data(0).len(), 1);
        assert_eq!(data(0)["first"], rule_files["first"]);
        assert_eq!(data(1).len(), 1);
        assert_eq!(data(1)["second"], "a");
        assert_eq!(
            config_maps[1].metadata.name.as_deref(),
            Some("prometheus-test-rulefiles-1")
        );
    }

    #[test]
    fn packing_is_deterministic_and_bounded() {
        let chunk = MAX_CONFIG_MAP_DATA_SIZE / 3;
        let rule_files: RuleFiles = (0..10)
            .map(|i| (format!("rules-{i}"), "x".repeat(chunk + i)))
            .collect();

        let first = pack_rule_files(&rule_files).unwrap();
        let second = pack_rule_files(&rule_files).unwrap();
        assert_eq!(first, second);

        for bucket in &first {
            let size: usize = bucket.values().map(String::len).sum();
            assert!(size <= MAX_CONFIG_MAP_DATA_SIZE);
        }

        let packed: usize = first.iter().map(BTreeMap::len).sum();
        assert_eq!(packed, rule_files.len());

        // Lexicographic order across buckets.
        let order: Vec<&String> = first.iter().flat_map(|b| b.keys()).collect();
        let expected: Vec<&String> = rule_files.keys().collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn config_maps_are_labeled_and_owned() {
        let mut resource = prometheus();
        resource.metadata.uid = Some("2c5e".into());
        let config_maps =
            make_rules_config_maps(&resource, &RuleFiles::new(), &Config::default()).unwrap();

        let meta = &config_maps[0].metadata;
        assert_eq!(meta.namespace.as_deref(), Some("monitoring"));
        let labels = meta.labels.as_ref().unwrap();
        assert_eq!(labels["operator.prometheus.io/name"], "test");
        assert_eq!(labels["app.kubernetes.io/managed-by"], "prometheus-operator");
        let owner = &meta.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Prometheus");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn renders_rule_files() {
        let mut rule = PrometheusRule::new(
            "node",
            PrometheusRuleSpec {
                groups: vec![RuleGroup {
                    name: "node.rules".into(),
                    interval: None,
                    rules: vec![Rule {
                        alert: Some("NodeDown".into()),
                        expr: "up == 0".into(),
                        for_: Some("5m".into()),
                        ..Default::default()
                    }],
                }],
            },
        );
        assert!(matches!(
            render_rule_file(&rule),
            Err(Error::MissingObjectKey("metadata.namespace"))
        ));

        rule.metadata.namespace = Some("monitoring".into());
        rule.metadata.uid = Some("1234".into());
        let (key, content) = render_rule_file(&rule).unwrap();

        assert_eq!(key, "monitoring-node-1234.yaml");
        assert!(content.contains("name: node.rules"));
        assert!(content.contains("alert: NodeDown"));
        assert!(content.contains("for: 5m"));
        assert!(!content.contains("record"));
    }

    #[test]
    fn renders_label_selectors() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("role".into(), "alert-rules".into())])),
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "team".into(),
                    operator: "In".into(),
                    values: Some(vec!["sre".into(), "infra".into()]),
                },
                LabelSelectorRequirement {
                    key: "deprecated".into(),
                    operator: "DoesNotExist".into(),
                    values: None,
                },
            ]),
        };
        assert_eq!(
            selector_string(&selector),
            "role=alert-rules,team in (sre,infra),!deprecated"
        );
        assert_eq!(selector_string(&LabelSelector::default()), "");
    }
}
