//! Operator-wide configuration.
//!
//! The configuration is read once at startup and handed to the builders as an
//! immutable value; nothing in here is mutated while reconciling.

use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Error;

/// Environment variable naming the YAML file to load the configuration from.
pub const CONFIG_PATH_ENV: &str = "OPERATOR_CONFIG";

pub const DEFAULT_PROMETHEUS_BASE_IMAGE: &str = "quay.io/prometheus/prometheus";
pub const DEFAULT_PROMETHEUS_VERSION: &str = "v2.55.1";
pub const DEFAULT_RELOADER_IMAGE: &str =
    "quay.io/prometheus-operator/prometheus-config-reloader:v0.79.2";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub prometheus_default_base_image: String,
    pub default_prometheus_version: String,
    /// Host the sidecar uses to reach Prometheus inside the pod.
    pub local_host: String,
    pub reloader: ReloaderConfig,
    /// Labels added to every object the operator generates.
    pub labels: BTreeMap<String, String>,
    /// Annotations added to every workload the operator generates.
    pub annotations: BTreeMap<String, String>,
    pub label_conventions: LabelConventions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prometheus_default_base_image: DEFAULT_PROMETHEUS_BASE_IMAGE.into(),
            default_prometheus_version: DEFAULT_PROMETHEUS_VERSION.into(),
            local_host: "localhost".into(),
            reloader: ReloaderConfig::default(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            label_conventions: LabelConventions::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from the file named by [`CONFIG_PATH_ENV`],
    /// or returns the defaults when the variable is unset.
    pub fn load() -> Result<Self, Error> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => {
                info!("{CONFIG_PATH_ENV} is not set, using default configuration");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&raw)?;
        info!("loaded operator configuration from {}", path.display());
        Ok(config)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReloaderConfig {
    pub image: String,
    pub port: i32,
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

impl Default for ReloaderConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_RELOADER_IMAGE.into(),
            port: 8080,
            cpu_request: Some("10m".into()),
            cpu_limit: Some("10m".into()),
            memory_request: Some("50Mi".into()),
            memory_limit: Some("50Mi".into()),
        }
    }
}

/// Well-known label keys stamped on generated objects.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelConventions {
    pub name: String,
    pub mode: String,
    pub shard: String,
    pub app_name: String,
    pub app_instance: String,
    pub app_version: String,
    pub managed_by: String,
    pub managed_by_value: String,
}

impl Default for LabelConventions {
    fn default() -> Self {
        Self {
            name: "operator.prometheus.io/name".into(),
            mode: "operator.prometheus.io/mode".into(),
            shard: "operator.prometheus.io/shard".into(),
            app_name: "app.kubernetes.io/name".into(),
            app_instance: "app.kubernetes.io/instance".into(),
            app_version: "app.kubernetes.io/version".into(),
            managed_by: "app.kubernetes.io/managed-by".into(),
            managed_by_value: "prometheus-operator".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: Config = serde_yaml::from_str(
            r#"
defaultPrometheusVersion: v2.45.0
labels:
  team: observability
reloader:
  image: example.com/reloader:v1
"#,
        )
        .unwrap();

        assert_eq!(config.default_prometheus_version, "v2.45.0");
        assert_eq!(config.labels["team"], "observability");
        assert_eq!(config.reloader.image, "example.com/reloader:v1");
        assert_eq!(config.reloader.port, 8080);
        assert_eq!(
            config.prometheus_default_base_image,
            DEFAULT_PROMETHEUS_BASE_IMAGE
        );
        assert_eq!(config.label_conventions, LabelConventions::default());
    }
}
