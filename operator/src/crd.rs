use std::{collections::BTreeMap, fmt::Display};

use k8s_openapi::{
    api::core::v1::{
        Affinity, EmptyDirVolumeSource, HostAlias, LocalObjectReference, PersistentVolumeClaim,
        PodSecurityContext, ResourceRequirements, Toleration, TopologySpreadConstraint, Volume,
        VolumeMount,
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::merge::ContainerPatch;

/// Fields shared by the Prometheus server and the Prometheus agent resources.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonPrometheusFields {
    /// Fully qualified image. Takes precedence over `version` when set.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub image_pull_policy: Option<String>,
    #[serde(default)]
    pub image_pull_secrets: Vec<LocalObjectReference>,
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub port_name: String,
    #[serde(default)]
    pub listen_local: bool,
    #[serde(default)]
    pub route_prefix: Option<String>,
    #[serde(default)]
    pub external_url: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_format: Option<String>,

    #[serde(default)]
    pub pod_metadata: Option<EmbeddedObjectMetadata>,
    #[serde(default)]
    pub service_account_name: Option<String>,
    #[serde(default)]
    pub automount_service_account_token: Option<bool>,

    #[serde(default)]
    pub enable_features: Vec<String>,
    #[serde(default)]
    pub additional_args: Vec<Argument>,
    #[serde(default)]
    pub containers: Vec<ContainerPatch>,
    #[serde(default)]
    pub init_containers: Vec<ContainerPatch>,

    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    /// Secrets mounted under `/etc/prometheus/secrets/<name>`.
    #[serde(default)]
    pub secrets: Vec<String>,
    /// ConfigMaps mounted under `/etc/prometheus/configmaps/<name>`.
    #[serde(default)]
    pub config_maps: Vec<String>,
    #[serde(default)]
    pub storage: Option<StorageSpec>,

    #[serde(default)]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub affinity: Option<Affinity>,
    #[serde(default)]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
    #[serde(default)]
    pub host_aliases: Vec<HostAlias>,
    #[serde(default)]
    pub security_context: Option<PodSecurityContext>,
    #[serde(default)]
    pub priority_class_name: Option<String>,
    #[serde(default)]
    pub host_network: bool,

    #[serde(default)]
    pub web: Option<WebSpec>,
    #[serde(default)]
    pub reload_strategy: ReloadStrategy,
    #[serde(default)]
    pub min_ready_seconds: Option<u32>,
    #[serde(default)]
    pub wal_compression: Option<bool>,
}

impl CommonPrometheusFields {
    pub fn web_route_prefix(&self) -> &str {
        self.route_prefix
            .as_deref()
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or("/")
    }

    pub fn web_tls_config(&self) -> Option<&WebTlsConfig> {
        self.web.as_ref().and_then(|web| web.tls_config.as_ref())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedObjectMetadata {
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// A command-line flag passed to Prometheus as `--name=value` (or `--name` when
/// the value is empty).
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Argument {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

impl Argument {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn flag(name: impl Into<String>) -> Self {
        Self::new(name, "")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(default)]
    pub empty_dir: Option<EmptyDirVolumeSource>,
    /// Only honored by the StatefulSet shape.
    #[serde(default)]
    pub volume_claim_template: Option<PersistentVolumeClaim>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebSpec {
    #[serde(default)]
    pub page_title: Option<String>,
    #[serde(default)]
    pub max_connections: Option<i32>,
    #[serde(default)]
    pub tls_config: Option<WebTlsConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebTlsConfig {
    /// Name of a `kubernetes.io/tls` Secret holding `tls.crt` and `tls.key`.
    pub secret_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, JsonSchema, Default, PartialEq, Eq)]
pub enum ReloadStrategy {
    #[default]
    #[serde(rename = "HTTP")]
    HttpReload,
    #[serde(rename = "ProcessSignal")]
    ProcessSignalReload,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, JsonSchema, Default, PartialEq, Eq)]
pub enum WorkloadKind {
    #[default]
    StatefulSet,
    DaemonSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Agent,
}

impl Mode {
    /// Value of the mode label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Server => "server",
            Mode::Agent => "agent",
        }
    }

    /// Value of the `app.kubernetes.io/name` label.
    pub fn app_name(&self) -> &'static str {
        match self {
            Mode::Server => "prometheus",
            Mode::Agent => "prometheus-agent",
        }
    }

    /// Feature flag that must be enabled for Prometheus to run in this mode.
    pub fn feature_marker(&self) -> Option<&'static str> {
        match self {
            Mode::Server => None,
            Mode::Agent => Some("agent"),
        }
    }

    pub fn object_prefix(&self) -> &'static str {
        match self {
            Mode::Server => "prometheus",
            Mode::Agent => "prom-agent",
        }
    }

    pub fn governing_service(&self) -> &'static str {
        match self {
            Mode::Server => "prometheus-operated",
            Mode::Agent => "prometheus-agent-operated",
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for Mode {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Accessor surface the workload builder needs from a Prometheus-like resource.
pub trait PrometheusWorkload: Resource<DynamicType = ()> + Clone {
    fn common_fields(&self) -> CommonPrometheusFields;

    fn set_common_fields(&mut self, fields: CommonPrometheusFields);

    fn mode(&self) -> Mode;

    fn workload_kind(&self) -> WorkloadKind;

    fn retention(&self) -> Option<&str> {
        None
    }

    fn rule_selector(&self) -> Option<&LabelSelector> {
        None
    }
}

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "Prometheus",
    plural = "prometheuses",
    derive = "Default",
    shortname = "prom",
    namespaced
)]
pub struct PrometheusSpec {
    #[serde(flatten)]
    pub common: CommonPrometheusFields,

    #[serde(default)]
    pub retention: Option<String>,

    /// Selects the PrometheusRule objects (in the same namespace) to load.
    #[serde(default)]
    pub rule_selector: Option<LabelSelector>,
}

impl PrometheusWorkload for Prometheus {
    fn common_fields(&self) -> CommonPrometheusFields {
        self.spec.common.clone()
    }

    fn set_common_fields(&mut self, fields: CommonPrometheusFields) {
        self.spec.common = fields;
    }

    fn mode(&self) -> Mode {
        Mode::Server
    }

    fn workload_kind(&self) -> WorkloadKind {
        WorkloadKind::StatefulSet
    }

    fn retention(&self) -> Option<&str> {
        self.spec.retention.as_deref()
    }

    fn rule_selector(&self) -> Option<&LabelSelector> {
        self.spec.rule_selector.as_ref()
    }
}

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1alpha1",
    kind = "PrometheusAgent",
    plural = "prometheusagents",
    derive = "Default",
    shortname = "promagent",
    namespaced
)]
pub struct PrometheusAgentSpec {
    #[serde(flatten)]
    pub common: CommonPrometheusFields,

    /// Deploys one agent per node (`DaemonSet`) or a fixed set of replicas.
    #[serde(default)]
    pub mode: WorkloadKind,
}

impl PrometheusWorkload for PrometheusAgent {
    fn common_fields(&self) -> CommonPrometheusFields {
        self.spec.common.clone()
    }

    fn set_common_fields(&mut self, fields: CommonPrometheusFields) {
        self.spec.common = fields;
    }

    fn mode(&self) -> Mode {
        Mode::Agent
    }

    fn workload_kind(&self) -> WorkloadKind {
        self.spec.mode
    }
}

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "PrometheusRule",
    plural = "prometheusrules",
    derive = "Default",
    shortname = "promrule",
    namespaced
)]
pub struct PrometheusRuleSpec {
    #[serde(default)]
    pub groups: Vec<RuleGroup>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    pub expr: String,
    #[serde(rename = "for", default, skip_serializing_if = "Option::is_none")]
    pub for_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}
