//! Builds the DaemonSet or StatefulSet running Prometheus.
//!
//! A single builder serves both the server and the agent resources. It goes
//! through the same steps for every shape: resolve the image, normalize the
//! feature list, assemble the (version-gated) arguments, compute volumes and
//! probes, merge the generated containers with the user overrides, then wrap
//! the pod template into the workload object. Any error aborts the build.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{
            DaemonSet, DaemonSetSpec, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
        },
        core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec, TopologySpreadConstraint},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    args::build_args,
    config::Config,
    consts::{
        CONFIG_ENVSUBST_FILENAME, CONFIG_OUT_DIR, DEFAULT_PORT_NAME, PROMETHEUS_CONTAINER,
        PROMETHEUS_PORT, STORAGE_DIR,
    },
    crd::{Argument, CommonPrometheusFields, Mode, PrometheusWorkload, ReloadStrategy, WorkloadKind},
    error::Error,
    image::resolve_image,
    labels::{
        DEFAULT_CONTAINER_ANNOTATION, Labels, filter_kubectl_annotations, merge_labels,
        selector_labels,
    },
    merge::merge_patch_containers,
    probes::make_probes,
    reloader::{ConfigReloader, restricted_security_context},
    version::{Advisory, Version, VersionGate},
    volumes::{TlsAssets, VolumeInputs, build_common_volumes, storage_volume_name},
    web::{WEB_CONFIG_MINIMUM_VERSION, WebConfig, build_web_config},
};

/// Hash of the generated object, used to skip no-op updates.
pub const INPUT_HASH_ANNOTATION: &str = "prometheus-operator-input-hash";

pub const WAL_COMPRESSION_MINIMUM_VERSION: Version = Version::new(2, 11, 0);
pub const PAGE_TITLE_MINIMUM_VERSION: Version = Version::new(2, 6, 0);

const DEFAULT_RETENTION: &str = "24h";
const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 600;

/// Name shared by the workload and its configuration Secret.
pub fn object_name(mode: Mode, name: &str) -> String {
    format!("{}-{name}", mode.object_prefix())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Workload {
    DaemonSet(DaemonSet),
    StatefulSet(StatefulSet),
}

impl Workload {
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Workload::DaemonSet(ds) => &ds.metadata,
            Workload::StatefulSet(sts) => &sts.metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Workload::DaemonSet(ds) => &mut ds.metadata,
            Workload::StatefulSet(sts) => &mut sts.metadata,
        }
    }

    pub fn template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Workload::DaemonSet(ds) => ds.spec.as_ref().map(|s| &s.template),
            Workload::StatefulSet(sts) => sts.spec.as_ref().map(|s| &s.template),
        }
    }

    pub fn selector(&self) -> Option<&LabelSelector> {
        match self {
            Workload::DaemonSet(ds) => ds.spec.as_ref().map(|s| &s.selector),
            Workload::StatefulSet(sts) => sts.spec.as_ref().map(|s| &s.selector),
        }
    }

    pub fn input_hash(&self) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()
            .and_then(|a| a.get(INPUT_HASH_ANNOTATION))
            .map(String::as_str)
    }
}

/// The generated workload and the features left out of it.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltWorkload {
    pub workload: Workload,
    pub advisories: Vec<Advisory>,
}

/// Clones the resource with its defaulted common fields written back.
fn with_defaults<P: PrometheusWorkload>(resource: &P) -> P {
    let mut cpf = resource.common_fields();
    if cpf.port_name.is_empty() {
        cpf.port_name = DEFAULT_PORT_NAME.into();
    }
    if let Some(marker) = resource.mode().feature_marker() {
        ensure_feature(&mut cpf.enable_features, marker);
    }

    let mut resource = resource.clone();
    resource.set_common_fields(cpf);
    resource
}

/// Inserts `feature` at the front of the list unless it's already there.
pub fn ensure_feature(features: &mut Vec<String>, feature: &str) {
    if !features.iter().any(|f| f == feature) {
        features.insert(0, feature.to_string());
    }
}

pub fn make_workload<P: PrometheusWorkload>(
    resource: &P,
    config: &Config,
    tls_assets: &TlsAssets,
    rule_config_maps: &[String],
) -> Result<BuiltWorkload, Error> {
    let resource = with_defaults(resource);
    let cpf = resource.common_fields();
    let name = resource.name_any();
    let mode = resource.mode();
    let kind = resource.workload_kind();
    let object = object_name(mode, &name);
    let mut advisories = Vec::new();

    let version = cpf
        .version
        .clone()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| config.default_prometheus_version.clone());
    let gate = VersionGate::new(&version);

    let image = resolve_image(
        cpf.image.as_deref(),
        &config.prometheus_default_base_image,
        &version,
        mode,
    )?;

    let web_gate = gate.with_minimum_version(WEB_CONFIG_MINIMUM_VERSION);
    let web_config = if web_gate.is_compatible() {
        Some(build_web_config(&object, &cpf))
    } else {
        if cpf.web.is_some() {
            advisories.push(web_gate.warn("web.config.file"));
        }
        None
    };
    let scheme = if web_config.is_some() && cpf.web_tls_config().is_some() {
        "https"
    } else {
        "http"
    };

    let managed = managed_args(&resource, config, &gate, web_config.as_ref(), &mut advisories);
    let args = build_args(managed, &cpf.additional_args)?;

    let claim_template = match kind {
        WorkloadKind::StatefulSet => cpf
            .storage
            .as_ref()
            .and_then(|s| s.volume_claim_template.clone())
            .map(|mut claim| {
                if claim.metadata.name.as_deref().is_none_or(str::is_empty) {
                    claim.metadata.name = Some(storage_volume_name(&object));
                }
                claim
            }),
        WorkloadKind::DaemonSet => None,
    };

    let mut volumes = build_common_volumes(&VolumeInputs {
        object_name: &object,
        cpf: &cpf,
        tls_assets,
        rule_config_maps,
        claim_name: claim_template
            .as_ref()
            .and_then(|claim| claim.metadata.name.as_deref()),
    });
    if let Some(web) = &web_config {
        volumes.volumes.extend(web.volumes.iter().cloned());
        volumes.prometheus_mounts.extend(web.mounts.iter().cloned());
        volumes.reloader_mounts.extend(web.mounts.iter().cloned());
    }

    let probes = make_probes(&cpf, scheme, &config.local_host);

    let prometheus = Container {
        name: PROMETHEUS_CONTAINER.into(),
        image: Some(image),
        image_pull_policy: cpf.image_pull_policy.clone(),
        args: Some(args),
        ports: (!cpf.listen_local).then(|| {
            vec![ContainerPort {
                name: Some(cpf.port_name.clone()),
                container_port: PROMETHEUS_PORT,
                protocol: Some("TCP".into()),
                ..Default::default()
            }]
        }),
        volume_mounts: Some(volumes.prometheus_mounts),
        startup_probe: Some(probes.startup),
        readiness_probe: Some(probes.readiness),
        liveness_probe: Some(probes.liveness),
        resources: cpf.resources.clone(),
        termination_message_policy: Some("FallbackToLogsOnError".into()),
        security_context: Some(restricted_security_context()),
        ..Default::default()
    };

    let web_config_file = web_config.as_ref().map(|w| w.file_path().to_string());
    let mut sidecar = ConfigReloader::new(
        &cpf,
        config,
        scheme,
        volumes.reloader_mounts.clone(),
        volumes.watched_dirs.clone(),
    )
    .web_config_file(web_config_file);
    if kind == WorkloadKind::DaemonSet {
        sidecar = sidecar.node_name_env();
    }
    let init_reloader = ConfigReloader::new(
        &cpf,
        config,
        scheme,
        volumes.reloader_mounts,
        volumes.watched_dirs,
    )
    .init()
    .build();

    let containers = merge_patch_containers(vec![prometheus, sidecar.build()], &cpf.containers)?;
    let init_containers = merge_patch_containers(vec![init_reloader], &cpf.init_containers)?;

    let conventions = &config.label_conventions;
    let selector = selector_labels(&name, mode, conventions);

    let pod_metadata = cpf.pod_metadata.clone().unwrap_or_default();
    let mut pod_labels = merge_labels(&config.labels, &pod_metadata.labels.unwrap_or_default());
    pod_labels.insert(conventions.shard.clone(), "0".into());
    if let Some(current) = gate.current() {
        pod_labels.insert(conventions.app_version.clone(), current.to_string());
    }
    let pod_labels = merge_labels(&pod_labels, &selector);

    let mut pod_annotations = pod_metadata.annotations.unwrap_or_default();
    pod_annotations.insert(
        DEFAULT_CONTAINER_ANNOTATION.into(),
        PROMETHEUS_CONTAINER.into(),
    );

    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels),
            annotations: Some(pod_annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers,
            init_containers: Some(init_containers),
            volumes: Some(volumes.volumes),
            service_account_name: cpf.service_account_name.clone(),
            automount_service_account_token: Some(
                cpf.automount_service_account_token.unwrap_or(true),
            ),
            node_selector: cpf.node_selector.clone(),
            priority_class_name: cpf.priority_class_name.clone(),
            security_context: cpf.security_context.clone(),
            termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD_SECONDS),
            tolerations: non_empty(cpf.tolerations.clone()),
            affinity: cpf.affinity.clone(),
            topology_spread_constraints: non_empty(topology_spread_constraints(&cpf, &selector)),
            host_aliases: non_empty(cpf.host_aliases.clone()),
            host_network: cpf.host_network.then_some(true),
            dns_policy: cpf
                .host_network
                .then(|| "ClusterFirstWithHostNet".to_string()),
            share_process_namespace: (cpf.reload_strategy == ReloadStrategy::ProcessSignalReload)
                .then_some(true),
            image_pull_secrets: non_empty(cpf.image_pull_secrets.clone()),
            ..Default::default()
        }),
    };

    let label_selector = LabelSelector {
        match_labels: Some(selector),
        ..Default::default()
    };
    let min_ready_seconds = cpf
        .min_ready_seconds
        .map(|s| i32::try_from(s).unwrap_or(i32::MAX));
    let metadata = workload_metadata(&resource, config, &object);

    let mut workload = match kind {
        WorkloadKind::DaemonSet => Workload::DaemonSet(DaemonSet {
            metadata,
            spec: Some(DaemonSetSpec {
                selector: label_selector,
                template,
                min_ready_seconds,
                ..Default::default()
            }),
            ..Default::default()
        }),
        WorkloadKind::StatefulSet => {
            Workload::StatefulSet(StatefulSet {
                metadata,
                spec: Some(StatefulSetSpec {
                    replicas: Some(1),
                    selector: label_selector,
                    service_name: Some(mode.governing_service().to_string()),
                    template,
                    pod_management_policy: Some("Parallel".into()),
                    update_strategy: Some(StatefulSetUpdateStrategy {
                        type_: Some("RollingUpdate".into()),
                        ..Default::default()
                    }),
                    volume_claim_templates: claim_template.map(|claim| vec![claim]),
                    min_ready_seconds,
                    ..Default::default()
                }),
                ..Default::default()
            })
        }
    };

    let hash = input_hash(&workload)?;
    debug!(workload = %object, hash = %hash, "built workload");
    workload
        .metadata_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(INPUT_HASH_ANNOTATION.into(), hash);

    Ok(BuiltWorkload {
        workload,
        advisories,
    })
}

/// Arguments owned by the operator, in the order they are rendered.
fn managed_args<P: PrometheusWorkload>(
    resource: &P,
    config: &Config,
    gate: &VersionGate,
    web_config: Option<&WebConfig>,
    advisories: &mut Vec<Advisory>,
) -> Vec<Argument> {
    let cpf = resource.common_fields();
    let mode = resource.mode();

    let mut args = vec![Argument::new(
        "config.file",
        format!("{CONFIG_OUT_DIR}/{CONFIG_ENVSUBST_FILENAME}"),
    )];

    let storage_prefix = match mode {
        Mode::Server => {
            args.push(Argument::new("storage.tsdb.path", STORAGE_DIR));
            args.push(Argument::new(
                "storage.tsdb.retention.time",
                resource.retention().unwrap_or(DEFAULT_RETENTION),
            ));
            "storage.tsdb"
        }
        Mode::Agent => {
            args.push(Argument::new("storage.agent.path", STORAGE_DIR));
            "storage.agent"
        }
    };

    if let Some(enabled) = cpf.wal_compression {
        let wal_gate = gate.with_minimum_version(WAL_COMPRESSION_MINIMUM_VERSION);
        if wal_gate.is_compatible() {
            let flag = format!("{storage_prefix}.wal-compression");
            args.push(Argument::flag(if enabled {
                flag
            } else {
                format!("no-{flag}")
            }));
        } else {
            advisories.push(wal_gate.warn("wal-compression"));
        }
    }

    if cpf.reload_strategy == ReloadStrategy::HttpReload {
        args.push(Argument::flag("web.enable-lifecycle"));
    }
    args.push(Argument::new("web.route-prefix", cpf.web_route_prefix()));
    if let Some(url) = cpf.external_url.as_deref().filter(|u| !u.is_empty()) {
        args.push(Argument::new("web.external-url", url));
    }
    if cpf.listen_local {
        args.push(Argument::new(
            "web.listen-address",
            format!("{}:{PROMETHEUS_PORT}", config.local_host),
        ));
    }
    if let Some(level) = &cpf.log_level {
        args.push(Argument::new("log.level", level.as_str()));
    }
    if let Some(format) = &cpf.log_format {
        args.push(Argument::new("log.format", format.as_str()));
    }
    if !cpf.enable_features.is_empty() {
        args.push(Argument::new("enable-feature", cpf.enable_features.join(",")));
    }

    if let Some(web) = &cpf.web {
        if let Some(title) = &web.page_title {
            let title_gate = gate.with_minimum_version(PAGE_TITLE_MINIMUM_VERSION);
            if title_gate.is_compatible() {
                args.push(Argument::new("web.page-title", title.as_str()));
            } else {
                advisories.push(title_gate.warn("web.page-title"));
            }
        }
        if let Some(max) = web.max_connections {
            args.push(Argument::new("web.max-connections", max.to_string()));
        }
    }

    if let Some(web) = web_config {
        args.push(web.arg.clone());
    }

    args
}

fn workload_metadata<P: PrometheusWorkload>(resource: &P, config: &Config, object: &str) -> ObjectMeta {
    let conventions = &config.label_conventions;
    let identity: Labels = BTreeMap::from([
        (conventions.name.clone(), resource.name_any()),
        (conventions.mode.clone(), resource.mode().to_string()),
        (
            conventions.managed_by.clone(),
            conventions.managed_by_value.clone(),
        ),
    ]);
    let labels = merge_labels(&merge_labels(resource.labels(), &config.labels), &identity);
    let annotations = merge_labels(
        &filter_kubectl_annotations(resource.annotations()),
        &config.annotations,
    );

    ObjectMeta {
        name: Some(object.to_string()),
        namespace: resource.namespace(),
        labels: Some(labels),
        annotations: Some(annotations),
        owner_references: resource.controller_owner_ref(&()).map(|o| vec![o]),
        ..Default::default()
    }
}

/// Constraints without a label selector spread the pods of this workload.
fn topology_spread_constraints(
    cpf: &CommonPrometheusFields,
    selector: &Labels,
) -> Vec<TopologySpreadConstraint> {
    cpf.topology_spread_constraints
        .iter()
        .cloned()
        .map(|mut tsc| {
            if tsc.label_selector.is_none() {
                tsc.label_selector = Some(LabelSelector {
                    match_labels: Some(selector.clone()),
                    ..Default::default()
                });
            }
            tsc
        })
        .collect()
}

fn input_hash(workload: &Workload) -> Result<String, Error> {
    let bytes = match workload {
        Workload::DaemonSet(ds) => serde_json::to_vec(ds)?,
        Workload::StatefulSet(sts) => serde_json::to_vec(sts)?,
    };
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}
