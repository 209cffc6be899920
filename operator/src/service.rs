use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::{ResourceExt, api::ObjectMeta};

use crate::{
    config::Config,
    consts::{DEFAULT_PORT_NAME, PROMETHEUS_PORT},
    crd::PrometheusWorkload,
    labels::merge_labels,
};

/// Label set on the governing Service of each mode.
pub const OPERATED_LABEL: &str = "operated-prometheus";

/// The headless Service shared by every workload of one mode in a namespace.
///
/// StatefulSets name it as their governing service, so it selects pods by
/// application name only. Each resource adds itself as a non-controlling owner.
pub fn make_governing_service<P: PrometheusWorkload>(resource: &P, config: &Config) -> Service {
    let conventions = &config.label_conventions;
    let mode = resource.mode();
    let port_name = Some(resource.common_fields().port_name)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_PORT_NAME.to_string());

    let labels = merge_labels(
        &config.labels,
        &BTreeMap::from([
            (OPERATED_LABEL.to_string(), "true".to_string()),
            (
                conventions.managed_by.clone(),
                conventions.managed_by_value.clone(),
            ),
        ]),
    );

    Service {
        metadata: ObjectMeta {
            name: Some(mode.governing_service().into()),
            namespace: resource.namespace(),
            labels: Some(labels),
            owner_references: resource.owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".into()),
            selector: Some(BTreeMap::from([(
                conventions.app_name.clone(),
                mode.app_name().to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some(port_name.clone()),
                port: PROMETHEUS_PORT,
                target_port: Some(IntOrString::String(port_name)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
