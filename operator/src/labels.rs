use std::collections::BTreeMap;

use crate::{config::LabelConventions, crd::Mode};

pub type Labels = BTreeMap<String, String>;

/// Annotation prefix that is never propagated from the custom resource to the
/// generated objects, so `kubectl apply` doesn't prune them.
pub const KUBECTL_ANNOTATION_PREFIX: &str = "kubectl.kubernetes.io/";

pub const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";

/// Identity labels selecting the pods of one workload.
///
/// These end up in the immutable `spec.selector` of the workload: they only
/// depend on the resource name and mode, never on user-supplied labels.
pub fn selector_labels(name: &str, mode: Mode, conventions: &LabelConventions) -> Labels {
    BTreeMap::from([
        (conventions.app_name.clone(), mode.app_name().to_string()),
        (
            conventions.managed_by.clone(),
            conventions.managed_by_value.clone(),
        ),
        (conventions.app_instance.clone(), name.to_string()),
        (conventions.name.clone(), name.to_string()),
    ])
}

/// Returns `base` with every entry of `overlay` set on top of it.
pub fn merge_labels(base: &Labels, overlay: &Labels) -> Labels {
    let mut merged = base.clone();
    merged.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Drops annotations owned by kubectl.
pub fn filter_kubectl_annotations(annotations: &Labels) -> Labels {
    annotations
        .iter()
        .filter(|(key, _)| !key.starts_with(KUBECTL_ANNOTATION_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
