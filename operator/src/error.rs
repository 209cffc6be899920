use kube::Error as KubeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] KubeError),

    #[error("failed to resolve image: {0}")]
    ImageResolution(String),

    #[error("failed to merge container '{container}': {reason}")]
    MergeConflict { container: String, reason: String },

    #[error("rule file '{0}' is too large for a single Kubernetes ConfigMap")]
    OversizedRuleFile(String),

    #[error("can't set arguments which are already managed by the operator: {}", .0.join(", "))]
    ArgumentConflict(Vec<String>),

    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("failed to read operator config: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn merge_conflict(container: &str, reason: impl Into<String>) -> Self {
        Error::MergeConflict {
            container: container.to_string(),
            reason: reason.into(),
        }
    }
}
