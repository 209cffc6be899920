pub mod args;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod event;
pub mod image;
pub mod labels;
pub mod merge;
pub mod probes;
pub mod reloader;
pub mod rules;
pub mod service;
pub mod version;
pub mod volumes;
pub mod web;
pub mod workload;

pub mod consts {
    pub const PROMETHEUS_CONTAINER: &str = "prometheus";
    pub const PROMETHEUS_PORT: i32 = 9090;
    pub const DEFAULT_PORT_NAME: &str = "web";

    pub const CONFIG_DIR: &str = "/etc/prometheus/config";
    pub const CONFIG_FILENAME: &str = "prometheus.yaml.gz";
    pub const CONFIG_OUT_DIR: &str = "/etc/prometheus/config_out";
    pub const CONFIG_ENVSUBST_FILENAME: &str = "prometheus.env.yaml";
    pub const TLS_ASSETS_DIR: &str = "/etc/prometheus/certs";
    pub const RULES_DIR: &str = "/etc/prometheus/rules";
    pub const SECRETS_DIR: &str = "/etc/prometheus/secrets";
    pub const CONFIG_MAPS_DIR: &str = "/etc/prometheus/configmaps";
    pub const WEB_CONFIG_DIR: &str = "/etc/prometheus/web_config";
    pub const STORAGE_DIR: &str = "/prometheus";

    /// Field manager used for server-side apply.
    pub const FIELD_MANAGER: &str = "prometheus-operator";

    /// Joins a route prefix and an absolute path: `("/prom/", "/-/ready")` is
    /// `/prom/-/ready`.
    pub fn join_route(prefix: &str, path: &str) -> String {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            path.to_string()
        } else {
            format!("/{prefix}{path}")
        }
    }
}
