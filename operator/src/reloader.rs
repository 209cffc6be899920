//! The config-reloader sidecar.
//!
//! The sidecar renders the compressed configuration into `config_out` and
//! tells Prometheus to reload when the configuration or one of the watched
//! directories changes. Its init-container variant renders the configuration
//! once so that Prometheus finds a valid file on its first start.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        Capabilities, Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector,
        ResourceRequirements, SecurityContext, VolumeMount,
    },
    apimachinery::pkg::api::resource::Quantity,
};

use crate::{
    config::Config,
    consts::{
        CONFIG_DIR, CONFIG_ENVSUBST_FILENAME, CONFIG_FILENAME, CONFIG_OUT_DIR, PROMETHEUS_PORT,
        join_route,
    },
    crd::{CommonPrometheusFields, ReloadStrategy},
};

pub const RELOADER_CONTAINER: &str = "config-reloader";
pub const RELOADER_PORT_NAME: &str = "reloader-web";

/// Builder for the config-reloader container.
pub struct ConfigReloader<'a> {
    cpf: &'a CommonPrometheusFields,
    config: &'a Config,
    scheme: &'a str,
    mounts: Vec<VolumeMount>,
    watched_dirs: Vec<String>,
    init: bool,
    web_config_file: Option<String>,
    node_name_env: bool,
}

impl<'a> ConfigReloader<'a> {
    /// `scheme` is the scheme Prometheus serves its API with.
    pub fn new(
        cpf: &'a CommonPrometheusFields,
        config: &'a Config,
        scheme: &'a str,
        mounts: Vec<VolumeMount>,
        watched_dirs: Vec<String>,
    ) -> Self {
        Self {
            cpf,
            config,
            scheme,
            mounts,
            watched_dirs,
            init: false,
            web_config_file: None,
            node_name_env: false,
        }
    }

    /// Runs once and exits.
    pub fn init(mut self) -> Self {
        self.init = true;
        self
    }

    pub fn web_config_file(mut self, path: Option<String>) -> Self {
        self.web_config_file = path;
        self
    }

    /// Exposes the node name to the sidecar, which substitutes it in the
    /// configuration so that per-node agents only scrape local targets.
    pub fn node_name_env(mut self) -> Self {
        self.node_name_env = true;
        self
    }

    pub fn build(self) -> Container {
        let cpf = self.cpf;
        let reloader = &self.config.reloader;

        let mut args = Vec::new();
        let mut ports = None;

        if self.init {
            args.push("--watch-interval=0".to_string());
        } else {
            let listen_local =
                cpf.reload_strategy == ReloadStrategy::HttpReload && cpf.listen_local;
            if listen_local {
                args.push(format!(
                    "--listen-address={}:{}",
                    self.config.local_host, reloader.port
                ));
            } else {
                args.push(format!("--listen-address=:{}", reloader.port));
                ports = Some(vec![ContainerPort {
                    name: Some(RELOADER_PORT_NAME.into()),
                    container_port: reloader.port,
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]);
            }

            if let Some(file) = &self.web_config_file {
                args.push(format!("--web-config-file={file}"));
            }

            match cpf.reload_strategy {
                ReloadStrategy::ProcessSignalReload => {
                    args.push("--reload-method=signal".into());
                    args.push(format!(
                        "--runtimeinfo-url={}",
                        self.prometheus_url("/api/v1/status/runtimeinfo")
                    ));
                }
                ReloadStrategy::HttpReload => {
                    args.push(format!("--reload-url={}", self.prometheus_url("/-/reload")));
                }
            }
        }

        args.push(format!("--config-file={CONFIG_DIR}/{CONFIG_FILENAME}"));
        args.push(format!(
            "--config-envsubst-file={CONFIG_OUT_DIR}/{CONFIG_ENVSUBST_FILENAME}"
        ));
        args.extend(self.watched_dirs.iter().map(|dir| format!("--watched-dir={dir}")));
        if let Some(level) = &cpf.log_level {
            args.push(format!("--log-level={level}"));
        }
        if let Some(format) = &cpf.log_format {
            args.push(format!("--log-format={format}"));
        }

        let mut env = vec![
            field_env("POD_NAME", "metadata.name"),
            EnvVar {
                name: "SHARD".into(),
                value: Some("0".into()),
                ..Default::default()
            },
        ];
        if self.node_name_env && !self.init {
            env.push(field_env("NODE_NAME", "spec.nodeName"));
        }

        Container {
            name: if self.init {
                format!("init-{RELOADER_CONTAINER}")
            } else {
                RELOADER_CONTAINER.to_string()
            },
            image: Some(reloader.image.clone()),
            image_pull_policy: cpf.image_pull_policy.clone(),
            command: Some(vec!["/bin/prometheus-config-reloader".into()]),
            args: Some(args),
            env: Some(env),
            ports,
            resources: Some(self.resources()),
            volume_mounts: Some(self.mounts),
            termination_message_policy: Some("FallbackToLogsOnError".into()),
            security_context: Some(restricted_security_context()),
            ..Default::default()
        }
    }

    fn prometheus_url(&self, path: &str) -> String {
        format!(
            "{}://{}:{PROMETHEUS_PORT}{}",
            self.scheme,
            self.config.local_host,
            join_route(self.cpf.web_route_prefix(), path)
        )
    }

    fn resources(&self) -> ResourceRequirements {
        let reloader = &self.config.reloader;
        let quantities = |cpu: &Option<String>, memory: &Option<String>| {
            let mut out = BTreeMap::new();
            if let Some(cpu) = cpu {
                out.insert("cpu".to_string(), Quantity(cpu.clone()));
            }
            if let Some(memory) = memory {
                out.insert("memory".to_string(), Quantity(memory.clone()));
            }
            (!out.is_empty()).then_some(out)
        };

        ResourceRequirements {
            requests: quantities(&reloader.cpu_request, &reloader.memory_request),
            limits: quantities(&reloader.cpu_limit, &reloader.memory_limit),
            ..Default::default()
        }
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Read-only root filesystem, no privilege escalation, no capabilities.
pub fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        read_only_root_filesystem: Some(true),
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".into()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
