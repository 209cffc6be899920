use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Secret, SecretVolumeSource, Volume, VolumeMount};
use kube::{ResourceExt, api::ObjectMeta};
use serde::Serialize;

use crate::{
    config::Config,
    consts::WEB_CONFIG_DIR,
    crd::{Argument, CommonPrometheusFields, PrometheusWorkload},
    error::Error,
    labels::merge_labels,
    version::Version,
    volumes::mount,
    workload::object_name,
};

/// Prometheus reads `--web.config.file` since 2.24.0.
pub const WEB_CONFIG_MINIMUM_VERSION: Version = Version::new(2, 24, 0);

pub const WEB_CONFIG_FILE: &str = "web-config.yaml";
pub const WEB_CONFIG_VOLUME: &str = "web-config";
pub const WEB_TLS_VOLUME: &str = "web-config-tls";

/// The `--web.config.file` argument with the volumes backing it.
#[derive(Debug, Clone, PartialEq)]
pub struct WebConfig {
    pub arg: Argument,
    pub volumes: Vec<Volume>,
    pub mounts: Vec<VolumeMount>,
}

impl WebConfig {
    pub fn file_path(&self) -> &str {
        &self.arg.value
    }
}

pub fn web_config_secret_name(object_name: &str) -> String {
    format!("{object_name}-web-config")
}

fn tls_dir() -> String {
    format!("{WEB_CONFIG_DIR}/tls")
}

pub fn build_web_config(object_name: &str, cpf: &CommonPrometheusFields) -> WebConfig {
    let mut volumes = vec![Volume {
        name: WEB_CONFIG_VOLUME.into(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(web_config_secret_name(object_name)),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let mut mounts = vec![mount(WEB_CONFIG_VOLUME, WEB_CONFIG_DIR, true)];

    if let Some(tls) = cpf.web_tls_config() {
        volumes.push(Volume {
            name: WEB_TLS_VOLUME.into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(tls.secret_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(mount(WEB_TLS_VOLUME, &tls_dir(), true));
    }

    WebConfig {
        arg: Argument::new(
            "web.config.file",
            format!("{WEB_CONFIG_DIR}/{WEB_CONFIG_FILE}"),
        ),
        volumes,
        mounts,
    }
}

#[derive(Serialize)]
struct WebConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_server_config: Option<TlsServerConfig>,
}

#[derive(Serialize)]
struct TlsServerConfig {
    cert_file: String,
    key_file: String,
}

/// Renders the content of the web configuration file.
pub fn render_web_config(cpf: &CommonPrometheusFields) -> Result<String, Error> {
    let file = WebConfigFile {
        tls_server_config: cpf.web_tls_config().map(|_| TlsServerConfig {
            cert_file: format!("{}/tls.crt", tls_dir()),
            key_file: format!("{}/tls.key", tls_dir()),
        }),
    };
    Ok(serde_yaml::to_string(&file)?)
}

/// The Secret mounted by [`build_web_config`].
pub fn make_web_config_secret<P: PrometheusWorkload>(
    resource: &P,
    config: &Config,
) -> Result<Secret, Error> {
    let conventions = &config.label_conventions;
    let name = object_name(resource.mode(), &resource.name_any());
    let labels = merge_labels(
        &config.labels,
        &BTreeMap::from([
            (conventions.name.clone(), resource.name_any()),
            (
                conventions.managed_by.clone(),
                conventions.managed_by_value.clone(),
            ),
        ]),
    );

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(web_config_secret_name(&name)),
            namespace: resource.namespace(),
            labels: Some(labels),
            owner_references: resource.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([(
            WEB_CONFIG_FILE.to_string(),
            render_web_config(&resource.common_fields())?,
        )])),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{WebSpec, WebTlsConfig};

    fn tls_fields() -> CommonPrometheusFields {
        CommonPrometheusFields {
            web: Some(WebSpec {
                tls_config: Some(WebTlsConfig {
                    secret_name: "prom-tls".into(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn plain_web_config() {
        let cpf = CommonPrometheusFields::default();
        let web = build_web_config("prom-agent-main", &cpf);

        assert_eq!(web.file_path(), "/etc/prometheus/web_config/web-config.yaml");
        assert_eq!(web.volumes.len(), 1);
        assert_eq!(
            web.volumes[0].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("prom-agent-main-web-config")
        );
        assert_eq!(render_web_config(&cpf).unwrap().trim(), "{}");
    }

    #[test]
    fn tls_web_config() {
        let cpf = tls_fields();
        let web = build_web_config("prom-agent-main", &cpf);

        assert_eq!(web.volumes.len(), 2);
        assert_eq!(web.mounts[1].mount_path, "/etc/prometheus/web_config/tls");

        let rendered = render_web_config(&cpf).unwrap();
        assert!(rendered.contains("cert_file: /etc/prometheus/web_config/tls/tls.crt"));
        assert!(rendered.contains("key_file: /etc/prometheus/web_config/tls/tls.key"));
    }
}
