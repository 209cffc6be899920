use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, EmptyDirVolumeSource, ProjectedVolumeSource, SecretProjection,
    SecretVolumeSource, Volume, VolumeMount, VolumeProjection,
};

use crate::{
    consts::{
        CONFIG_DIR, CONFIG_MAPS_DIR, CONFIG_OUT_DIR, RULES_DIR, SECRETS_DIR, STORAGE_DIR,
        TLS_ASSETS_DIR,
    },
    crd::CommonPrometheusFields,
};

pub const CONFIG_VOLUME: &str = "config";
pub const CONFIG_OUT_VOLUME: &str = "config-out";
pub const TLS_ASSETS_VOLUME: &str = "tls-assets";

const MAX_VOLUME_NAME_LENGTH: usize = 63;

/// TLS material produced by the secret sharding logic, mounted as a single
/// projected volume.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsAssets {
    secret_names: Vec<String>,
}

impl TlsAssets {
    pub fn new(secret_names: Vec<String>) -> Self {
        Self { secret_names }
    }

    pub fn volume(&self, name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(
                    self.secret_names
                        .iter()
                        .map(|secret| VolumeProjection {
                            secret: Some(SecretProjection {
                                name: secret.clone(),
                                optional: Some(true),
                                ..Default::default()
                            }),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Volumes shared by every workload shape, with the mounts of the Prometheus
/// container and of the config-reloader sidecar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommonVolumes {
    pub volumes: Vec<Volume>,
    pub prometheus_mounts: Vec<VolumeMount>,
    pub reloader_mounts: Vec<VolumeMount>,
    /// Directories the sidecar watches for changes besides the config file.
    pub watched_dirs: Vec<String>,
}

pub struct VolumeInputs<'a> {
    /// Name prefix of the generated objects, e.g. `prometheus-main`.
    pub object_name: &'a str,
    pub cpf: &'a CommonPrometheusFields,
    pub tls_assets: &'a TlsAssets,
    pub rule_config_maps: &'a [String],
    /// Name of the volume claim template providing the storage volume, if any.
    pub claim_name: Option<&'a str>,
}

pub fn build_common_volumes(inputs: &VolumeInputs<'_>) -> CommonVolumes {
    let VolumeInputs {
        object_name,
        cpf,
        tls_assets,
        rule_config_maps,
        claim_name,
    } = *inputs;

    let mut out = CommonVolumes::default();

    out.volumes.push(Volume {
        name: CONFIG_VOLUME.into(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(object_name.to_string()),
            optional: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    });
    out.volumes.push(tls_assets.volume(TLS_ASSETS_VOLUME));
    out.volumes.push(Volume {
        name: CONFIG_OUT_VOLUME.into(),
        empty_dir: Some(EmptyDirVolumeSource {
            // tmpfs: the rendered configuration may hold credentials.
            medium: Some("Memory".into()),
            ..Default::default()
        }),
        ..Default::default()
    });

    out.prometheus_mounts.push(mount(CONFIG_OUT_VOLUME, CONFIG_OUT_DIR, true));
    out.prometheus_mounts.push(mount(TLS_ASSETS_VOLUME, TLS_ASSETS_DIR, true));
    out.reloader_mounts.push(mount(CONFIG_VOLUME, CONFIG_DIR, false));
    out.reloader_mounts.push(mount(CONFIG_OUT_VOLUME, CONFIG_OUT_DIR, false));

    for (index, config_map) in rule_config_maps.iter().enumerate() {
        let volume = rule_volume_name(index);
        let path = format!("{RULES_DIR}/{config_map}");
        out.volumes.push(config_map_volume(&volume, config_map));
        out.prometheus_mounts.push(mount(&volume, &path, false));
        out.reloader_mounts.push(mount(&volume, &path, false));
        out.watched_dirs.push(path);
    }

    for secret in &cpf.secrets {
        let volume = sanitize_volume_name(&format!("secret-{secret}"));
        out.volumes.push(Volume {
            name: volume.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        out.prometheus_mounts
            .push(mount(&volume, &format!("{SECRETS_DIR}/{secret}"), true));
    }

    for config_map in &cpf.config_maps {
        let volume = sanitize_volume_name(&format!("configmap-{config_map}"));
        out.volumes.push(config_map_volume(&volume, config_map));
        out.prometheus_mounts.push(mount(
            &volume,
            &format!("{CONFIG_MAPS_DIR}/{config_map}"),
            true,
        ));
    }

    let storage_volume = match claim_name {
        Some(claim) => claim.to_string(),
        None => storage_volume_name(object_name),
    };
    if claim_name.is_none() {
        let empty_dir = cpf
            .storage
            .as_ref()
            .and_then(|storage| storage.empty_dir.clone())
            .unwrap_or_default();
        out.volumes.push(Volume {
            name: storage_volume.clone(),
            empty_dir: Some(empty_dir),
            ..Default::default()
        });
    }
    out.prometheus_mounts
        .push(mount(&storage_volume, STORAGE_DIR, false));

    out.volumes.extend(cpf.volumes.iter().cloned());
    out.prometheus_mounts
        .extend(cpf.volume_mounts.iter().cloned());

    out
}

/// Rule ConfigMap names embed the resource name and may exceed the volume name
/// length limit, so their volumes are named after the ConfigMap index.
pub fn rule_volume_name(index: usize) -> String {
    format!("rules-configmap-{index}")
}

pub fn storage_volume_name(object_name: &str) -> String {
    sanitize_volume_name(&format!("{object_name}-db"))
}

pub fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn config_map_volume(volume: &str, config_map: &str) -> Volume {
    Volume {
        name: volume.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Turns an arbitrary string into a valid DNS-1123 label usable as a volume
/// name.
pub fn sanitize_volume_name(name: &str) -> String {
    let sanitized: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(MAX_VOLUME_NAME_LENGTH)
        .collect();
    sanitized.trim_matches('-').to_string()
}
