//! Strategic merge of operator-generated containers with user overrides.
//!
//! Overrides are expressed as [`ContainerPatch`], where every field except the
//! name is optional: `None` means "keep what the operator generated".

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, ContainerResizePolicy, EnvFromSource, EnvVar, Lifecycle, Probe,
    ResourceRequirements, SecurityContext, VolumeDevice, VolumeMount,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// User-supplied override for a container. Matched against the operator's
/// containers by `name`.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPatch {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<ContainerPort>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_from: Option<Vec<EnvFromSource>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts: Option<Vec<VolumeMount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_devices: Option<Vec<VolumeDevice>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_message_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_message_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize_policy: Option<Vec<ContainerResizePolicy>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin_once: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty: Option<bool>,
}

impl From<ContainerPatch> for Container {
    fn from(patch: ContainerPatch) -> Self {
        Container {
            name: patch.name,
            image: patch.image,
            image_pull_policy: patch.image_pull_policy,
            command: patch.command,
            args: patch.args,
            working_dir: patch.working_dir,
            ports: patch.ports,
            env: patch.env,
            env_from: patch.env_from,
            volume_mounts: patch.volume_mounts,
            volume_devices: patch.volume_devices,
            resources: patch.resources,
            startup_probe: patch.startup_probe,
            readiness_probe: patch.readiness_probe,
            liveness_probe: patch.liveness_probe,
            security_context: patch.security_context,
            termination_message_policy: patch.termination_message_policy,
            termination_message_path: patch.termination_message_path,
            lifecycle: patch.lifecycle,
            resize_policy: patch.resize_policy,
            restart_policy: patch.restart_policy,
            stdin: patch.stdin,
            stdin_once: patch.stdin_once,
            tty: patch.tty,
            ..Default::default()
        }
    }
}

/// Merges `patches` into `base`.
///
/// A patch whose name matches a base container is applied on top of it;
/// the remaining patches are appended, in order, as extra containers.
pub fn merge_patch_containers(
    base: Vec<Container>,
    patches: &[ContainerPatch],
) -> Result<Vec<Container>, Error> {
    let mut seen = BTreeSet::new();
    for patch in patches {
        if patch.name.is_empty() {
            return Err(Error::merge_conflict("", "container name must not be empty"));
        }
        if !seen.insert(patch.name.as_str()) {
            return Err(Error::merge_conflict(
                &patch.name,
                "container is overridden more than once",
            ));
        }
    }

    let base_names: BTreeSet<String> = base.iter().map(|c| c.name.clone()).collect();

    let mut merged = Vec::with_capacity(base.len() + patches.len());
    for container in base {
        match patches.iter().find(|p| p.name == container.name) {
            Some(patch) => merged.push(apply_patch(container, patch)?),
            None => merged.push(container),
        }
    }

    merged.extend(
        patches
            .iter()
            .filter(|p| !base_names.contains(&p.name))
            .cloned()
            .map(Container::from),
    );

    Ok(merged)
}

fn apply_patch(mut container: Container, patch: &ContainerPatch) -> Result<Container, Error> {
    if let Some(ports) = &patch.ports {
        check_reserved_ports(&container, ports)?;
    }

    replace(&mut container.image, &patch.image);
    replace(&mut container.image_pull_policy, &patch.image_pull_policy);
    replace(&mut container.command, &patch.command);
    replace(&mut container.working_dir, &patch.working_dir);
    replace(&mut container.resources, &patch.resources);
    replace(&mut container.startup_probe, &patch.startup_probe);
    replace(&mut container.readiness_probe, &patch.readiness_probe);
    replace(&mut container.liveness_probe, &patch.liveness_probe);
    replace(&mut container.security_context, &patch.security_context);
    replace(
        &mut container.termination_message_policy,
        &patch.termination_message_policy,
    );
    replace(
        &mut container.termination_message_path,
        &patch.termination_message_path,
    );
    replace(&mut container.lifecycle, &patch.lifecycle);
    replace(&mut container.env_from, &patch.env_from);
    replace(&mut container.resize_policy, &patch.resize_policy);
    replace(&mut container.restart_policy, &patch.restart_policy);
    replace(&mut container.stdin, &patch.stdin);
    replace(&mut container.stdin_once, &patch.stdin_once);
    replace(&mut container.tty, &patch.tty);

    merge_keyed(&mut container.args, &patch.args, |a| arg_key(a).to_string());
    merge_keyed(&mut container.ports, &patch.ports, |p| p.container_port);
    merge_keyed(&mut container.env, &patch.env, |e| e.name.clone());
    merge_keyed(&mut container.volume_mounts, &patch.volume_mounts, |m| {
        m.mount_path.clone()
    });
    merge_keyed(&mut container.volume_devices, &patch.volume_devices, |d| {
        d.device_path.clone()
    });

    Ok(container)
}

fn replace<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
    if let Some(value) = value {
        *target = Some(value.clone());
    }
}

/// Entries of `patch` replace the entry with the same key in place; entries
/// with new keys are appended in their original order.
fn merge_keyed<T, K, F>(target: &mut Option<Vec<T>>, patch: &Option<Vec<T>>, key: F)
where
    T: Clone,
    K: PartialEq,
    F: Fn(&T) -> K,
{
    let Some(patch) = patch else {
        return;
    };
    let items = target.get_or_insert_with(Vec::new);
    for entry in patch {
        let k = key(entry);
        match items.iter_mut().find(|existing| key(&**existing) == k) {
            Some(existing) => *existing = entry.clone(),
            None => items.push(entry.clone()),
        }
    }
}

/// `--flag=value` is keyed by `--flag`; anything else by its full text.
fn arg_key(arg: &str) -> &str {
    if arg.starts_with('-') {
        arg.split_once('=').map(|(flag, _)| flag).unwrap_or(arg)
    } else {
        arg
    }
}

/// Named ports are referenced by probes and services, so a patch may not move
/// an operator port name to another port number, nor rename or unname an
/// operator port.
fn check_reserved_ports(container: &Container, patch_ports: &[ContainerPort]) -> Result<(), Error> {
    let Some(ports) = &container.ports else {
        return Ok(());
    };

    for owned in ports {
        for port in patch_ports {
            let same_name = owned.name.is_some() && owned.name == port.name;
            let same_number = owned.container_port == port.container_port;

            if same_name && !same_number {
                return Err(Error::merge_conflict(
                    &container.name,
                    format!(
                        "port '{}' is reserved for container port {}",
                        owned.name.as_deref().unwrap_or_default(),
                        owned.container_port
                    ),
                ));
            }
            if same_number && owned.name.is_some() && !same_name {
                return Err(Error::merge_conflict(
                    &container.name,
                    format!(
                        "container port {} is reserved under the name '{}'",
                        owned.container_port,
                        owned.name.as_deref().unwrap_or_default()
                    ),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(name: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(format!("{name}:v1")),
            ..Default::default()
        }
    }

    fn patch(name: &str) -> ContainerPatch {
        ContainerPatch {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn names(containers: &[Container]) -> Vec<&str> {
        containers.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn disjoint_lists_keep_both_sides_in_order() {
        let base = vec![container("prometheus"), container("config-reloader")];
        let patches = vec![patch("oauth-proxy"), patch("thanos-sidecar")];

        let merged = merge_patch_containers(base, &patches).unwrap();

        assert_eq!(
            names(&merged),
            vec!["prometheus", "config-reloader", "oauth-proxy", "thanos-sidecar"]
        );
    }

    #[test]
    fn set_fields_win_and_unset_fields_are_inherited() {
        let mut base = container("prometheus");
        base.image_pull_policy = Some("IfNotPresent".into());
        base.termination_message_policy = Some("FallbackToLogsOnError".into());

        let mut p = patch("prometheus");
        p.image = Some("example.com/prometheus:custom".into());

        let merged = merge_patch_containers(vec![base], &[p]).unwrap();

        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged[0].image.as_deref(),
            Some("example.com/prometheus:custom")
        );
        assert_eq!(merged[0].image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(
            merged[0].termination_message_policy.as_deref(),
            Some("FallbackToLogsOnError")
        );
    }

    #[test]
    fn keyed_lists_are_merged() {
        let mut base = container("prometheus");
        base.args = Some(vec![
            "--config.file=/etc/prometheus/config_out/prometheus.env.yaml".into(),
            "--log.level=info".into(),
        ]);
        base.env = Some(vec![EnvVar {
            name: "A".into(),
            value: Some("1".into()),
            ..Default::default()
        }]);
        base.volume_mounts = Some(vec![VolumeMount {
            name: "config-out".into(),
            mount_path: "/etc/prometheus/config_out".into(),
            read_only: Some(true),
            ..Default::default()
        }]);

        let mut p = patch("prometheus");
        p.args = Some(vec!["--log.level=debug".into(), "--web.enable-admin-api".into()]);
        p.env = Some(vec![
            EnvVar {
                name: "A".into(),
                value: Some("2".into()),
                ..Default::default()
            },
            EnvVar {
                name: "B".into(),
                value: Some("3".into()),
                ..Default::default()
            },
        ]);
        p.volume_mounts = Some(vec![VolumeMount {
            name: "extra".into(),
            mount_path: "/extra".into(),
            ..Default::default()
        }]);

        let merged = merge_patch_containers(vec![base], &[p]).unwrap();
        let c = &merged[0];

        assert_eq!(
            c.args.as_deref().unwrap(),
            &[
                "--config.file=/etc/prometheus/config_out/prometheus.env.yaml".to_string(),
                "--log.level=debug".to_string(),
                "--web.enable-admin-api".to_string(),
            ]
        );
        let env = c.env.as_deref().unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env[0].value.as_deref(), Some("2"));
        assert_eq!(env[1].name, "B");
        let mounts = c.volume_mounts.as_deref().unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[1].mount_path, "/extra");
    }

    #[test]
    fn patch_without_lists_leaves_lists_alone() {
        let mut base = container("prometheus");
        base.args = Some(vec!["--a".into()]);
        let merged = merge_patch_containers(vec![base], &[patch("prometheus")]).unwrap();
        assert_eq!(merged[0].args.as_deref().unwrap(), &["--a".to_string()]);
    }

    #[test]
    fn duplicate_override_is_rejected() {
        let err = merge_patch_containers(
            vec![container("prometheus")],
            &[patch("prometheus"), patch("prometheus")],
        )
        .unwrap_err();
        assert!(matches!(err, Error::MergeConflict { container, .. } if container == "prometheus"));
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = merge_patch_containers(vec![container("prometheus")], &[patch("")]).unwrap_err();
        assert!(matches!(err, Error::MergeConflict { .. }));
    }

    #[test]
    fn reserved_port_name_cannot_move() {
        let mut base = container("prometheus");
        base.ports = Some(vec![ContainerPort {
            name: Some("web".into()),
            container_port: 9090,
            ..Default::default()
        }]);

        let mut p = patch("prometheus");
        p.ports = Some(vec![ContainerPort {
            name: Some("web".into()),
            container_port: 8080,
            ..Default::default()
        }]);

        let err = merge_patch_containers(vec![base.clone()], &[p]).unwrap_err();
        assert!(err.to_string().contains("reserved"));

        let mut p = patch("prometheus");
        p.ports = Some(vec![ContainerPort {
            name: Some("metrics".into()),
            container_port: 9091,
            ..Default::default()
        }]);
        let merged = merge_patch_containers(vec![base], &[p]).unwrap();
        assert_eq!(merged[0].ports.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn unnamed_port_cannot_take_a_named_port_number() {
        let mut base = container("prometheus");
        base.ports = Some(vec![ContainerPort {
            name: Some("web".into()),
            container_port: 9090,
            protocol: Some("TCP".into()),
            ..Default::default()
        }]);

        let mut p = patch("prometheus");
        p.ports = Some(vec![ContainerPort {
            name: None,
            container_port: 9090,
            protocol: Some("TCP".into()),
            ..Default::default()
        }]);

        let err = merge_patch_containers(vec![base], &[p]).unwrap_err();
        assert!(matches!(err, Error::MergeConflict { ref container, .. } if container == "prometheus"));
        assert!(err.to_string().contains("reserved under the name 'web'"));
    }

    #[test]
    fn appended_containers_keep_every_field() {
        let sidecar: ContainerPatch = serde_json::from_value(serde_json::json!({
            "name": "oauth-proxy",
            "image": "quay.io/oauth2-proxy/oauth2-proxy:v7.5.1",
            "envFrom": [{ "secretRef": { "name": "oauth-proxy-env" } }],
            "lifecycle": { "preStop": { "exec": { "command": ["sleep", "5"] } } },
            "restartPolicy": "Always",
            "stdin": true,
            "tty": true,
            "terminationMessagePath": "/dev/termination-log",
            "volumeDevices": [{ "name": "raw", "devicePath": "/dev/xvda" }],
        }))
        .unwrap();

        let merged = merge_patch_containers(vec![container("prometheus")], &[sidecar]).unwrap();
        let c = &merged[1];

        assert_eq!(c.name, "oauth-proxy");
        let env_from = c.env_from.as_deref().unwrap();
        assert_eq!(env_from[0].secret_ref.as_ref().unwrap().name, "oauth-proxy-env");
        let pre_stop = c.lifecycle.as_ref().unwrap().pre_stop.as_ref().unwrap();
        assert_eq!(
            pre_stop.exec.as_ref().unwrap().command.as_deref().unwrap(),
            &["sleep".to_string(), "5".to_string()]
        );
        assert_eq!(c.restart_policy.as_deref(), Some("Always"));
        assert_eq!(c.stdin, Some(true));
        assert_eq!(c.tty, Some(true));
        assert_eq!(c.termination_message_path.as_deref(), Some("/dev/termination-log"));
        assert_eq!(c.volume_devices.as_ref().unwrap()[0].device_path, "/dev/xvda");
    }

    #[test]
    fn overrides_set_lifecycle_and_env_from() {
        let mut base = container("prometheus");
        base.env_from = Some(vec![EnvFromSource {
            prefix: Some("OLD_".into()),
            ..Default::default()
        }]);

        let mut p = patch("prometheus");
        p.lifecycle = Some(Lifecycle::default());
        p.env_from = Some(vec![EnvFromSource {
            prefix: Some("NEW_".into()),
            ..Default::default()
        }]);

        let merged = merge_patch_containers(vec![base], &[p]).unwrap();
        let c = &merged[0];
        assert!(c.lifecycle.is_some());
        let env_from = c.env_from.as_deref().unwrap();
        assert_eq!(env_from.len(), 1);
        assert_eq!(env_from[0].prefix.as_deref(), Some("NEW_"));
        assert_eq!(c.image.as_deref(), Some("prometheus:v1"));
    }
}
