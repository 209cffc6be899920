use k8s_openapi::{
    api::core::v1::{ExecAction, HTTPGetAction, Probe},
    apimachinery::pkg::util::intstr::IntOrString,
};

use crate::{
    consts::{PROMETHEUS_PORT, join_route},
    crd::CommonPrometheusFields,
};

const PROBE_TIMEOUT_SECONDS: i32 = 3;

// Replaying a large WAL can take a long time: allow 15 minutes (15s x 60)
// before the startup probe gives up.
const STARTUP_PERIOD_SECONDS: i32 = 15;
const STARTUP_FAILURE_THRESHOLD: i32 = 60;

const READINESS_PERIOD_SECONDS: i32 = 5;
const READINESS_FAILURE_THRESHOLD: i32 = 3;

const LIVENESS_PERIOD_SECONDS: i32 = 5;
const LIVENESS_FAILURE_THRESHOLD: i32 = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct Probes {
    pub startup: Probe,
    pub readiness: Probe,
    pub liveness: Probe,
}

/// Builds the probes of the Prometheus container.
///
/// Startup and readiness target `/-/ready` (positive once the WAL has been
/// replayed), liveness targets `/-/healthy` (positive as soon as the server
/// listens). When Prometheus only listens on the loopback interface the
/// kubelet can't reach it, so the probes shell out to curl/wget from inside
/// the container instead.
pub fn make_probes(cpf: &CommonPrometheusFields, scheme: &str, local_host: &str) -> Probes {
    let prefix = cpf.web_route_prefix();
    let handler = |path: &str| -> Probe {
        let path = join_route(prefix, path);
        if cpf.listen_local {
            let url = format!(
                "{}://{local_host}:{PROMETHEUS_PORT}{path}",
                scheme.to_ascii_lowercase()
            );
            Probe {
                exec: Some(ExecAction {
                    command: Some(vec!["sh".into(), "-c".into(), probe_script(&url)]),
                }),
                ..Default::default()
            }
        } else {
            Probe {
                http_get: Some(HTTPGetAction {
                    path: Some(path),
                    port: IntOrString::String(cpf.port_name.clone()),
                    scheme: Some(scheme.to_ascii_uppercase()),
                    ..Default::default()
                }),
                ..Default::default()
            }
        }
    };

    Probes {
        startup: Probe {
            timeout_seconds: Some(PROBE_TIMEOUT_SECONDS),
            period_seconds: Some(STARTUP_PERIOD_SECONDS),
            failure_threshold: Some(STARTUP_FAILURE_THRESHOLD),
            ..handler("/-/ready")
        },
        readiness: Probe {
            timeout_seconds: Some(PROBE_TIMEOUT_SECONDS),
            period_seconds: Some(READINESS_PERIOD_SECONDS),
            failure_threshold: Some(READINESS_FAILURE_THRESHOLD),
            ..handler("/-/ready")
        },
        liveness: Probe {
            timeout_seconds: Some(PROBE_TIMEOUT_SECONDS),
            period_seconds: Some(LIVENESS_PERIOD_SECONDS),
            failure_threshold: Some(LIVENESS_FAILURE_THRESHOLD),
            ..handler("/-/healthy")
        },
    }
}

fn probe_script(url: &str) -> String {
    format!(
        r#"if [ -x "$(command -v curl)" ]; then exec curl --fail {url}; elif [ -x "$(command -v wget)" ]; then exec wget -q -O /dev/null {url}; else exit 1; fi"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> CommonPrometheusFields {
        CommonPrometheusFields {
            port_name: "web".into(),
            ..Default::default()
        }
    }

    #[test]
    fn http_probes_target_distinct_endpoints() {
        let probes = make_probes(&fields(), "http", "localhost");

        let path = |p: &Probe| p.http_get.as_ref().unwrap().path.clone().unwrap();
        assert_eq!(path(&probes.readiness), "/-/ready");
        assert_eq!(path(&probes.liveness), "/-/healthy");
        assert_eq!(path(&probes.startup), "/-/ready");
        assert_eq!(
            probes.readiness.http_get.as_ref().unwrap().port,
            IntOrString::String("web".into())
        );
        assert_eq!(
            probes.readiness.http_get.as_ref().unwrap().scheme.as_deref(),
            Some("HTTP")
        );
    }

    #[test]
    fn startup_is_far_more_tolerant_than_steady_state() {
        let probes = make_probes(&fields(), "http", "localhost");

        let budget = |p: &Probe| p.period_seconds.unwrap() * p.failure_threshold.unwrap();
        assert_eq!(budget(&probes.startup), 15 * 60);
        assert!(probes.readiness.period_seconds.unwrap() < 10);
        assert!(probes.liveness.period_seconds.unwrap() < 10);
        assert!(budget(&probes.readiness) < 60);
        assert!(budget(&probes.liveness) < 60);
    }

    #[test]
    fn route_prefix_and_tls_are_honored() {
        let cpf = CommonPrometheusFields {
            route_prefix: Some("/prometheus/".into()),
            ..fields()
        };
        let probes = make_probes(&cpf, "https", "localhost");
        let get = probes.readiness.http_get.unwrap();
        assert_eq!(get.path.as_deref(), Some("/prometheus/-/ready"));
        assert_eq!(get.scheme.as_deref(), Some("HTTPS"));
    }

    #[test]
    fn listen_local_uses_exec_probes() {
        let cpf = CommonPrometheusFields {
            listen_local: true,
            ..fields()
        };
        let probes = make_probes(&cpf, "http", "localhost");

        assert!(probes.liveness.http_get.is_none());
        let command = probes.liveness.exec.unwrap().command.unwrap();
        assert_eq!(command[0], "sh");
        assert!(command[2].contains("http://localhost:9090/-/healthy"));
    }
}
