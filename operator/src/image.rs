use crate::{
    crd::Mode,
    error::Error,
    version::{Version, VersionGate},
};

/// Oldest Prometheus release that can run in agent mode.
pub const AGENT_MINIMUM_VERSION: Version = Version::new(2, 32, 0);

/// Returns the image to run: the pinned image when set, otherwise
/// `<base_image>:<version>`.
pub fn resolve_image(
    pinned: Option<&str>,
    base_image: &str,
    version: &str,
    mode: Mode,
) -> Result<String, Error> {
    if let Some(image) = pinned.filter(|image| !image.trim().is_empty()) {
        return Ok(image.to_string());
    }

    validate_tag(version)?;

    if mode == Mode::Agent {
        let gate = VersionGate::new(version).with_minimum_version(AGENT_MINIMUM_VERSION);
        if gate.current().is_some() && !gate.is_compatible() {
            return Err(Error::ImageResolution(format!(
                "Prometheus {version} does not support agent mode (minimum {AGENT_MINIMUM_VERSION})"
            )));
        }
    }

    Ok(format!("{base_image}:{version}"))
}

/// Checks the version against the OCI tag grammar `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
fn validate_tag(version: &str) -> Result<(), Error> {
    let mut chars = version.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphanumeric() || first == '_')
                && version.len() <= 128
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(Error::ImageResolution(format!(
            "invalid version {version:?}: not a valid image tag"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "quay.io/prometheus/prometheus";

    #[test]
    fn pinned_image_wins() {
        let image =
            resolve_image(Some("example.com/prom:dev"), BASE, "not a tag", Mode::Agent).unwrap();
        assert_eq!(image, "example.com/prom:dev");
    }

    #[test]
    fn composes_base_and_version() {
        let image = resolve_image(None, BASE, "v2.45.0", Mode::Server).unwrap();
        assert_eq!(image, "quay.io/prometheus/prometheus:v2.45.0");

        let image = resolve_image(Some(""), BASE, "v2.45.0", Mode::Agent).unwrap();
        assert_eq!(image, "quay.io/prometheus/prometheus:v2.45.0");
    }

    #[test]
    fn malformed_version_fails() {
        for version in ["", "v2.45.0 ", "-v2", "v2:45", "v2@sha"] {
            let err = resolve_image(None, BASE, version, Mode::Server).unwrap_err();
            assert!(matches!(err, Error::ImageResolution(_)), "{version:?}");
        }
    }

    #[test]
    fn agent_requires_minimum_version() {
        let err = resolve_image(None, BASE, "v2.31.0", Mode::Agent).unwrap_err();
        assert!(err.to_string().contains("agent mode"));

        assert!(resolve_image(None, BASE, "v2.31.0", Mode::Server).is_ok());
        // Unparsable but valid tags are accepted as-is.
        assert!(resolve_image(None, BASE, "main", Mode::Agent).is_ok());
    }
}
