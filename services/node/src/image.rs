//! Image reference resolution.
//!
//! Containers here are installed packages rather than OCI images, so a
//! declared image reference has to be mapped to a package coordinate before
//! anything can be installed. Two schemes are recognised:
//!
//! - `mvn:group/artifact/version[/packaging[/classifier]]`, taken as-is
//! - docker-style `[namespace/]name[:tag]`, mapped under a group prefix
//!
//! Digest pins and registry-qualified references have no package equivalent
//! and are rejected.

use std::fmt;

use thiserror::Error;

/// Default group prefix for docker-style references.
pub const DEFAULT_GROUP_PREFIX: &str = "io.podlet.images";

/// Namespace used when a docker-style reference has none.
const DEFAULT_NAMESPACE: &str = "library";

/// Errors from image resolution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("image reference is empty")]
    Empty,

    #[error("unrecognized image reference '{reference}': {reason}")]
    Unrecognized { reference: String, reason: String },
}

impl ResolutionError {
    fn unrecognized(reference: &str, reason: impl Into<String>) -> Self {
        Self::Unrecognized {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }
}

/// Coordinates of an installable package.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageCoordinate {
    pub group_id: String,
    pub artifact_id: String,
    pub version: String,
    pub packaging: String,
    pub classifier: Option<String>,
}

impl fmt::Display for PackageCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mvn:{}/{}/{}/{}",
            self.group_id, self.artifact_id, self.version, self.packaging
        )?;
        if let Some(classifier) = &self.classifier {
            write!(f, "/{classifier}")?;
        }
        Ok(())
    }
}

/// Maps image references to package coordinates.
pub trait ImageResolver: Send + Sync {
    fn resolve(&self, image: &str) -> Result<PackageCoordinate, ResolutionError>;
}

/// Resolver for the `mvn:` and docker-style schemes.
#[derive(Debug, Clone)]
pub struct DefaultImageResolver {
    group_prefix: String,
}

impl DefaultImageResolver {
    pub fn new(group_prefix: impl Into<String>) -> Self {
        Self {
            group_prefix: group_prefix.into(),
        }
    }

    fn resolve_mvn(&self, reference: &str, body: &str) -> Result<PackageCoordinate, ResolutionError> {
        let parts: Vec<&str> = body.split('/').collect();
        if !(3..=5).contains(&parts.len()) {
            return Err(ResolutionError::unrecognized(
                reference,
                "expected mvn:group/artifact/version[/packaging[/classifier]]",
            ));
        }
        if parts.iter().any(|p| !is_valid_segment(p)) {
            return Err(ResolutionError::unrecognized(reference, "empty or invalid segment"));
        }

        Ok(PackageCoordinate {
            group_id: parts[0].to_string(),
            artifact_id: parts[1].to_string(),
            version: parts[2].to_string(),
            packaging: parts.get(3).copied().unwrap_or("zip").to_string(),
            classifier: parts.get(4).map(|c| c.to_string()),
        })
    }

    fn resolve_docker(&self, reference: &str) -> Result<PackageCoordinate, ResolutionError> {
        if reference.contains('@') {
            return Err(ResolutionError::unrecognized(
                reference,
                "digest references are not supported",
            ));
        }

        let (path, tag) = match reference.rsplit_once(':') {
            Some((path, tag)) => (path, tag),
            None => (reference, "latest"),
        };

        let segments: Vec<&str> = path.split('/').collect();
        let (namespace, name) = match segments.as_slice() {
            [name] => (DEFAULT_NAMESPACE, *name),
            [namespace, name] => (*namespace, *name),
            _ => {
                return Err(ResolutionError::unrecognized(
                    reference,
                    "registry-qualified references are not supported",
                ))
            }
        };

        if ![namespace, name, tag].iter().all(|s| is_valid_segment(s)) {
            return Err(ResolutionError::unrecognized(reference, "empty or invalid segment"));
        }

        Ok(PackageCoordinate {
            group_id: format!("{}.{}", self.group_prefix, namespace),
            artifact_id: name.to_string(),
            version: tag.to_string(),
            packaging: "zip".to_string(),
            classifier: Some("image".to_string()),
        })
    }
}

impl Default for DefaultImageResolver {
    fn default() -> Self {
        Self::new(DEFAULT_GROUP_PREFIX)
    }
}

impl ImageResolver for DefaultImageResolver {
    fn resolve(&self, image: &str) -> Result<PackageCoordinate, ResolutionError> {
        if image.is_empty() {
            return Err(ResolutionError::Empty);
        }
        if image.chars().any(char::is_whitespace) {
            return Err(ResolutionError::unrecognized(image, "contains whitespace"));
        }

        match image.strip_prefix("mvn:") {
            Some(body) => self.resolve_mvn(image, body),
            None => self.resolve_docker(image),
        }
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_reference_with_namespace_and_tag() {
        let coord = DefaultImageResolver::default()
            .resolve("acme/web:1.2.0")
            .unwrap();
        assert_eq!(coord.group_id, "io.podlet.images.acme");
        assert_eq!(coord.artifact_id, "web");
        assert_eq!(coord.version, "1.2.0");
        assert_eq!(
            coord.to_string(),
            "mvn:io.podlet.images.acme/web/1.2.0/zip/image"
        );
    }

    #[test]
    fn test_docker_reference_defaults() {
        let coord = DefaultImageResolver::new("org.example").resolve("redis").unwrap();
        assert_eq!(coord.group_id, "org.example.library");
        assert_eq!(coord.version, "latest");
    }

    #[test]
    fn test_mvn_reference_passthrough() {
        let coord = DefaultImageResolver::default()
            .resolve("mvn:org.acme/gateway/2.0/tar.gz")
            .unwrap();
        assert_eq!(coord.group_id, "org.acme");
        assert_eq!(coord.packaging, "tar.gz");
        assert!(coord.classifier.is_none());
        assert_eq!(coord.to_string(), "mvn:org.acme/gateway/2.0/tar.gz");
    }

    #[test]
    fn test_rejected_references() {
        let resolver = DefaultImageResolver::default();
        assert_eq!(resolver.resolve(""), Err(ResolutionError::Empty));

        for bad in [
            "ghcr.io/acme/web:1",
            "acme/web@sha256:abcd",
            "acme/ web",
            "mvn:org.acme/gateway",
            "acme//web",
            "acme/web:",
        ] {
            assert!(
                matches!(resolver.resolve(bad), Err(ResolutionError::Unrecognized { .. })),
                "{bad} should be rejected"
            );
        }
    }
}
