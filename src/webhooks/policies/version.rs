//! Version validation policy.
//!
//! Tier 1 (Critical): Always enforced
//!
//! Validates:
//! - `spec.version` is a semantic version or the snapshot sentinel
//! - The version can be managed by this operator build

use super::{ValidationContext, ValidationResult};
use crate::controller::version::{
    AstarteVersion, SUPPORTED_VERSION_RANGE, is_manageable, operator_version,
};

/// Validate `spec.version`
pub fn validate(ctx: &ValidationContext<'_>) -> ValidationResult {
    let raw = ctx.resource.spec.version.as_str();

    let version = match AstarteVersion::parse(raw) {
        Ok(version) => version,
        Err(e) => {
            return ValidationResult::denied(
                "InvalidVersion",
                &format!("spec.version {:?} is not a valid version: {}", raw, e),
            );
        }
    };

    if !is_manageable(&version) {
        let message = if version.is_snapshot() {
            format!(
                "snapshot versions can only be managed by prerelease operator builds (this is {})",
                operator_version()
            )
        } else {
            format!(
                "spec.version {} is outside the supported range {}",
                version, SUPPORTED_VERSION_RANGE
            )
        };
        return ValidationResult::denied("UnsupportedVersion", &message);
    }

    ValidationResult::allowed()
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;
    use crate::crd::{Astarte, AstarteSpec};

    fn create_resource(version: &str) -> Astarte {
        let mut astarte = Astarte::new(
            "astarte",
            AstarteSpec {
                version: version.to_string(),
                ..Default::default()
            },
        );
        astarte.metadata.namespace = Some("default".to_string());
        astarte
    }

    fn validate_version(version: &str) -> ValidationResult {
        let resource = create_resource(version);
        let ctx = ValidationContext {
            resource: &resource,
            old_resource: None,
        };
        validate(&ctx)
    }

    #[test]
    fn test_supported_versions_allowed() {
        for version in ["0.10.0", "0.11.4", "1.0.0", "1.0.3-rc.1"] {
            assert!(validate_version(version).allowed, "{version} rejected");
        }
    }

    #[test]
    fn test_malformed_version_denied() {
        let result = validate_version("one point oh");
        assert!(!result.allowed);
        assert_eq!(result.reason.unwrap(), "InvalidVersion");
    }

    #[test]
    fn test_out_of_range_denied() {
        for version in ["0.9.9", "1.1.0", "2.0.0"] {
            let result = validate_version(version);
            assert!(!result.allowed, "{version} allowed");
            assert_eq!(result.reason.unwrap(), "UnsupportedVersion");
        }
    }

    #[test]
    fn test_snapshot_follows_operator_build() {
        let result = validate_version("snapshot");
        assert_eq!(result.allowed, !operator_version().pre.is_empty());
    }
}
