//! Detection of where the operator process runs.
//!
//! In-cluster, service DNS names resolve and the RabbitMQ management API can
//! be reached directly. Outside the cluster (e.g. `cargo run` against a
//! kubeconfig) the caller has to open a port-forward tunnel instead.

use std::path::Path;

use thiserror::Error;

/// Namespace file mounted into every pod with a service account.
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Raised when the operator is not running inside a cluster.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("operator is running outside the cluster")]
    RunLocal,
}

/// Namespace the operator runs in, or `RunLocal` when outside the cluster.
pub fn detect_location() -> Result<String, LocationError> {
    detect_location_from(
        Path::new(SERVICE_ACCOUNT_NAMESPACE_FILE),
        std::env::var("POD_NAMESPACE").ok(),
    )
}

/// Detection with explicit inputs: the service-account namespace file wins
/// over the `POD_NAMESPACE` value.
pub fn detect_location_from(
    namespace_file: &Path,
    pod_namespace: Option<String>,
) -> Result<String, LocationError> {
    if let Ok(contents) = std::fs::read_to_string(namespace_file) {
        let namespace = contents.trim();
        if !namespace.is_empty() {
            return Ok(namespace.to_string());
        }
    }

    pod_namespace
        .map(|ns| ns.trim().to_string())
        .filter(|ns| !ns.is_empty())
        .ok_or(LocationError::RunLocal)
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

    #[test]
    fn test_namespace_file_wins() {
        let dir = std::env::temp_dir().join(format!("astarte-location-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("namespace");
        std::fs::write(&file, "astarte-system\n").unwrap();

        assert_eq!(
            detect_location_from(&file, Some("other".to_string())),
            Ok("astarte-system".to_string())
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_pod_namespace_fallback() {
        let missing = Path::new("/nonexistent/serviceaccount/namespace");
        assert_eq!(
            detect_location_from(missing, Some("astarte".to_string())),
            Ok("astarte".to_string())
        );
    }

    #[test]
    fn test_run_local() {
        let missing = Path::new("/nonexistent/serviceaccount/namespace");
        assert_eq!(
            detect_location_from(missing, None),
            Err(LocationError::RunLocal)
        );
        assert_eq!(
            detect_location_from(missing, Some("  ".to_string())),
            Err(LocationError::RunLocal)
        );
    }
}
