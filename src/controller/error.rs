//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior and for
//! the remediation surfaced to users (automatic retry vs manual intervention).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::controller::upgrade_steps::StepKind;
use crate::controller::version::VersionError;
use crate::resources::port_forward::PortForwardError;

/// What a user should expect after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    /// The operator will retry on its own.
    AutomaticRetry,
    /// Retrying will not help until someone looks at the cluster.
    ManualIntervention,
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remediation::AutomaticRetry => write!(f, "will retry automatically"),
            Remediation::ManualIntervention => write!(f, "manual intervention likely required"),
        }
    }
}

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Malformed version string or constraint
    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] VersionError),

    /// Version outside what this operator build can manage
    #[error("Unsupported Astarte version: {0}")]
    UnsupportedVersion(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Port-forward tunnel error
    #[error("Port forward error: {0}")]
    PortForward(#[from] PortForwardError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A step of a version-transition procedure failed
    #[error("Upgrade {transition} failed at step {step}: {reason}")]
    UpgradeStep {
        transition: String,
        step: StepKind,
        reason: String,
        remediation: Remediation,
    },
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::PortForward(_) | Error::Http(_) => true,
            Error::UpgradeStep { remediation, .. } => {
                *remediation == Remediation::AutomaticRetry
            }
            Error::Validation(_)
            | Error::MissingField(_)
            | Error::InvalidVersion(_)
            | Error::UnsupportedVersion(_) => false,
            Error::Serialization(_) => false,
        }
    }

    /// What the user should expect after this error.
    pub fn remediation(&self) -> Remediation {
        match self {
            Error::UpgradeStep { remediation, .. } => *remediation,
            Error::Kube(_) => Remediation::AutomaticRetry,
            _ if self.is_retryable() => Remediation::AutomaticRetry,
            _ => Remediation::ManualIntervention,
        }
    }

    /// Message suitable for status and events.
    pub fn user_message(&self) -> String {
        format!("{} ({})", self, self.remediation())
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            // Spec errors need a user edit, which triggers a new reconcile anyway
            Duration::from_secs(300)
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "injected".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code,
        }))
    }

    #[test]
    fn test_server_errors_are_retryable() {
        let err = api_error(503);
        assert!(err.is_retryable());
        assert_eq!(err.remediation(), Remediation::AutomaticRetry);
        assert_eq!(err.requeue_after(), Duration::from_secs(30));

        assert!(api_error(429).is_retryable());
        assert!(!api_error(422).is_retryable());
        assert!(api_error(404).is_not_found());
    }

    #[test]
    fn test_invalid_version_needs_intervention() {
        let err = Error::InvalidVersion(VersionError::InvalidVersion {
            version: "latest".to_string(),
            reason: "unexpected character".to_string(),
        });
        assert!(!err.is_retryable());
        assert_eq!(err.remediation(), Remediation::ManualIntervention);
        assert!(err.user_message().ends_with("(manual intervention likely required)"));
    }

    #[test]
    fn test_upgrade_step_remediation() {
        let err = Error::UpgradeStep {
            transition: "0.10→0.11".to_string(),
            step: StepKind::MigrateBackingStore,
            reason: "container is crash looping".to_string(),
            remediation: Remediation::ManualIntervention,
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("MigrateBackingStore"));

        let err = Error::UpgradeStep {
            transition: "0.10→0.11".to_string(),
            step: StepKind::ShutdownBroker,
            reason: "timed out".to_string(),
            remediation: Remediation::AutomaticRetry,
        };
        assert!(err.is_retryable());
        assert!(err.user_message().ends_with("(will retry automatically)"));
    }
}
