//! Process-level configuration read from the environment.
//!
//! Per-installation settings live in the `Astarte` spec; this covers only
//! what the operator process itself needs: its identity for leader election,
//! the namespace it holds the lease in, and an optional namespace scope.

use std::path::Path;
use std::time::Duration;

use tracing::warn;

use crate::webhooks::{WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH};

/// Pod name, used as the lease holder identity
pub const POD_NAME_ENV: &str = "POD_NAME";

/// Namespace the operator runs in, where the lease lives
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";

/// Environment variable restricting the controller to one namespace
pub const WATCH_NAMESPACE_ENV: &str = "WATCH_NAMESPACE";

/// Name of the leader election Lease
pub const LEASE_NAME: &str = "astarte-operator-leader";

/// Leader election timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTiming {
    pub ttl: Duration,
    pub renew_interval: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
        }
    }
}

/// Configuration of the operator process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Lease holder identity.
    pub holder_id: String,
    /// Namespace holding the lease.
    pub lease_namespace: String,
    /// Only reconcile Astarte resources in this namespace.
    pub watch_namespace: Option<String>,
    pub lease: LeaseTiming,
    /// Time given to in-flight reconciliations on shutdown. An upgrade cut
    /// short here is re-entered from its first step by the next leader.
    pub shutdown_grace: Duration,
}

impl OperatorConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`. Missing identity variables
    /// fall back to the hostname and the `default` namespace.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let holder_id = non_empty(lookup(POD_NAME_ENV)).unwrap_or_else(|| {
            warn!("{} not set, using hostname", POD_NAME_ENV);
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        });
        let lease_namespace = non_empty(lookup(POD_NAMESPACE_ENV)).unwrap_or_else(|| {
            warn!("{} not set, using 'default'", POD_NAMESPACE_ENV);
            "default".to_string()
        });

        Self {
            holder_id,
            lease_namespace,
            watch_namespace: non_empty(lookup(WATCH_NAMESPACE_ENV)),
            lease: LeaseTiming::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Whether the webhook TLS material is mounted.
    pub fn webhook_enabled(&self) -> bool {
        Path::new(WEBHOOK_CERT_PATH).exists() && Path::new(WEBHOOK_KEY_PATH).exists()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
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
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> OperatorConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OperatorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_reads_identity_and_scope() {
        let config = config(&[
            (POD_NAME_ENV, "astarte-operator-7d9f"),
            (POD_NAMESPACE_ENV, "astarte-system"),
            (WATCH_NAMESPACE_ENV, "astarte"),
        ]);
        assert_eq!(config.holder_id, "astarte-operator-7d9f");
        assert_eq!(config.lease_namespace, "astarte-system");
        assert_eq!(config.watch_namespace.as_deref(), Some("astarte"));
    }

    #[test]
    fn test_blank_watch_namespace_means_cluster_wide() {
        let config = config(&[(WATCH_NAMESPACE_ENV, "  ")]);
        assert_eq!(config.watch_namespace, None);
        assert_eq!(config.lease_namespace, "default");
        assert!(!config.holder_id.is_empty());
    }

    #[test]
    fn test_lease_renews_well_within_ttl() {
        let timing = LeaseTiming::default();
        assert!(timing.renew_interval * 2 < timing.ttl);
    }
}
