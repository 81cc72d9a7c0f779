//! Upgrade protection validation policy.
//!
//! Tier 2 (Update): Only enforced on UPDATE operations
//!
//! Validates:
//! - `spec.version` never moves below the version already reconciled
//! - `spec.version` does not change while a version transition is in flight,
//!   except back to the version already reconciled
//!
//! While the phase is `Upgrading` the broker may be down and a migration may
//! be running against the database. The operator re-enters the interrupted
//! procedure on its next reconcile, which is only safe if the target stays put.
//! Setting the target back to the reconciled version selects no transition,
//! so the operator closes the upgrade and reapplies that version.

use super::{ValidationContext, ValidationResult};
use crate::controller::version::{AstarteVersion, is_downgrade};
use crate::crd::{Astarte, ReconciliationPhase};

/// Version the cluster is known to run: the reconciled one, else the old spec.
fn baseline_version(old: &Astarte) -> &str {
    old.reconciled_version().unwrap_or(old.spec.version.as_str())
}

/// Whether `version` is the one `old` has already reconciled. Compared as
/// written, the same way the reconciler decides no transition is needed.
fn is_reconciled_version(old: &Astarte, version: &str) -> bool {
    old.reconciled_version() == Some(version)
}

/// Validate version changes against the resource's current state
pub fn validate(ctx: &ValidationContext<'_>) -> ValidationResult {
    let Some(old) = ctx.old_resource else {
        return ValidationResult::allowed();
    };
    let new = ctx.resource;

    if old.spec.version == new.spec.version {
        return ValidationResult::allowed();
    }

    if old.reconciliation_phase() == ReconciliationPhase::Upgrading
        && !is_reconciled_version(old, &new.spec.version)
    {
        return ValidationResult::denied(
            "UpgradeInProgress",
            &format!(
                "Cannot change spec.version while the upgrade to {} is in progress. \
                 Wait for it to complete; check progress with: kubectl get astarte {} -o yaml",
                old.spec.version,
                old.metadata.name.as_deref().unwrap_or_default()
            ),
        );
    }

    // Unparseable versions are rejected by the Tier 1 policy
    let (Ok(current), Ok(desired)) = (
        AstarteVersion::parse(baseline_version(old)),
        AstarteVersion::parse(&new.spec.version),
    ) else {
        return ValidationResult::allowed();
    };

    if is_downgrade(&current, &desired) {
        return ValidationResult::denied(
            "DowngradeNotSupported",
            &format!(
                "Cannot downgrade Astarte from {} to {}",
                current, desired
            ),
        );
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
    use crate::crd::{AstarteSpec, AstarteStatus};

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

    fn with_status(version: &str, reconciled: &str, phase: ReconciliationPhase) -> Astarte {
        let mut astarte = create_resource(version);
        astarte.status = Some(AstarteStatus {
            astarte_version: reconciled.to_string(),
            reconciliation_phase: phase,
            ..Default::default()
        });
        astarte
    }

    fn check(old: &Astarte, new: &Astarte) -> ValidationResult {
        let ctx = ValidationContext {
            resource: new,
            old_resource: Some(old),
        };
        validate(&ctx)
    }

    #[test]
    fn test_upgrade_allowed() {
        let old = with_status("0.10.5", "0.10.5", ReconciliationPhase::Reconciled);
        let new = create_resource("0.11.2");
        assert!(check(&old, &new).allowed);
    }

    #[test]
    fn test_downgrade_denied() {
        let old = with_status("0.11.2", "0.11.2", ReconciliationPhase::Reconciled);
        let new = create_resource("0.10.5");
        let result = check(&old, &new);
        assert!(!result.allowed);
        assert_eq!(result.reason.unwrap(), "DowngradeNotSupported");
    }

    #[test]
    fn test_downgrade_checked_against_reconciled_version() {
        // spec already moved to 1.0.0 but only 0.11.0 has been committed
        let old = with_status("1.0.0", "0.11.0", ReconciliationPhase::Reconciling);
        let new = create_resource("0.11.3");
        assert!(check(&old, &new).allowed);

        let new = create_resource("0.10.9");
        assert!(!check(&old, &new).allowed);
    }

    #[test]
    fn test_version_change_during_upgrade_denied() {
        let old = with_status("0.11.2", "0.10.5", ReconciliationPhase::Upgrading);
        let new = create_resource("1.0.0");
        let result = check(&old, &new);
        assert!(!result.allowed);
        assert_eq!(result.reason.unwrap(), "UpgradeInProgress");
    }

    #[test]
    fn test_back_out_to_reconciled_version_during_upgrade_allowed() {
        let old = with_status("0.11.2", "0.10.5", ReconciliationPhase::Upgrading);
        assert!(check(&old, &create_resource("0.10.5")).allowed);

        // the in-flight target can still not move elsewhere
        assert!(!check(&old, &create_resource("0.10.6")).allowed);
    }

    #[test]
    fn test_other_changes_during_upgrade_allowed() {
        let old = with_status("0.11.2", "0.10.5", ReconciliationPhase::Upgrading);
        let mut new = create_resource("0.11.2");
        new.spec.image_registry = "registry.example.com/astarte".to_string();
        assert!(check(&old, &new).allowed);
    }

    #[test]
    fn test_create_allowed() {
        let new = create_resource("0.10.0");
        let ctx = ValidationContext {
            resource: &new,
            old_resource: None,
        };
        assert!(validate(&ctx).allowed);
    }
}
