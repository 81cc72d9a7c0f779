//! Constraint-gated selection of version transitions.
//!
//! A transition applies when the currently reconciled version satisfies its
//! old-version range and the desired version satisfies its new-version
//! range. Selection always uses the version observed when it runs, so a jump
//! across two boundaries (0.10 to 1.0) selects only the first hop; the next
//! hop is selected on a later reconcile once the first has committed.

use semver::VersionReq;

use crate::controller::error::{Error, Result};
use crate::controller::state_machine::{
    PhaseEvent, PhaseStateMachine, TransitionContext, TransitionResult,
};
use crate::controller::status::StatusStore;
use crate::controller::upgrade_steps::StepProcedure;
use crate::controller::version::{AstarteVersion, VersionError, parse_constraint};
use crate::crd::{Astarte, ReconciliationPhase};

/// A version-transition descriptor.
#[derive(Debug, Clone)]
pub struct VersionTransition {
    pub name: String,
    pub old_range: VersionReq,
    pub new_range: VersionReq,
    /// Version committed to status when the procedure completes.
    pub landing_version: String,
    pub procedure: StepProcedure,
}

impl VersionTransition {
    pub fn new(
        name: &str,
        old_range: &str,
        new_range: &str,
        landing_version: &str,
        procedure: StepProcedure,
    ) -> std::result::Result<Self, VersionError> {
        let landing = AstarteVersion::parse(landing_version)?;
        Ok(Self {
            name: name.to_string(),
            old_range: parse_constraint(old_range)?,
            new_range: parse_constraint(new_range)?,
            landing_version: landing.as_str().to_string(),
            procedure,
        })
    }

    /// Whether this transition applies when moving from `old` to `new`.
    pub fn matches(&self, old: &AstarteVersion, new: &AstarteVersion) -> bool {
        old.satisfies(&self.old_range) && new.satisfies(&self.new_range)
    }
}

/// The transitions this operator knows about, in evaluation order.
pub fn default_transitions() -> std::result::Result<Vec<VersionTransition>, VersionError> {
    Ok(vec![
        VersionTransition::new(
            "0.10→0.11",
            ">= 0.10.0, < 0.11.0",
            ">= 0.11.0",
            "0.11.0",
            StepProcedure::broker_down_migration(),
        )?,
        VersionTransition::new(
            "0.11→1.0",
            ">= 0.11.0, < 1.0.0",
            ">= 1.0.0",
            "1.0.0",
            StepProcedure::live_migration(),
        )?,
    ])
}

/// Transitions applying to `old` → `new`, in table order. Pure.
pub fn select_transitions<'t>(
    table: &'t [VersionTransition],
    old: &AstarteVersion,
    new: &AstarteVersion,
) -> Vec<&'t VersionTransition> {
    table.iter().filter(|t| t.matches(old, new)).collect()
}

/// Phase event recording that an upgrade is about to run.
///
/// The snapshot phase is the one read at the start of the pass. Anything
/// other than `Upgrading` has already been moved to `Reconciling` by the
/// reconciler, so a fresh upgrade is selected from there.
fn upgrade_event(snapshot: ReconciliationPhase) -> (ReconciliationPhase, PhaseEvent) {
    match snapshot {
        ReconciliationPhase::Upgrading => (snapshot, PhaseEvent::UpgradeResumed),
        _ => (ReconciliationPhase::Reconciling, PhaseEvent::UpgradeSelected),
    }
}

/// Select the transitions to run and, when there is at least one, persist
/// the `Upgrading` phase before returning.
pub async fn evaluate_transitions<'t>(
    table: &'t [VersionTransition],
    old: &AstarteVersion,
    new: &AstarteVersion,
    astarte: &Astarte,
    status: &dyn StatusStore,
) -> Result<Vec<&'t VersionTransition>> {
    let selected = select_transitions(table, old, new);

    if selected.is_empty() {
        tracing::debug!(from = %old, to = %new, "No version transition applies");
        return Ok(selected);
    }

    let (current, event) = upgrade_event(astarte.reconciliation_phase());
    let ctx = TransitionContext::new(new.as_str(), old.as_str()).with_upgrade_pending(true);
    let TransitionResult::Success { to, description, .. } =
        PhaseStateMachine::new().transition(&current, event, &ctx)
    else {
        return Err(Error::Validation(format!(
            "cannot start an upgrade from phase {current}"
        )));
    };

    tracing::info!(
        from = %old,
        to = %new,
        event = %event,
        transitions = ?selected.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
        "{}",
        description
    );
    status.set_phase(astarte, to).await?;

    Ok(selected)
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

    fn v(s: &str) -> AstarteVersion {
        AstarteVersion::parse(s).unwrap()
    }

    fn names(old: &str, new: &str) -> Vec<String> {
        let table = default_transitions().unwrap();
        select_transitions(&table, &v(old), &v(new))
            .into_iter()
            .map(|t| t.name.clone())
            .collect()
    }

    #[test]
    fn test_default_transitions_parse() {
        let table = default_transitions().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].landing_version, "0.11.0");
        assert_eq!(table[1].landing_version, "1.0.0");
    }

    #[test]
    fn test_first_hop() {
        assert_eq!(names("0.10.5", "0.11.2"), vec!["0.10→0.11"]);
    }

    #[test]
    fn test_second_hop() {
        assert_eq!(names("0.11.4", "1.0.0"), vec!["0.11→1.0"]);
    }

    #[test]
    fn test_patch_upgrade_selects_nothing() {
        assert!(names("0.11.0", "0.11.3").is_empty());
        assert!(names("1.0.0", "1.0.3").is_empty());
    }

    #[test]
    fn test_double_jump_selects_only_first_hop() {
        assert_eq!(names("0.10.0", "1.0.0"), vec!["0.10→0.11"]);
    }

    #[test]
    fn test_prerelease_target_stripped() {
        assert_eq!(names("0.10.2", "0.11.0-rc.1"), vec!["0.10→0.11"]);
    }

    #[test]
    fn test_snapshot_selects_nothing() {
        assert!(names("snapshot", "1.0.0").is_empty());
        assert!(names("0.11.0", "snapshot").is_empty());
    }

    #[test]
    fn test_upgrade_event_resumes_interrupted_upgrade() {
        assert_eq!(
            upgrade_event(ReconciliationPhase::Upgrading),
            (ReconciliationPhase::Upgrading, PhaseEvent::UpgradeResumed)
        );
        for phase in [
            ReconciliationPhase::Unknown,
            ReconciliationPhase::Reconciled,
            ReconciliationPhase::Reconciling,
        ] {
            assert_eq!(
                upgrade_event(phase),
                (ReconciliationPhase::Reconciling, PhaseEvent::UpgradeSelected)
            );
        }
    }

    #[test]
    fn test_invalid_constraint_rejected() {
        let err = VersionTransition::new(
            "bad",
            "from 0.10",
            ">= 0.11.0",
            "0.11.0",
            StepProcedure::broker_down_migration(),
        )
        .unwrap_err();
        assert!(matches!(err, VersionError::InvalidConstraint { .. }));
    }
}
