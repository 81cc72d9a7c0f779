//! Finite state machine for the Astarte reconciliation phase.
//!
//! Every phase write made by the reconciler or the upgrade engine goes through
//! this table so that only valid transitions occur. In particular nothing but
//! a completed upgrade moves a resource out of `Upgrading`: a failed upgrade
//! leaves the phase where it is so the next reconcile re-enters the upgrade
//! path.

use std::fmt;

use crate::crd::ReconciliationPhase;

/// Events that trigger phase transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseEvent {
    /// A reconcile pass began
    ReconcileStarted,
    /// At least one version transition was selected
    UpgradeSelected,
    /// A reconcile found an interrupted upgrade
    UpgradeResumed,
    /// The selected version transitions ran to completion
    UpgradeCompleted,
    /// Workloads are applied at the desired version
    ReconcileSucceeded,
    /// Reconciliation failed outside of an upgrade
    ReconcileFailed,
}

impl fmt::Display for PhaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseEvent::ReconcileStarted => write!(f, "ReconcileStarted"),
            PhaseEvent::UpgradeSelected => write!(f, "UpgradeSelected"),
            PhaseEvent::UpgradeResumed => write!(f, "UpgradeResumed"),
            PhaseEvent::UpgradeCompleted => write!(f, "UpgradeCompleted"),
            PhaseEvent::ReconcileSucceeded => write!(f, "ReconcileSucceeded"),
            PhaseEvent::ReconcileFailed => write!(f, "ReconcileFailed"),
        }
    }
}

/// Context information available during phase transitions
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// `spec.version`
    pub desired_version: String,
    /// `status.astarteVersion`, empty before the first successful reconcile
    pub committed_version: String,
    /// Whether some version transition still applies
    pub upgrade_pending: bool,
}

impl TransitionContext {
    pub fn new(desired_version: &str, committed_version: &str) -> Self {
        Self {
            desired_version: desired_version.to_string(),
            committed_version: committed_version.to_string(),
            ..Default::default()
        }
    }

    /// Set the upgrade_pending flag
    pub fn with_upgrade_pending(mut self, pending: bool) -> Self {
        self.upgrade_pending = pending;
        self
    }

    /// Whether the committed version matches the desired one
    pub fn version_committed(&self) -> bool {
        self.committed_version == self.desired_version
    }
}

/// A phase transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: ReconciliationPhase,
    pub to: ReconciliationPhase,
    pub event: PhaseEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: ReconciliationPhase,
        to: ReconciliationPhase,
        event: PhaseEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a phase transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: ReconciliationPhase,
        to: ReconciliationPhase,
        event: PhaseEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: ReconciliationPhase,
        event: PhaseEvent,
    },
    GuardFailed {
        from: ReconciliationPhase,
        to: ReconciliationPhase,
        event: PhaseEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Target phase on success.
    pub fn target(&self) -> Option<ReconciliationPhase> {
        match self {
            TransitionResult::Success { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Phase state machine for Astarte resources
pub struct PhaseStateMachine {
    transitions: Vec<Transition>,
}

impl Default for PhaseStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseStateMachine {
    pub fn new() -> Self {
        use PhaseEvent as E;
        use ReconciliationPhase as P;

        Self {
            transitions: vec![
                // === Starting a pass ===
                Transition::new(P::Unknown, P::Reconciling, E::ReconcileStarted, "First reconcile"),
                Transition::new(
                    P::Reconciled,
                    P::Reconciling,
                    E::ReconcileStarted,
                    "Spec changed or periodic resync",
                ),
                Transition::new(P::Failed, P::Reconciling, E::ReconcileStarted, "Retrying after failure"),
                Transition::new(
                    P::Reconciling,
                    P::Reconciling,
                    E::ReconcileStarted,
                    "Continuing an unfinished pass",
                ),
                // === Upgrades ===
                Transition::new(
                    P::Reconciling,
                    P::Upgrading,
                    E::UpgradeSelected,
                    "Version transition selected",
                ),
                Transition::new(
                    P::Upgrading,
                    P::Upgrading,
                    E::UpgradeResumed,
                    "Re-entering an interrupted upgrade",
                ),
                Transition::new(
                    P::Upgrading,
                    P::Reconciling,
                    E::UpgradeCompleted,
                    "Version transitions completed",
                ),
                // === Finishing a pass ===
                Transition::new(
                    P::Reconciling,
                    P::Reconciled,
                    E::ReconcileSucceeded,
                    "Workloads applied at the desired version",
                ),
                Transition::new(P::Unknown, P::Failed, E::ReconcileFailed, "Failed before reconciling"),
                Transition::new(P::Reconciling, P::Failed, E::ReconcileFailed, "Reconciliation failed"),
                Transition::new(
                    P::Reconciled,
                    P::Failed,
                    E::ReconcileFailed,
                    "Invalid spec on a reconciled resource",
                ),
                Transition::new(P::Failed, P::Failed, E::ReconcileFailed, "Still failing"),
                // Upgrading has no ReconcileFailed edge: a failed upgrade stays Upgrading
            ],
        }
    }

    /// Attempt a transition from `current` on `event`
    pub fn transition(
        &self,
        current: &ReconciliationPhase,
        event: PhaseEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            PhaseEvent::ReconcileSucceeded if ctx.upgrade_pending => {
                Some("A version transition is still pending".to_string())
            }
            PhaseEvent::ReconcileSucceeded if !ctx.version_committed() => Some(format!(
                "Committed version {:?} does not match desired {}",
                ctx.committed_version, ctx.desired_version
            )),
            PhaseEvent::UpgradeSelected | PhaseEvent::UpgradeResumed if !ctx.upgrade_pending => {
                Some("No version transition applies".to_string())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use ReconciliationPhase as P;

    #[test]
    fn test_unknown_to_reconciling() {
        let sm = PhaseStateMachine::new();
        let ctx = TransitionContext::new("1.0.0", "");

        match sm.transition(&P::Unknown, PhaseEvent::ReconcileStarted, &ctx) {
            TransitionResult::Success { from, to, .. } => {
                assert_eq!(from, P::Unknown);
                assert_eq!(to, P::Reconciling);
            }
            other => panic!("Expected successful transition, got {other:?}"),
        }
    }

    #[test]
    fn test_reconcile_succeeded_guard() {
        let sm = PhaseStateMachine::new();

        let ctx = TransitionContext::new("0.11.2", "0.11.0");
        let result = sm.transition(&P::Reconciling, PhaseEvent::ReconcileSucceeded, &ctx);
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));

        let ctx = TransitionContext::new("0.11.2", "0.11.2").with_upgrade_pending(true);
        let result = sm.transition(&P::Reconciling, PhaseEvent::ReconcileSucceeded, &ctx);
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));

        let ctx = TransitionContext::new("0.11.2", "0.11.2");
        let result = sm.transition(&P::Reconciling, PhaseEvent::ReconcileSucceeded, &ctx);
        assert_eq!(result.target(), Some(P::Reconciled));
    }

    #[test]
    fn test_upgrade_failure_keeps_upgrading() {
        let sm = PhaseStateMachine::new();
        let ctx = TransitionContext::new("0.11.2", "0.10.5");
        let result = sm.transition(&P::Upgrading, PhaseEvent::ReconcileFailed, &ctx);
        assert!(matches!(result, TransitionResult::InvalidTransition { .. }));
    }

    #[test]
    fn test_only_completion_leaves_upgrading() {
        let sm = PhaseStateMachine::new();
        let targets: Vec<_> = sm
            .transitions
            .iter()
            .filter(|t| t.from == P::Upgrading && t.to != P::Upgrading)
            .map(|t| t.event)
            .collect();
        assert_eq!(targets, vec![PhaseEvent::UpgradeCompleted]);
    }

    #[test]
    fn test_upgrade_selected_guard() {
        let sm = PhaseStateMachine::new();
        let ctx = TransitionContext::new("0.11.3", "0.11.0");
        let result = sm.transition(&P::Reconciling, PhaseEvent::UpgradeSelected, &ctx);
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));
    }

    #[test]
    fn test_reconcile_started_from_every_settled_phase() {
        let sm = PhaseStateMachine::new();
        let ctx = TransitionContext::new("1.0.0", "1.0.0");
        for phase in [P::Unknown, P::Reconciled, P::Failed, P::Reconciling] {
            assert_eq!(
                sm.transition(&phase, PhaseEvent::ReconcileStarted, &ctx).target(),
                Some(P::Reconciling),
                "ReconcileStarted should be valid from {phase:?}"
            );
        }
        assert!(matches!(
            sm.transition(&P::Upgrading, PhaseEvent::ReconcileStarted, &ctx),
            TransitionResult::InvalidTransition { .. }
        ));
    }

    #[test]
    fn test_resume_requires_pending_transition() {
        let sm = PhaseStateMachine::new();
        let pending = TransitionContext::new("0.11.2", "0.10.5").with_upgrade_pending(true);
        assert_eq!(
            sm.transition(&P::Upgrading, PhaseEvent::UpgradeResumed, &pending).target(),
            Some(P::Upgrading)
        );

        let settled = TransitionContext::new("0.11.2", "0.11.0");
        assert!(matches!(
            sm.transition(&P::Upgrading, PhaseEvent::UpgradeResumed, &settled),
            TransitionResult::GuardFailed { .. }
        ));
        assert_eq!(
            sm.transition(&P::Upgrading, PhaseEvent::UpgradeCompleted, &settled).target(),
            Some(P::Reconciling)
        );
    }
}
