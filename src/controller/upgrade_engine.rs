//! Upgrade orchestration engine.
//!
//! `UpgradeEngine::ensure_upgrade` is called by the reconciler whenever the
//! reconciled version differs from the desired one. It selects the version
//! transitions that apply, persists the `Upgrading` phase, and runs each
//! transition's procedure in order. A failed procedure leaves the phase at
//! `Upgrading`, records a status message and a Warning event, and returns the
//! error; the next reconcile re-evaluates from scratch.
//!
//! ```text
//! reconcile ──▶ ensure_upgrade ──▶ evaluate_transitions ──▶ (Upgrading persisted)
//!                                     │
//!                                     ▼
//!                 for each transition: run steps ──▶ PersistVersion ──▶ RestoreScale
//! ```

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use kube::runtime::events::{Event, EventType};
use tracing::{Instrument, Span, debug, info, warn};

use crate::client::rabbitmq::QueueStats;
use crate::controller::context::EventSink;
use crate::controller::diagnostic_hints::{DiagnosticHint, EVENT_NOTE_LIMIT, truncate};
use crate::controller::error::{Error, Remediation, Result};
use crate::controller::poll::Clock;
use crate::controller::status::StatusStore;
use crate::controller::upgrade_steps::{FailurePolicy, StepContext, StepKind};
use crate::controller::upgrade_transitions::{
    VersionTransition, evaluate_transitions, select_transitions,
};
use crate::controller::version::AstarteVersion;
use crate::crd::Astarte;
use crate::resources::workloads::ComponentOps;

/// Collaborators the engine acts through.
#[derive(Clone)]
pub struct Collaborators {
    pub components: Arc<dyn ComponentOps>,
    pub queue: Arc<dyn QueueStats>,
    pub status: Arc<dyn StatusStore>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
}

/// Outcome of one step within a completed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: StepKind,
    pub duration: Duration,
    /// Failure swallowed by the step's failure policy.
    pub swallowed_error: Option<String>,
}

/// A transition that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionReport {
    pub name: String,
    pub landing_version: String,
    pub steps: Vec<StepReport>,
}

/// What `ensure_upgrade` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    pub transitions: Vec<TransitionReport>,
}

impl UpgradeReport {
    /// Whether no transition ran.
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Last version committed to status, if any.
    pub fn committed_version(&self) -> Option<&str> {
        self.transitions
            .last()
            .map(|t| t.landing_version.as_str())
    }
}

/// Runs version-transition procedures against one installation at a time.
pub struct UpgradeEngine {
    collaborators: Collaborators,
    transitions: Arc<Vec<VersionTransition>>,
    span: Span,
}

impl UpgradeEngine {
    /// Create an engine. All of its logging happens inside `span`.
    pub fn new(
        collaborators: Collaborators,
        transitions: Arc<Vec<VersionTransition>>,
        span: Span,
    ) -> Self {
        Self {
            collaborators,
            transitions,
            span,
        }
    }

    /// Transition table this engine evaluates.
    pub fn transitions(&self) -> &[VersionTransition] {
        &self.transitions
    }

    /// Whether some transition still applies from `current` to `target`.
    pub fn has_pending_transition(
        &self,
        current: &AstarteVersion,
        target: &AstarteVersion,
    ) -> bool {
        !select_transitions(&self.transitions, current, target).is_empty()
    }

    /// Run every transition that applies when moving from `old` to `new`.
    pub async fn ensure_upgrade(
        &self,
        old: &AstarteVersion,
        new: &AstarteVersion,
        astarte: &Astarte,
    ) -> Result<UpgradeReport> {
        self.ensure_upgrade_inner(old, new, astarte)
            .instrument(self.span.clone())
            .await
    }

    async fn ensure_upgrade_inner(
        &self,
        old: &AstarteVersion,
        new: &AstarteVersion,
        astarte: &Astarte,
    ) -> Result<UpgradeReport> {
        let selected = evaluate_transitions(
            &self.transitions,
            old,
            new,
            astarte,
            self.collaborators.status.as_ref(),
        )
        .await?;

        let mut report = UpgradeReport::default();
        for transition in selected {
            info!(
                transition = %transition.name,
                from = %old,
                to = %new,
                landing_version = %transition.landing_version,
                "Starting version transition"
            );
            self.publish(
                astarte,
                EventType::Normal,
                "UpgradeStarted",
                format!(
                    "Upgrading from {} to {} ({})",
                    old, transition.landing_version, transition.name
                ),
            )
            .await;

            match self.run_procedure(transition, astarte).await {
                Ok(transition_report) => {
                    info!(
                        transition = %transition.name,
                        version = %transition.landing_version,
                        "Version transition completed"
                    );
                    self.publish(
                        astarte,
                        EventType::Normal,
                        "UpgradeCompleted",
                        format!("Upgraded to {}", transition.landing_version),
                    )
                    .await;
                    report.transitions.push(transition_report);
                }
                Err(e) => {
                    self.report_failure(astarte, &e).await;
                    return Err(e);
                }
            }
        }

        Ok(report)
    }

    async fn run_procedure(
        &self,
        transition: &VersionTransition,
        astarte: &Astarte,
    ) -> Result<TransitionReport> {
        let ctx = StepContext {
            astarte,
            landing_version: &transition.landing_version,
            components: self.collaborators.components.as_ref(),
            queue: self.collaborators.queue.as_ref(),
            status: self.collaborators.status.as_ref(),
            clock: self.collaborators.clock.as_ref(),
        };

        let mut steps = Vec::with_capacity(transition.procedure.steps().len());
        for step in transition.procedure.steps() {
            let kind = step.kind();
            let started = self.collaborators.clock.now();
            debug!(step = %kind, "Running upgrade step");

            let outcome = ctx.run(step).await;
            let duration = self.collaborators.clock.now().duration_since(started);

            match (outcome, step.failure_policy()) {
                (Ok(()), _) => {
                    debug!(step = %kind, ?duration, "Upgrade step completed");
                    steps.push(StepReport {
                        step: kind,
                        duration,
                        swallowed_error: None,
                    });
                }
                (Err(failure), FailurePolicy::LogAndContinue) => {
                    warn!(
                        step = %kind,
                        error = %failure.reason,
                        "Upgrade step failed, continuing"
                    );
                    steps.push(StepReport {
                        step: kind,
                        duration,
                        swallowed_error: Some(failure.reason),
                    });
                }
                (Err(failure), FailurePolicy::Abort) => {
                    return Err(Error::UpgradeStep {
                        transition: transition.name.clone(),
                        step: kind,
                        reason: failure.reason,
                        remediation: failure.remediation,
                    });
                }
            }
        }

        Ok(TransitionReport {
            name: transition.name.clone(),
            landing_version: transition.landing_version.clone(),
            steps,
        })
    }

    /// Surface a failure on status and as a Warning event.
    async fn report_failure(&self, astarte: &Astarte, error: &Error) {
        let message = error.user_message();
        warn!(error = %error, remediation = %error.remediation(), "Upgrade failed");

        if let Err(e) = self
            .collaborators
            .status
            .record_failure(astarte, &message)
            .await
        {
            warn!(error = %e, "Failed to record upgrade failure in status");
        }

        let mut note = message;
        if let Error::UpgradeStep {
            step,
            remediation: Remediation::ManualIntervention,
            ..
        } = error
        {
            let hint = DiagnosticHint::for_step(
                *step,
                &astarte.namespace().unwrap_or_default(),
                &astarte.name_any(),
            );
            warn!(step = %step, "Diagnostic hint:\n{}", hint);
            note = format!("{} {}", note, hint.compact());
        }

        self.publish(astarte, EventType::Warning, "UpgradeFailed", note)
            .await;
    }

    async fn publish(&self, astarte: &Astarte, type_: EventType, reason: &str, note: String) {
        self.collaborators
            .events
            .publish(
                astarte,
                Event {
                    type_,
                    reason: reason.to_string(),
                    note: Some(truncate(&note, EVENT_NOTE_LIMIT)),
                    action: "Upgrade".to_string(),
                    secondary: None,
                },
            )
            .await;
    }
}
