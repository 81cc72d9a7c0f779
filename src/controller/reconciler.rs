//! Reconciliation loop for Astarte.
//!
//! Each pass validates `spec.version`, runs any version transition that
//! applies between the reconciled and the desired version, then applies the
//! broker and component workloads at the desired version and commits it to
//! status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::runtime::events::{Event, EventType};
use kube::{ResourceExt, runtime::controller::Action};
use tracing::{Span, debug, error, info, info_span, warn};

use crate::{
    controller::{
        context::Context,
        error::{Error, Result},
        state_machine::{PhaseEvent, PhaseStateMachine, TransitionContext, TransitionResult},
        status::ConditionBuilder,
        upgrade_engine::{Collaborators, UpgradeEngine, UpgradeReport},
        upgrade_transitions::VersionTransition,
        version::{AstarteVersion, is_downgrade, is_manageable, operator_version},
    },
    crd::{Astarte, AstarteComponent, AstarteStatus, ReconciliationPhase},
    health::{HealthState, UpgradeOutcome},
    resources::deployment::ComponentSpec,
};

/// Requeue delay between hops of a multi-hop upgrade
pub const NEXT_HOP_REQUEUE: Duration = Duration::from_secs(5);

/// Periodic resync of a reconciled resource
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Reconcile an Astarte resource
pub async fn reconcile(astarte: Arc<Astarte>, ctx: Arc<Context>) -> Result<Action> {
    let start_time = Instant::now();
    let name = astarte.name_any();
    let namespace = astarte.namespace().unwrap_or_else(|| "default".to_string());

    debug!(name = %name, namespace = %namespace, "Reconciling Astarte");

    let action = ctx.reconciler().reconcile_version(&astarte).await?;

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_reconcile(
            &namespace,
            &name,
            start_time.elapsed().as_secs_f64(),
        );
    }

    Ok(action)
}

/// Error policy for the controller
pub fn error_policy(astarte: Arc<Astarte>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = astarte.name_any();
    let namespace = astarte.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
    }
    Action::requeue(error.requeue_after())
}

/// One reconcile pass over an Astarte resource, acting on the cluster only
/// through its collaborators.
pub struct Reconciler {
    collaborators: Collaborators,
    transitions: Arc<Vec<VersionTransition>>,
    health_state: Option<Arc<HealthState>>,
    state_machine: PhaseStateMachine,
}

impl Reconciler {
    pub fn new(
        collaborators: Collaborators,
        transitions: Arc<Vec<VersionTransition>>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            collaborators,
            transitions,
            health_state,
            state_machine: PhaseStateMachine::new(),
        }
    }

    fn upgrade_engine(&self, span: Span) -> UpgradeEngine {
        UpgradeEngine::new(self.collaborators.clone(), self.transitions.clone(), span)
    }

    /// Bring the resource to its desired version. Returns a short requeue
    /// when another version transition is still pending after this one.
    pub async fn reconcile_version(&self, astarte: &Astarte) -> Result<Action> {
        let name = astarte.name_any();
        let namespace = astarte.namespace().unwrap_or_default();
        let mut phase = astarte.reconciliation_phase();
        let committed = astarte.reconciled_version().unwrap_or_default().to_string();

        let desired = match validate_versions(astarte, &committed) {
            Ok(desired) => desired,
            Err(e) => return Err(self.fail(astarte, phase, e).await),
        };

        let tctx = TransitionContext::new(desired.as_str(), &committed);

        if phase == ReconciliationPhase::Upgrading {
            info!(
                name = %name,
                from = %committed,
                to = %desired,
                "Found an interrupted upgrade, re-evaluating from the first step"
            );
        } else {
            phase = self
                .advance(astarte, phase, PhaseEvent::ReconcileStarted, &tctx)
                .await?;
        }

        let mut committed = committed;
        if !committed.is_empty() && committed != desired.as_str() {
            let current = AstarteVersion::parse(&committed)?;
            let span = info_span!("upgrade", namespace = %namespace, name = %name);
            let engine = self.upgrade_engine(span);

            let report = match engine.ensure_upgrade(&current, &desired, astarte).await {
                Ok(report) => report,
                Err(e) => {
                    if let (Some(health_state), Error::UpgradeStep { transition, .. }) =
                        (&self.health_state, &e)
                    {
                        health_state
                            .metrics
                            .record_upgrade(transition, UpgradeOutcome::Failed);
                    }
                    return Err(e);
                }
            };
            self.record_upgrade_metrics(&report);

            if let Some(landed) = report.committed_version() {
                committed = landed.to_string();
            }
            let landed = AstarteVersion::parse(&committed)?;
            let pending = engine.has_pending_transition(&landed, &desired);

            if !report.is_empty() || phase == ReconciliationPhase::Upgrading {
                let tctx = TransitionContext::new(desired.as_str(), &committed);
                phase = self
                    .advance(
                        astarte,
                        ReconciliationPhase::Upgrading,
                        PhaseEvent::UpgradeCompleted,
                        &tctx,
                    )
                    .await?;
            }

            if pending {
                info!(
                    name = %name,
                    committed = %committed,
                    desired = %desired,
                    "Another version transition applies, requeueing"
                );
                return Ok(Action::requeue(NEXT_HOP_REQUEUE));
            }
        } else if phase == ReconciliationPhase::Upgrading {
            // spec.version was set back to the committed version mid-upgrade
            phase = self
                .advance(astarte, phase, PhaseEvent::UpgradeCompleted, &tctx)
                .await?;
        }

        if let Err(e) = self.apply_workloads(astarte, &desired).await {
            return Err(self.fail(astarte, phase, e).await);
        }

        let tctx = TransitionContext::new(desired.as_str(), desired.as_str());
        let next_phase = self
            .state_machine
            .transition(&phase, PhaseEvent::ReconcileSucceeded, &tctx)
            .target()
            .unwrap_or(phase);

        let generation = astarte.metadata.generation;
        let existing = astarte
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default();
        let mut conditions = ConditionBuilder::from_existing(existing);
        conditions
            .ready(
                next_phase == ReconciliationPhase::Reconciled,
                "Reconciled",
                &format!("Astarte {} is reconciled", desired),
                generation,
            )
            .upgrading(
                false,
                "NoUpgradePending",
                "No version transition applies",
                generation,
            );

        let status = AstarteStatus {
            astarte_version: desired.as_str().to_string(),
            reconciliation_phase: next_phase,
            operator_version: Some(operator_version().to_string()),
            observed_generation: generation,
            message: None,
            conditions: conditions.build(),
        };
        self.collaborators.status.update(astarte, &status).await?;

        if let Some(ref health_state) = self.health_state {
            health_state
                .metrics
                .set_resource_phase(&namespace, &name, next_phase);
        }

        if astarte.reconciliation_phase() != ReconciliationPhase::Reconciled
            && next_phase == ReconciliationPhase::Reconciled
        {
            self.collaborators
                .events
                .publish(
                    astarte,
                    Event {
                        type_: EventType::Normal,
                        reason: "Reconciled".into(),
                        note: Some(format!("Astarte {} is reconciled", desired)),
                        action: "Reconciling".into(),
                        secondary: None,
                    },
                )
                .await;
        }

        Ok(Action::requeue(RESYNC_INTERVAL))
    }

    /// Apply the broker and every deployed component at `version`.
    async fn apply_workloads(&self, astarte: &Astarte, version: &AstarteVersion) -> Result<()> {
        let components = &self.collaborators.components;
        components
            .ensure_broker_deployed(astarte, version.as_str())
            .await?;

        for component in AstarteComponent::ALL {
            if !astarte.spec.components.get(component).deploy {
                continue;
            }
            let spec = ComponentSpec::from_astarte(astarte, component, version.as_str());
            components.ensure_component_deployed(astarte, &spec).await?;
        }

        debug!(name = %astarte.name_any(), version = %version, "Applied workloads");
        Ok(())
    }

    /// Validate and persist a phase transition. Invalid or guarded transitions
    /// keep the current phase.
    async fn advance(
        &self,
        astarte: &Astarte,
        current: ReconciliationPhase,
        event: PhaseEvent,
        tctx: &TransitionContext,
    ) -> Result<ReconciliationPhase> {
        match self.state_machine.transition(&current, event, tctx) {
            TransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                if from != to {
                    info!(
                        name = %astarte.name_any(),
                        from = %from,
                        to = %to,
                        event = %event,
                        "{}",
                        description
                    );
                    self.collaborators.status.set_phase(astarte, to).await?;
                }
                Ok(to)
            }
            TransitionResult::InvalidTransition { current, event } => {
                debug!(phase = %current, event = %event, "No transition for event");
                Ok(current)
            }
            TransitionResult::GuardFailed {
                from, event, reason, ..
            } => {
                debug!(phase = %from, event = %event, reason = %reason, "Transition guard failed");
                Ok(current)
            }
        }
    }

    /// Surface a reconcile failure outside of an upgrade and hand the error back.
    async fn fail(&self, astarte: &Astarte, phase: ReconciliationPhase, error: Error) -> Error {
        let message = error.user_message();
        error!(name = %astarte.name_any(), error = %error, "Reconciliation failed");

        if let Err(e) = self
            .collaborators
            .status
            .record_failure(astarte, &message)
            .await
        {
            warn!(error = %e, "Failed to record failure in status");
        }
        if let Err(e) = self
            .advance(
                astarte,
                phase,
                PhaseEvent::ReconcileFailed,
                &TransitionContext::default(),
            )
            .await
        {
            warn!(error = %e, "Failed to record Failed phase");
        }

        self.collaborators
            .events
            .publish(
                astarte,
                Event {
                    type_: EventType::Warning,
                    reason: "ReconcileFailed".into(),
                    note: Some(message),
                    action: "Reconciling".into(),
                    secondary: None,
                },
            )
            .await;
        error
    }

    fn record_upgrade_metrics(&self, report: &UpgradeReport) {
        let Some(ref health_state) = self.health_state else {
            return;
        };
        for transition in &report.transitions {
            health_state
                .metrics
                .record_upgrade(&transition.name, UpgradeOutcome::Succeeded);
            for step in &transition.steps {
                health_state
                    .metrics
                    .record_upgrade_step(step.step.as_str(), step.duration.as_secs_f64());
            }
        }
    }
}

/// Parse the desired version and reject unmanageable targets and downgrades.
fn validate_versions(astarte: &Astarte, committed: &str) -> Result<AstarteVersion> {
    let desired = AstarteVersion::parse(&astarte.spec.version)?;

    if !is_manageable(&desired) {
        return Err(Error::UnsupportedVersion(format!(
            "{} cannot be managed by operator {}",
            desired,
            operator_version()
        )));
    }

    if !committed.is_empty() {
        let current = AstarteVersion::parse(committed)?;
        if is_downgrade(&current, &desired) {
            return Err(Error::Validation(format!(
                "downgrading from {} to {} is not supported",
                current, desired
            )));
        }
    }

    Ok(desired)
}
