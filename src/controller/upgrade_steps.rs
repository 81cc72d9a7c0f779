//! Upgrade step procedures.
//!
//! A version transition runs a fixed, ordered list of steps:
//!
//! | Step | Effect | Wait |
//! |------|--------|------|
//! | ShutdownBroker | scale VerneMQ to 0 | SHORT, observed replicas 0 |
//! | DrainQueue | open RabbitMQ access | DRAIN, `messages_ready == 0` |
//! | MigrateBackingStore | housekeeping at 1 replica, landing version, Recreate | EXTENDED, exactly 1 ready |
//! | MigrateQueueTopology | Data Updater Plant at landing version, Recreate | SHORT, at least 1 ready |
//! | PersistVersion | commit the landing version to status | - |
//! | RestoreScale | housekeeping back to 0 | SHORT, observed replicas 0 |
//!
//! Every step before PersistVersion is idempotent, so an interrupted
//! procedure is simply run again from the first step. Failures after the
//! commit are logged and swallowed.

use std::fmt;

use tracing::{debug, info};

use crate::client::rabbitmq::QueueStats;
use crate::controller::error::{Error, Remediation};
use crate::controller::poll::{Clock, PollError, PollOutcome, PollPreset, poll};
use crate::controller::status::StatusStore;
use crate::crd::{Astarte, AstarteComponent};
use crate::resources::common::sum_resources;
use crate::resources::deployment::{ComponentSpec, RolloutStrategy};
use crate::resources::workloads::{ComponentOps, Workload};

/// Name of an upgrade step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    ShutdownBroker,
    DrainQueue,
    MigrateBackingStore,
    MigrateQueueTopology,
    PersistVersion,
    RestoreScale,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::ShutdownBroker => "ShutdownBroker",
            StepKind::DrainQueue => "DrainQueue",
            StepKind::MigrateBackingStore => "MigrateBackingStore",
            StepKind::MigrateQueueTopology => "MigrateQueueTopology",
            StepKind::PersistVersion => "PersistVersion",
            StepKind::RestoreScale => "RestoreScale",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a failing step does to its procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop the procedure; the version is not committed.
    Abort,
    /// Log the failure and carry on.
    LogAndContinue,
}

/// One step of a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ShutdownBroker,
    DrainQueue,
    /// When the broker is down its resource budget is lent to the migration.
    MigrateBackingStore { borrow_broker_resources: bool },
    MigrateQueueTopology,
    PersistVersion,
    RestoreScale,
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::ShutdownBroker => StepKind::ShutdownBroker,
            Step::DrainQueue => StepKind::DrainQueue,
            Step::MigrateBackingStore { .. } => StepKind::MigrateBackingStore,
            Step::MigrateQueueTopology => StepKind::MigrateQueueTopology,
            Step::PersistVersion => StepKind::PersistVersion,
            Step::RestoreScale => StepKind::RestoreScale,
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        match self {
            Step::RestoreScale => FailurePolicy::LogAndContinue,
            _ => FailurePolicy::Abort,
        }
    }
}

/// Ordered steps of one version transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepProcedure {
    steps: Vec<Step>,
}

impl StepProcedure {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Broker goes down first; the backing store migration runs with the
    /// broker's resources added to its own.
    pub fn broker_down_migration() -> Self {
        Self::new(vec![
            Step::ShutdownBroker,
            Step::DrainQueue,
            Step::MigrateBackingStore {
                borrow_broker_resources: true,
            },
            Step::MigrateQueueTopology,
            Step::PersistVersion,
            Step::RestoreScale,
        ])
    }

    /// Backing store is migrated while the broker still serves traffic; the
    /// broker is stopped only for the queue topology change.
    pub fn live_migration() -> Self {
        Self::new(vec![
            Step::MigrateBackingStore {
                borrow_broker_resources: false,
            },
            Step::ShutdownBroker,
            Step::DrainQueue,
            Step::MigrateQueueTopology,
            Step::PersistVersion,
            Step::RestoreScale,
        ])
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn kinds(&self) -> Vec<StepKind> {
        self.steps.iter().map(Step::kind).collect()
    }
}

/// Why a step failed and what the user should expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub reason: String,
    pub remediation: Remediation,
}

impl From<PollError> for StepFailure {
    fn from(e: PollError) -> Self {
        let remediation = match e {
            PollError::Fatal(_) => Remediation::ManualIntervention,
            PollError::TimedOut { .. } | PollError::Escalated { .. } => {
                Remediation::AutomaticRetry
            }
        };
        Self {
            reason: e.to_string(),
            remediation,
        }
    }
}

impl From<Error> for StepFailure {
    fn from(e: Error) -> Self {
        Self {
            reason: e.to_string(),
            remediation: e.remediation(),
        }
    }
}

/// Everything a step needs to act on one installation.
pub struct StepContext<'a> {
    pub astarte: &'a Astarte,
    /// Version the microservices are pinned to during the procedure.
    pub landing_version: &'a str,
    pub components: &'a dyn ComponentOps,
    pub queue: &'a dyn QueueStats,
    pub status: &'a dyn StatusStore,
    pub clock: &'a dyn Clock,
}

impl StepContext<'_> {
    /// Run one step to completion.
    pub async fn run(&self, step: &Step) -> Result<(), StepFailure> {
        match step {
            Step::ShutdownBroker => self.shutdown_broker().await,
            Step::DrainQueue => self.drain_queue().await,
            Step::MigrateBackingStore {
                borrow_broker_resources,
            } => self.migrate_backing_store(*borrow_broker_resources).await,
            Step::MigrateQueueTopology => self.migrate_queue_topology().await,
            Step::PersistVersion => self.persist_version().await,
            Step::RestoreScale => self.restore_scale().await,
        }
    }

    async fn shutdown_broker(&self) -> Result<(), StepFailure> {
        match self
            .components
            .component_state(self.astarte, Workload::Broker)
            .await?
        {
            None => {
                info!("Broker not deployed, nothing to shut down");
                return Ok(());
            }
            Some(state) if state.is_scaled_down() => {
                debug!("Broker already scaled down");
                return Ok(());
            }
            Some(_) => {
                self.components
                    .scale_component(self.astarte, Workload::Broker, 0)
                    .await?;
            }
        }

        self.wait_scaled_down(Workload::Broker, "broker shutdown")
            .await
    }

    async fn drain_queue(&self) -> Result<(), StepFailure> {
        let access = self.queue.connect(self.astarte).await?;
        let queue_name = self.astarte.spec.rabbitmq.broker_queue.as_str();
        debug!(
            queue = queue_name,
            base_url = access.base_url(),
            tunneled = access.is_tunneled(),
            "Waiting for queue to drain"
        );

        let result = {
            let access = &access;
            poll(self.clock, PollPreset::DRAIN, "queue drain", || async move {
                match self.queue.messages_ready(access, queue_name).await {
                    Ok(0) => PollOutcome::Done,
                    Ok(ready) => {
                        debug!(queue = queue_name, messages_ready = ready, "Queue not drained yet");
                        PollOutcome::NotDone
                    }
                    Err(e) if e.is_fatal() => PollOutcome::Fatal(e.to_string()),
                    Err(e) => PollOutcome::Transient(e.to_string()),
                }
            })
            .await
        };

        access.close().await;
        Ok(result?)
    }

    async fn migrate_backing_store(
        &self,
        borrow_broker_resources: bool,
    ) -> Result<(), StepFailure> {
        let config = &self.astarte.spec.components.housekeeping;
        let resources = if borrow_broker_resources {
            sum_resources(&config.resources, &self.astarte.spec.vernemq.resources)
        } else {
            config.resources.clone()
        };

        let spec = ComponentSpec {
            component: AstarteComponent::Housekeeping,
            version: self.landing_version.to_string(),
            replicas: 1,
            resources,
            strategy: RolloutStrategy::Recreate,
        };
        self.components
            .ensure_component_deployed(self.astarte, &spec)
            .await?;

        let workload = Workload::Component(AstarteComponent::Housekeeping);
        poll(
            self.clock,
            PollPreset::EXTENDED,
            "backing store migration",
            || async move {
                match self.components.component_state(self.astarte, workload).await {
                    Err(e) => PollOutcome::Transient(e.to_string()),
                    Ok(None) => PollOutcome::Transient(format!(
                        "deployment {} not found",
                        workload.name(self.astarte)
                    )),
                    Ok(Some(state)) => {
                        if let Some(container) = state.crash_looping {
                            PollOutcome::Fatal(format!(
                                "container {container} is in CrashLoopBackOff"
                            ))
                        } else if state.ready_at_latest() == 1 {
                            PollOutcome::Done
                        } else {
                            PollOutcome::NotDone
                        }
                    }
                }
            },
        )
        .await?;
        Ok(())
    }

    async fn migrate_queue_topology(&self) -> Result<(), StepFailure> {
        let config = &self.astarte.spec.components.data_updater_plant;
        let spec = ComponentSpec {
            component: AstarteComponent::DataUpdaterPlant,
            version: self.landing_version.to_string(),
            replicas: config.replicas.max(1),
            resources: config.resources.clone(),
            strategy: RolloutStrategy::Recreate,
        };
        self.components
            .ensure_component_deployed(self.astarte, &spec)
            .await?;

        let workload = Workload::Component(AstarteComponent::DataUpdaterPlant);
        poll(
            self.clock,
            PollPreset::SHORT,
            "queue topology migration",
            || async move {
                match self.components.component_state(self.astarte, workload).await {
                    Err(e) => PollOutcome::Transient(e.to_string()),
                    Ok(Some(state)) if state.ready_at_latest() >= 1 => PollOutcome::Done,
                    Ok(_) => PollOutcome::NotDone,
                }
            },
        )
        .await?;
        Ok(())
    }

    async fn persist_version(&self) -> Result<(), StepFailure> {
        self.status
            .set_version(self.astarte, self.landing_version)
            .await?;
        info!(version = self.landing_version, "Committed landing version");
        Ok(())
    }

    async fn restore_scale(&self) -> Result<(), StepFailure> {
        let workload = Workload::Component(AstarteComponent::Housekeeping);
        self.components
            .scale_component(self.astarte, workload, 0)
            .await?;
        self.wait_scaled_down(workload, "migration scale down")
            .await
    }

    async fn wait_scaled_down(&self, workload: Workload, what: &str) -> Result<(), StepFailure> {
        poll(self.clock, PollPreset::SHORT, what, || async move {
            match self.components.component_state(self.astarte, workload).await {
                Ok(None) => PollOutcome::Done,
                Ok(Some(state)) if state.observed_replicas == 0 => PollOutcome::Done,
                Ok(Some(_)) => PollOutcome::NotDone,
                Err(e) => PollOutcome::Transient(e.to_string()),
            }
        })
        .await?;
        Ok(())
    }
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
    fn test_broker_down_migration_order() {
        assert_eq!(
            StepProcedure::broker_down_migration().kinds(),
            vec![
                StepKind::ShutdownBroker,
                StepKind::DrainQueue,
                StepKind::MigrateBackingStore,
                StepKind::MigrateQueueTopology,
                StepKind::PersistVersion,
                StepKind::RestoreScale,
            ]
        );
    }

    #[test]
    fn test_live_migration_order() {
        let procedure = StepProcedure::live_migration();
        assert_eq!(
            procedure.kinds(),
            vec![
                StepKind::MigrateBackingStore,
                StepKind::ShutdownBroker,
                StepKind::DrainQueue,
                StepKind::MigrateQueueTopology,
                StepKind::PersistVersion,
                StepKind::RestoreScale,
            ]
        );
        assert_eq!(
            procedure.steps()[0],
            Step::MigrateBackingStore {
                borrow_broker_resources: false
            }
        );
    }

    #[test]
    fn test_only_restore_scale_is_swallowed() {
        for step in StepProcedure::broker_down_migration().steps() {
            let expected = if step.kind() == StepKind::RestoreScale {
                FailurePolicy::LogAndContinue
            } else {
                FailurePolicy::Abort
            };
            assert_eq!(step.failure_policy(), expected, "{}", step.kind());
        }
    }

    #[test]
    fn test_poll_error_remediation() {
        let failure = StepFailure::from(PollError::Fatal("crash loop".to_string()));
        assert_eq!(failure.remediation, Remediation::ManualIntervention);

        let failure = StepFailure::from(PollError::Escalated {
            failures: 11,
            last_error: "404".to_string(),
        });
        assert_eq!(failure.remediation, Remediation::AutomaticRetry);
    }
}
