//! In-memory collaborators for driving the reconciler and the upgrade engine
//! without a cluster.
//!
//! `MockCluster` implements every trait they act through and keeps a
//! log of mutations (scales, deploys, status writes, events, connections) so
//! tests can assert on the exact order of side effects. Reads are not logged.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType};

use astarte_operator::client::rabbitmq::{
    Credentials, QueueStats, QueueStatsError, RabbitMqAccess,
};
use astarte_operator::controller::context::EventSink;
use astarte_operator::controller::error::{Error, Result};
use astarte_operator::controller::poll::ManualClock;
use astarte_operator::controller::reconciler::Reconciler;
use astarte_operator::controller::status::StatusStore;
use astarte_operator::controller::upgrade_engine::{Collaborators, UpgradeEngine};
use astarte_operator::controller::upgrade_transitions::default_transitions;
use astarte_operator::crd::{Astarte, AstarteComponent, AstarteStatus, ReconciliationPhase};
use astarte_operator::resources::deployment::ComponentSpec;
use astarte_operator::resources::workloads::{ComponentOps, Workload, WorkloadState};

/// How the housekeeping migration instance behaves once deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationBehavior {
    /// Becomes ready right away.
    Succeeds,
    /// Becomes ready after this many observations.
    ReadyAfter(u32),
    /// Container stuck in CrashLoopBackOff.
    CrashLoops,
    /// Reads of the Deployment fail.
    ApiErrors,
}

/// A recorded event.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

#[derive(Debug)]
pub struct MockState {
    pub broker: Option<WorkloadState>,
    pub housekeeping: Option<WorkloadState>,
    pub data_updater_plant: Option<WorkloadState>,
    pub deployed: Vec<ComponentSpec>,
    /// Queue depths returned by successive reads; `Ok(0)` once exhausted.
    pub queue_depths: VecDeque<std::result::Result<u64, QueueStatsError>>,
    pub depth_reads: u32,
    pub phase: ReconciliationPhase,
    pub version: String,
    pub message: Option<String>,
    pub events: Vec<RecordedEvent>,
    pub log: Vec<String>,
    pub migration: MigrationBehavior,
    pub migration_observations: u32,
    /// Scaling the broker down is accepted but pods never go away.
    pub broker_stuck: bool,
    /// Scaling housekeeping down fails.
    pub fail_housekeeping_scale_down: bool,
}

/// Workload running `replicas` ready pods at the latest template.
pub fn running(replicas: i32) -> WorkloadState {
    WorkloadState {
        desired_replicas: replicas,
        observed_replicas: replicas,
        ready_replicas: replicas,
        updated_replicas: replicas,
        generation_observed: true,
        crash_looping: None,
    }
}

pub struct MockCluster {
    state: Mutex<MockState>,
}

impl MockCluster {
    /// An installation running at `version` with every workload healthy.
    pub fn running_at(version: &str) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                broker: Some(running(1)),
                housekeeping: Some(running(1)),
                data_updater_plant: Some(running(1)),
                deployed: Vec::new(),
                queue_depths: VecDeque::new(),
                depth_reads: 0,
                phase: ReconciliationPhase::Reconciled,
                version: version.to_string(),
                message: None,
                events: Vec::new(),
                log: Vec::new(),
                migration: MigrationBehavior::Succeeds,
                migration_observations: 0,
                broker_stuck: false,
                fail_housekeeping_scale_down: false,
            }),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    pub fn with_queue_depths(
        self: Arc<Self>,
        depths: impl IntoIterator<Item = std::result::Result<u64, QueueStatsError>>,
    ) -> Arc<Self> {
        self.state().queue_depths = depths.into_iter().collect();
        self
    }

    pub fn with_migration(self: Arc<Self>, behavior: MigrationBehavior) -> Arc<Self> {
        self.state().migration = behavior;
        self
    }

    fn collaborators(self: &Arc<Self>, clock: Arc<ManualClock>) -> Collaborators {
        Collaborators {
            components: self.clone(),
            queue: self.clone(),
            status: self.clone(),
            events: self.clone(),
            clock,
        }
    }

    /// Engine over this cluster with the default transitions.
    pub fn engine(self: &Arc<Self>, clock: Arc<ManualClock>) -> UpgradeEngine {
        UpgradeEngine::new(
            self.collaborators(clock),
            Arc::new(default_transitions().unwrap()),
            tracing::Span::none(),
        )
    }

    /// Reconciler over this cluster with the default transitions.
    pub fn reconciler(self: &Arc<Self>, clock: Arc<ManualClock>) -> Reconciler {
        Reconciler::new(
            self.collaborators(clock),
            Arc::new(default_transitions().unwrap()),
            None,
        )
    }

    /// Warning events recorded so far.
    pub fn warnings(&self) -> Vec<RecordedEvent> {
        self.state()
            .events
            .iter()
            .filter(|e| e.warning)
            .cloned()
            .collect()
    }
}

/// API server error with the given HTTP status code.
pub fn api_error(code: u16, message: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "ServiceUnavailable".to_string(),
        code,
    }))
}

fn slot(state: &mut MockState, workload: Workload) -> Option<&mut Option<WorkloadState>> {
    match workload {
        Workload::Broker => Some(&mut state.broker),
        Workload::Component(AstarteComponent::Housekeeping) => Some(&mut state.housekeeping),
        Workload::Component(AstarteComponent::DataUpdaterPlant) => {
            Some(&mut state.data_updater_plant)
        }
        Workload::Component(_) => None,
    }
}

#[async_trait]
impl ComponentOps for MockCluster {
    async fn ensure_broker_deployed(&self, _astarte: &Astarte, version: &str) -> Result<()> {
        let mut state = self.state();
        state.log.push(format!("deploy:vernemq@{version}"));
        state.broker = Some(running(1));
        Ok(())
    }

    async fn ensure_component_deployed(
        &self,
        _astarte: &Astarte,
        spec: &ComponentSpec,
    ) -> Result<()> {
        let mut state = self.state();
        state.log.push(format!(
            "deploy:{}@{}",
            spec.component.dashed_name(),
            spec.version
        ));
        state.deployed.push(spec.clone());

        let replicas = spec.replicas;
        let fresh = match (spec.component, state.migration) {
            (AstarteComponent::Housekeeping, MigrationBehavior::CrashLoops) => WorkloadState {
                desired_replicas: replicas,
                observed_replicas: replicas,
                crash_looping: Some("astarte-housekeeping-0/housekeeping".to_string()),
                generation_observed: true,
                ..Default::default()
            },
            (AstarteComponent::Housekeeping, MigrationBehavior::ReadyAfter(_)) => WorkloadState {
                desired_replicas: replicas,
                observed_replicas: replicas,
                updated_replicas: replicas,
                generation_observed: true,
                ..Default::default()
            },
            _ => running(replicas),
        };
        if spec.component == AstarteComponent::Housekeeping {
            state.migration_observations = 0;
        }
        if let Some(slot) = slot(&mut state, Workload::Component(spec.component)) {
            *slot = Some(fresh);
        }
        Ok(())
    }

    async fn scale_component(
        &self,
        _astarte: &Astarte,
        workload: Workload,
        replicas: i32,
    ) -> Result<()> {
        let mut state = self.state();
        state.log.push(format!("scale:{workload}:{replicas}"));

        if workload == Workload::Component(AstarteComponent::Housekeeping)
            && replicas == 0
            && state.fail_housekeeping_scale_down
        {
            return Err(api_error(503, "API server unavailable"));
        }

        let stuck = workload == Workload::Broker && state.broker_stuck;
        if let Some(Some(current)) = slot(&mut state, workload) {
            current.desired_replicas = replicas;
            if !stuck {
                current.observed_replicas = replicas;
                current.ready_replicas = current.ready_replicas.min(replicas);
                current.updated_replicas = current.updated_replicas.min(replicas);
            }
        }
        Ok(())
    }

    async fn component_state(
        &self,
        _astarte: &Astarte,
        workload: Workload,
    ) -> Result<Option<WorkloadState>> {
        let mut state = self.state();
        if workload == Workload::Component(AstarteComponent::Housekeeping) {
            match state.migration {
                MigrationBehavior::ApiErrors => {
                    return Err(api_error(503, "connection refused"));
                }
                MigrationBehavior::ReadyAfter(n) => {
                    state.migration_observations += 1;
                    if state.migration_observations >= n
                        && let Some(hk) = state.housekeeping.as_mut()
                    {
                        hk.ready_replicas = hk.desired_replicas;
                    }
                }
                _ => {}
            }
        }
        Ok(slot(&mut state, workload).and_then(|s| s.clone()))
    }
}

#[async_trait]
impl QueueStats for MockCluster {
    async fn connect(&self, _astarte: &Astarte) -> Result<RabbitMqAccess> {
        self.state().log.push("connect".to_string());
        Ok(RabbitMqAccess::new(
            "http://rabbitmq.mock:15672",
            Credentials {
                username: "admin".to_string(),
                password: "secret".to_string(),
            },
        ))
    }

    async fn messages_ready(
        &self,
        _access: &RabbitMqAccess,
        _queue: &str,
    ) -> std::result::Result<u64, QueueStatsError> {
        let mut state = self.state();
        state.depth_reads += 1;
        state.queue_depths.pop_front().unwrap_or(Ok(0))
    }
}

#[async_trait]
impl StatusStore for MockCluster {
    async fn set_phase(&self, _astarte: &Astarte, phase: ReconciliationPhase) -> Result<()> {
        let mut state = self.state();
        state.log.push(format!("phase:{phase}"));
        state.phase = phase;
        Ok(())
    }

    async fn set_version(&self, _astarte: &Astarte, version: &str) -> Result<()> {
        let mut state = self.state();
        state.log.push(format!("version:{version}"));
        state.version = version.to_string();
        state.message = None;
        Ok(())
    }

    async fn record_failure(&self, _astarte: &Astarte, message: &str) -> Result<()> {
        self.state().message = Some(message.to_string());
        Ok(())
    }

    async fn update(&self, _astarte: &Astarte, status: &AstarteStatus) -> Result<()> {
        let mut state = self.state();
        state.log.push(format!(
            "status:{}@{}",
            status.reconciliation_phase, status.astarte_version
        ));
        state.phase = status.reconciliation_phase;
        state.version = status.astarte_version.clone();
        state.message = status.message.clone();
        Ok(())
    }
}

#[async_trait]
impl EventSink for MockCluster {
    async fn publish(&self, _astarte: &Astarte, event: Event) {
        let mut state = self.state();
        state.log.push(format!("event:{}", event.reason));
        state.events.push(RecordedEvent {
            warning: matches!(event.type_, EventType::Warning),
            reason: event.reason,
            note: event.note,
        });
    }
}
