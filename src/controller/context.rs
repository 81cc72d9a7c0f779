//! Shared context for the controller.
//!
//! The Context struct holds shared state that is passed to the reconciler:
//! the Kubernetes client, the event reporter, and the collaborators the
//! reconciler and the upgrade engine act through.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::{Event, Recorder, Reporter};
use kube::{Client, Resource};

use crate::client::rabbitmq::{QueueStats, RabbitMqManagement};
use crate::controller::error::Result;
use crate::controller::poll::{Clock, TokioClock};
use crate::controller::reconciler::Reconciler;
use crate::controller::status::{KubeStatusStore, StatusStore};
use crate::controller::upgrade_engine::Collaborators;
use crate::controller::upgrade_transitions::{VersionTransition, default_transitions};
use crate::crd::Astarte;
use crate::health::HealthState;
use crate::resources::workloads::{ComponentOps, KubeComponentOps};

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "astarte-operator";

/// Destination of user-facing Kubernetes events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish an event about an Astarte resource. Failures are logged, not returned.
    async fn publish(&self, astarte: &Astarte, event: Event);
}

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Workload operations
    pub components: Arc<dyn ComponentOps>,
    /// RabbitMQ queue statistics
    pub queue_stats: Arc<dyn QueueStats>,
    /// Status persistence
    pub status_store: Arc<dyn StatusStore>,
    /// Clock used by upgrade waits
    pub clock: Arc<dyn Clock>,
    /// Version transitions, in evaluation order
    pub transitions: Arc<Vec<VersionTransition>>,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, health_state: Option<Arc<HealthState>>) -> Result<Self> {
        Ok(Self {
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state,
            components: Arc::new(KubeComponentOps::new(client.clone())),
            queue_stats: Arc::new(RabbitMqManagement::new(client.clone())?),
            status_store: Arc::new(KubeStatusStore::new(client.clone())),
            clock: Arc::new(TokioClock),
            transitions: Arc::new(default_transitions()?),
            client,
        })
    }

    /// Reconciler acting through the kube-backed collaborators.
    pub fn reconciler(&self) -> Reconciler {
        let collaborators = Collaborators {
            components: self.components.clone(),
            queue: self.queue_stats.clone(),
            status: self.status_store.clone(),
            events: Arc::new(self.clone()),
            clock: self.clock.clone(),
        };
        Reconciler::new(
            collaborators,
            self.transitions.clone(),
            self.health_state.clone(),
        )
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }
}

#[async_trait]
impl EventSink for Context {
    async fn publish(&self, astarte: &Astarte, event: Event) {
        let recorder = self.recorder();
        let object_ref = astarte.object_ref(&());
        let reason = event.reason.clone();
        if let Err(e) = recorder.publish(&event, &object_ref).await {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }
}
