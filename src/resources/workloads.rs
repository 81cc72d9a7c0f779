//! Workload operations used by the upgrade engine.
//!
//! `ComponentOps` is the seam between the engine and the cluster: deploy a
//! microservice at a pinned version, scale a workload, and observe its
//! replica counts. `KubeComponentOps` implements it with server-side apply
//! and merge patches.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};

use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::{Error, Result};
use crate::crd::{Astarte, AstarteComponent};
use crate::resources::common::{pod_selector_labels, selector_string};
use crate::resources::deployment::{ComponentSpec, generate_deployment};
use crate::resources::statefulset::{BROKER_COMPONENT, broker_name, generate_broker_statefulset};

/// Container waiting reason reported for crash-looping containers.
pub const CRASH_LOOP_REASON: &str = "CrashLoopBackOff";

/// A scalable workload of an Astarte installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    /// The VerneMQ broker StatefulSet.
    Broker,
    /// A microservice Deployment.
    Component(AstarteComponent),
}

impl Workload {
    /// Name of the workload object.
    pub fn name(&self, astarte: &Astarte) -> String {
        match self {
            Workload::Broker => broker_name(astarte),
            Workload::Component(c) => c.workload_name(&astarte.name_any()),
        }
    }

    /// Value of the component label on the workload's pods.
    pub fn component_label(&self) -> &'static str {
        match self {
            Workload::Broker => BROKER_COMPONENT,
            Workload::Component(c) => c.dashed_name(),
        }
    }
}

impl std::fmt::Display for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.component_label())
    }
}

/// Observed state of a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadState {
    /// Replicas requested in the workload spec.
    pub desired_replicas: i32,
    /// Replicas reported by the workload status.
    pub observed_replicas: i32,
    pub ready_replicas: i32,
    /// Replicas running the latest pod template.
    pub updated_replicas: i32,
    /// Whether the controller has observed the latest spec generation.
    pub generation_observed: bool,
    /// Name of a container stuck in CrashLoopBackOff, if any.
    pub crash_looping: Option<String>,
}

impl WorkloadState {
    /// Scaled to zero with no pods left.
    pub fn is_scaled_down(&self) -> bool {
        self.desired_replicas == 0 && self.observed_replicas == 0
    }

    /// Ready replicas running the latest pod template. Zero while the
    /// workload controller has not caught up with the latest spec, so a
    /// stale status from before a rollout never counts.
    pub fn ready_at_latest(&self) -> i32 {
        if self.generation_observed {
            self.ready_replicas.min(self.updated_replicas)
        } else {
            0
        }
    }
}

/// Cluster-side workload operations.
#[async_trait]
pub trait ComponentOps: Send + Sync {
    /// Create or update the broker StatefulSet at a version.
    async fn ensure_broker_deployed(&self, astarte: &Astarte, version: &str) -> Result<()>;

    /// Create or update a microservice Deployment.
    async fn ensure_component_deployed(
        &self,
        astarte: &Astarte,
        spec: &ComponentSpec,
    ) -> Result<()>;

    /// Set the replica count of a workload. Scaling a missing workload to
    /// zero succeeds.
    async fn scale_component(
        &self,
        astarte: &Astarte,
        workload: Workload,
        replicas: i32,
    ) -> Result<()>;

    /// Observe a workload. `None` when it does not exist.
    async fn component_state(
        &self,
        astarte: &Astarte,
        workload: Workload,
    ) -> Result<Option<WorkloadState>>;
}

/// `ComponentOps` backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeComponentOps {
    client: Client,
}

impl KubeComponentOps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespace(astarte: &Astarte) -> Result<String> {
        astarte
            .namespace()
            .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))
    }

    /// Name of the first container of the workload's pods waiting in CrashLoopBackOff.
    async fn crash_looping_container(
        &self,
        astarte: &Astarte,
        namespace: &str,
        workload: Workload,
    ) -> Result<Option<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = selector_string(&pod_selector_labels(astarte, workload.component_label()));
        let list = pods.list(&ListParams::default().labels(&selector)).await?;
        Ok(crash_looping_container_in(&list.items))
    }
}

/// First `pod/container` waiting in CrashLoopBackOff. Terminating pods are
/// skipped: a pod from the previous rollout going away is not a failure of
/// the current one.
fn crash_looping_container_in(pods: &[Pod]) -> Option<String> {
    pods.iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .find_map(|pod| {
            pod.status
                .as_ref()
                .and_then(|s| s.container_statuses.as_ref())
                .and_then(|statuses| {
                    statuses.iter().find(|cs| {
                        cs.state
                            .as_ref()
                            .and_then(|st| st.waiting.as_ref())
                            .and_then(|w| w.reason.as_deref())
                            == Some(CRASH_LOOP_REASON)
                    })
                })
                .map(|cs| format!("{}/{}", pod.name_any(), cs.name))
        })
}

#[async_trait]
impl ComponentOps for KubeComponentOps {
    async fn ensure_broker_deployed(&self, astarte: &Astarte, version: &str) -> Result<()> {
        let namespace = Self::namespace(astarte)?;
        let sts = generate_broker_statefulset(astarte, version);
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &broker_name(astarte),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&sts),
        )
        .await?;
        tracing::debug!(statefulset = %broker_name(astarte), version, "Applied broker statefulset");
        Ok(())
    }

    async fn ensure_component_deployed(
        &self,
        astarte: &Astarte,
        spec: &ComponentSpec,
    ) -> Result<()> {
        let namespace = Self::namespace(astarte)?;
        let deployment = generate_deployment(astarte, spec);
        let name = spec.component.workload_name(&astarte.name_any());
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&deployment),
        )
        .await?;
        tracing::debug!(
            deployment = %name,
            version = %spec.version,
            replicas = spec.replicas,
            strategy = %spec.strategy,
            "Applied component deployment"
        );
        Ok(())
    }

    async fn scale_component(
        &self,
        astarte: &Astarte,
        workload: Workload,
        replicas: i32,
    ) -> Result<()> {
        let namespace = Self::namespace(astarte)?;
        let name = workload.name(astarte);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });

        let result = match workload {
            Workload::Broker => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            }
            Workload::Component(_) => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            }
        };

        match result.map_err(Error::from) {
            Err(e) if e.is_not_found() && replicas == 0 => {
                tracing::debug!(workload = %name, "Workload not found, nothing to scale down");
                Ok(())
            }
            other => {
                tracing::debug!(workload = %name, replicas, "Scaled workload");
                other
            }
        }
    }

    async fn component_state(
        &self,
        astarte: &Astarte,
        workload: Workload,
    ) -> Result<Option<WorkloadState>> {
        let namespace = Self::namespace(astarte)?;
        let name = workload.name(astarte);

        let state = match workload {
            Workload::Broker => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
                api.get_opt(&name).await?.map(|sts| {
                    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                    let generation = sts.metadata.generation;
                    let status = sts.status.unwrap_or_default();
                    WorkloadState {
                        desired_replicas: desired,
                        observed_replicas: status.replicas,
                        ready_replicas: status.ready_replicas.unwrap_or(0),
                        updated_replicas: status.updated_replicas.unwrap_or(0),
                        generation_observed: status.observed_generation >= generation,
                        crash_looping: None,
                    }
                })
            }
            Workload::Component(_) => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
                api.get_opt(&name).await?.map(|d| {
                    let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                    let generation = d.metadata.generation;
                    let status = d.status.unwrap_or_default();
                    WorkloadState {
                        desired_replicas: desired,
                        observed_replicas: status.replicas.unwrap_or(0),
                        ready_replicas: status.ready_replicas.unwrap_or(0),
                        updated_replicas: status.updated_replicas.unwrap_or(0),
                        generation_observed: status.observed_generation >= generation,
                        crash_looping: None,
                    }
                })
            }
        };

        let Some(mut state) = state else {
            return Ok(None);
        };

        state.crash_looping = self
            .crash_looping_container(astarte, &namespace, workload)
            .await?;

        Ok(Some(state))
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
    use crate::crd::AstarteSpec;

    #[test]
    fn test_workload_names() {
        let astarte = Astarte::new("example", AstarteSpec::default());
        assert_eq!(Workload::Broker.name(&astarte), "example-vernemq");
        assert_eq!(
            Workload::Component(AstarteComponent::DataUpdaterPlant).name(&astarte),
            "example-data-updater-plant"
        );
        assert_eq!(Workload::Broker.component_label(), "vernemq");
    }

    #[test]
    fn test_is_scaled_down() {
        let mut state = WorkloadState::default();
        assert!(state.is_scaled_down());

        state.observed_replicas = 1;
        assert!(!state.is_scaled_down());

        state = WorkloadState {
            desired_replicas: 2,
            ..Default::default()
        };
        assert!(!state.is_scaled_down());
    }

    #[test]
    fn test_ready_at_latest_ignores_stale_status() {
        let mut state = WorkloadState {
            desired_replicas: 1,
            observed_replicas: 1,
            ready_replicas: 1,
            updated_replicas: 0,
            generation_observed: true,
            crash_looping: None,
        };
        // old pod still ready, new template not rolled out yet
        assert_eq!(state.ready_at_latest(), 0);

        state.updated_replicas = 1;
        assert_eq!(state.ready_at_latest(), 1);

        state.generation_observed = false;
        assert_eq!(state.ready_at_latest(), 0);
    }

    fn pod(name: &str, waiting_reason: &str, terminating: bool) -> Pod {
        let mut value = serde_json::json!({
            "metadata": { "name": name },
            "status": {
                "containerStatuses": [{
                    "name": "housekeeping",
                    "image": "astarte/astarte_housekeeping:1.0.0",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 4,
                    "state": { "waiting": { "reason": waiting_reason } }
                }]
            }
        });
        if terminating {
            value["metadata"]["deletionTimestamp"] = "2024-01-01T00:00:00Z".into();
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_crash_looping_container_found() {
        let pods = [
            pod("hk-a", "ContainerCreating", false),
            pod("hk-b", CRASH_LOOP_REASON, false),
        ];
        assert_eq!(
            crash_looping_container_in(&pods),
            Some("hk-b/housekeeping".to_string())
        );
    }

    #[test]
    fn test_terminating_pods_are_not_crash_looping() {
        let pods = [
            pod("hk-old", CRASH_LOOP_REASON, true),
            pod("hk-new", "ContainerCreating", false),
        ];
        assert_eq!(crash_looping_container_in(&pods), None);
    }
}
