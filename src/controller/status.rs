//! Status management.
//!
//! `StatusStore` is how the upgrade engine persists its progress: the phase
//! breadcrumb, the committed version, and the user-facing failure message.
//! Every write is a merge patch of the status subresource, so concurrent
//! writers of other status fields are preserved.

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;

use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::{Error, Result};
use crate::crd::{Astarte, AstarteStatus, Condition, ReconciliationPhase};

/// Persistence of upgrade progress on the resource status.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Record the reconciliation phase.
    async fn set_phase(&self, astarte: &Astarte, phase: ReconciliationPhase) -> Result<()>;

    /// Commit a version as reconciled and clear the failure message.
    async fn set_version(&self, astarte: &Astarte, version: &str) -> Result<()>;

    /// Record a human-readable failure message.
    async fn record_failure(&self, astarte: &Astarte, message: &str) -> Result<()>;

    /// Write a complete status at the end of a pass. A `None` message
    /// clears the stored one.
    async fn update(&self, astarte: &Astarte, status: &AstarteStatus) -> Result<()>;
}

/// `StatusStore` writing to the Astarte status subresource.
#[derive(Clone)]
pub struct KubeStatusStore {
    client: Client,
}

impl KubeStatusStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, astarte: &Astarte) -> Result<Api<Astarte>> {
        let namespace = astarte
            .namespace()
            .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }

    async fn patch(&self, astarte: &Astarte, status: serde_json::Value) -> Result<()> {
        let patch = json!({ "status": status });
        self.api(astarte)?
            .patch_status(
                &astarte.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn set_phase(&self, astarte: &Astarte, phase: ReconciliationPhase) -> Result<()> {
        self.patch(astarte, json!({ "reconciliationPhase": phase }))
            .await
    }

    async fn set_version(&self, astarte: &Astarte, version: &str) -> Result<()> {
        self.patch(astarte, json!({ "astarteVersion": version, "message": null }))
            .await
    }

    async fn record_failure(&self, astarte: &Astarte, message: &str) -> Result<()> {
        self.patch(astarte, json!({ "message": message })).await
    }

    async fn update(&self, astarte: &Astarte, status: &AstarteStatus) -> Result<()> {
        self.patch(astarte, status_patch(status)?).await
    }
}

/// Merge patch body for a complete status. Merge patches skip absent keys,
/// so a cleared message is sent as an explicit null.
fn status_patch(status: &AstarteStatus) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(status)?;
    if status.message.is_none()
        && let Some(fields) = value.as_object_mut()
    {
        fields.insert("message".to_string(), serde_json::Value::Null);
    }
    Ok(value)
}

/// Builder for managing conditions list
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    /// Start from the conditions already on the resource.
    pub fn from_existing(conditions: &[Condition]) -> Self {
        Self {
            conditions: conditions.to_vec(),
        }
    }

    /// Add or update a condition. The transition time is kept when the
    /// status of an existing condition does not change.
    pub fn set(&mut self, condition: Condition) -> &mut Self {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            let last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.clone()
            } else {
                condition.last_transition_time.clone()
            };
            *existing = Condition {
                last_transition_time,
                ..condition
            };
        } else {
            self.conditions.push(condition);
        }
        self
    }

    /// Set Ready condition
    pub fn ready(
        &mut self,
        ready: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::ready(ready, reason, message, generation))
    }

    /// Set Upgrading condition
    pub fn upgrading(
        &mut self,
        upgrading: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::upgrading(upgrading, reason, message, generation))
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

impl Default for ConditionBuilder {
    fn default() -> Self {
        Self::new()
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

    fn status_of<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a str> {
        conditions
            .iter()
            .find(|c| c.r#type == condition_type)
            .map(|c| c.status.as_str())
    }

    #[test]
    fn test_set_replaces_condition_of_same_type() {
        let mut builder = ConditionBuilder::new();
        builder
            .ready(false, "Reconciling", "in progress", Some(1))
            .ready(true, "Reconciled", "done", Some(1));

        let conditions = builder.build();
        assert_eq!(conditions.len(), 1);
        assert_eq!(status_of(&conditions, "Ready"), Some("True"));
        assert_eq!(conditions[0].reason, "Reconciled");
    }

    #[test]
    fn test_transition_time_kept_when_status_unchanged() {
        let mut existing = Condition::ready(true, "Reconciled", "done", Some(1));
        existing.last_transition_time = "2024-01-01T00:00:00Z".to_string();

        let mut builder = ConditionBuilder::from_existing(&[existing]);
        builder.ready(true, "Reconciled", "still done", Some(2));
        let conditions = builder.build();
        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].message, "still done");

        let mut builder = ConditionBuilder::from_existing(&conditions);
        builder.ready(false, "UpgradeFailed", "broken", Some(2));
        let conditions = builder.build();
        assert_ne!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_multiple_condition_types() {
        let mut builder = ConditionBuilder::new();
        builder
            .ready(false, "Upgrading", "", None)
            .upgrading(true, "UpgradeInProgress", "0.10→0.11", None);

        let conditions = builder.build();
        assert_eq!(conditions.len(), 2);
        assert_eq!(status_of(&conditions, "Upgrading"), Some("True"));
        assert_eq!(status_of(&conditions, "Ready"), Some("False"));
        assert_eq!(status_of(&conditions, "Missing"), None);
    }

    #[test]
    fn test_status_patch_clears_message() {
        let status = AstarteStatus {
            astarte_version: "0.11.2".to_string(),
            reconciliation_phase: ReconciliationPhase::Reconciled,
            ..Default::default()
        };
        let patch = status_patch(&status).unwrap();
        assert_eq!(patch["message"], serde_json::Value::Null);
        assert_eq!(patch["astarteVersion"], "0.11.2");
        assert_eq!(patch["reconciliationPhase"], "Reconciled");

        let failed = AstarteStatus {
            message: Some("drain timed out".to_string()),
            ..status
        };
        assert_eq!(status_patch(&failed).unwrap()["message"], "drain timed out");
    }
}
