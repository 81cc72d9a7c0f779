//! Astarte Custom Resource Definition.
//!
//! Defines the Astarte CRD describing one Astarte installation: the desired
//! version, the message broker (VerneMQ), the RabbitMQ connection and the
//! Astarte microservices. The status subresource carries the last reconciled
//! version and the reconciliation phase used by the upgrade engine to detect
//! interrupted upgrades.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Astarte is a custom resource for deploying an Astarte cluster.
///
/// Example:
/// ```yaml
/// apiVersion: api.astarte-platform.org/v1alpha2
/// kind: Astarte
/// metadata:
///   name: astarte
/// spec:
///   version: 1.0.0
///   vernemq:
///     replicas: 2
///   components:
///     housekeeping:
///       replicas: 1
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "api.astarte-platform.org",
    version = "v1alpha2",
    kind = "Astarte",
    plural = "astartes",
    shortname = "ast",
    status = "AstarteStatus",
    namespaced,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Reconciled", "type":"string", "jsonPath":".status.astarteVersion"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.reconciliationPhase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AstarteSpec {
    /// Desired Astarte version (e.g., "1.0.0", "0.11.4", "1.1-snapshot").
    pub version: String,

    /// Container registry/organization for Astarte images (default: astarte).
    #[serde(default = "default_image_registry")]
    pub image_registry: String,

    /// Image pull policy (default: IfNotPresent).
    #[serde(default = "default_image_pull_policy")]
    pub image_pull_policy: String,

    /// RabbitMQ configuration.
    #[serde(default)]
    pub rabbitmq: RabbitMqSpec,

    /// VerneMQ broker configuration.
    #[serde(default)]
    pub vernemq: BrokerSpec,

    /// Astarte microservices configuration.
    #[serde(default)]
    pub components: ComponentsSpec,

    /// Additional labels to apply to all managed resources.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for AstarteSpec {
    fn default() -> Self {
        Self {
            version: String::new(),
            image_registry: default_image_registry(),
            image_pull_policy: default_image_pull_policy(),
            rabbitmq: RabbitMqSpec::default(),
            vernemq: BrokerSpec::default(),
            components: ComponentsSpec::default(),
            labels: BTreeMap::new(),
        }
    }
}

fn default_image_registry() -> String {
    "astarte".to_string()
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

/// RabbitMQ configuration.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RabbitMqSpec {
    /// Whether the operator deploys RabbitMQ in-cluster (default: true).
    #[serde(default = "default_true")]
    pub deploy: bool,

    /// Connection settings for an external RabbitMQ.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<RabbitMqConnectionSpec>,

    /// Queue the broker publishes device data to (default: vmq_all).
    #[serde(default = "default_broker_queue")]
    pub broker_queue: String,
}

impl Default for RabbitMqSpec {
    fn default() -> Self {
        Self {
            deploy: true,
            connection: None,
            broker_queue: default_broker_queue(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_broker_queue() -> String {
    "vmq_all".to_string()
}

/// Connection settings for RabbitMQ.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RabbitMqConnectionSpec {
    /// Hostname of the RabbitMQ management API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Management API port (default: 15672).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_port: Option<u16>,

    /// Secret holding the RabbitMQ admin credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<LoginSecretRef>,
}

/// Reference to a Secret containing a username and a password.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginSecretRef {
    /// Name of the Secret.
    pub name: String,

    /// Key holding the username (default: admin-username).
    #[serde(default = "default_username_key")]
    pub username_key: String,

    /// Key holding the password (default: admin-password).
    #[serde(default = "default_password_key")]
    pub password_key: String,
}

fn default_username_key() -> String {
    "admin-username".to_string()
}

fn default_password_key() -> String {
    "admin-password".to_string()
}

/// VerneMQ broker configuration.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSpec {
    /// Number of broker replicas (default: 1).
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Resource requests and limits for broker pods.
    #[serde(default)]
    pub resources: ResourceRequirementsSpec,
}

impl Default for BrokerSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            resources: ResourceRequirementsSpec::default(),
        }
    }
}

fn default_replicas() -> i32 {
    1
}

/// Per-microservice configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentsSpec {
    #[serde(default)]
    pub housekeeping: ComponentConfig,
    #[serde(default)]
    pub data_updater_plant: ComponentConfig,
    #[serde(default)]
    pub appengine_api: ComponentConfig,
    #[serde(default)]
    pub realm_management: ComponentConfig,
    #[serde(default)]
    pub pairing: ComponentConfig,
    #[serde(default)]
    pub trigger_engine: ComponentConfig,
}

impl ComponentsSpec {
    /// Configuration of a given component.
    pub fn get(&self, component: AstarteComponent) -> &ComponentConfig {
        match component {
            AstarteComponent::Housekeeping => &self.housekeeping,
            AstarteComponent::DataUpdaterPlant => &self.data_updater_plant,
            AstarteComponent::AppEngineApi => &self.appengine_api,
            AstarteComponent::RealmManagement => &self.realm_management,
            AstarteComponent::Pairing => &self.pairing,
            AstarteComponent::TriggerEngine => &self.trigger_engine,
        }
    }
}

/// Configuration shared by every Astarte microservice.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfig {
    /// Whether the component is deployed (default: true).
    #[serde(default = "default_true")]
    pub deploy: bool,

    /// Number of replicas (default: 1).
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Resource requests and limits.
    #[serde(default)]
    pub resources: ResourceRequirementsSpec,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            deploy: true,
            replicas: default_replicas(),
            resources: ResourceRequirementsSpec::default(),
        }
    }
}

/// Astarte microservices managed as Deployments.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum AstarteComponent {
    Housekeeping,
    DataUpdaterPlant,
    AppEngineApi,
    RealmManagement,
    Pairing,
    TriggerEngine,
}

impl AstarteComponent {
    /// All components, in deployment order.
    pub const ALL: [AstarteComponent; 6] = [
        AstarteComponent::Housekeeping,
        AstarteComponent::RealmManagement,
        AstarteComponent::Pairing,
        AstarteComponent::DataUpdaterPlant,
        AstarteComponent::TriggerEngine,
        AstarteComponent::AppEngineApi,
    ];

    /// Name used in workload names and image names (e.g., "data-updater-plant").
    pub fn dashed_name(&self) -> &'static str {
        match self {
            AstarteComponent::Housekeeping => "housekeeping",
            AstarteComponent::DataUpdaterPlant => "data-updater-plant",
            AstarteComponent::AppEngineApi => "appengine-api",
            AstarteComponent::RealmManagement => "realm-management",
            AstarteComponent::Pairing => "pairing",
            AstarteComponent::TriggerEngine => "trigger-engine",
        }
    }

    /// Docker image name for the component (e.g., "astarte_data_updater_plant").
    pub fn image_name(&self) -> String {
        format!("astarte_{}", self.dashed_name().replace('-', "_"))
    }

    /// Workload name for this component in a given installation.
    pub fn workload_name(&self, astarte_name: &str) -> String {
        format!("{}-{}", astarte_name, self.dashed_name())
    }
}

impl std::fmt::Display for AstarteComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dashed_name())
    }
}

/// Resource requirements specification.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirementsSpec {
    /// CPU and memory requests.
    #[serde(default)]
    pub requests: ResourceSpec,

    /// CPU and memory limits.
    #[serde(default)]
    pub limits: ResourceSpec,
}

/// CPU and memory quantities (Kubernetes quantity strings).
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Status of an Astarte installation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AstarteStatus {
    /// Last Astarte version successfully reconciled (or committed by an upgrade).
    #[serde(default)]
    pub astarte_version: String,

    /// Current reconciliation phase.
    #[serde(default)]
    pub reconciliation_phase: ReconciliationPhase,

    /// Version of the operator that last reconciled this resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_version: Option<String>,

    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Human-readable message for the last failure, stating whether it will be retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions describing the current state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Reconciliation phase of an Astarte resource.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ReconciliationPhase {
    /// Never reconciled, or state cannot be determined.
    #[default]
    Unknown,
    /// Standard reconciliation in progress.
    Reconciling,
    /// A version-transition upgrade is in flight (or was interrupted).
    Upgrading,
    /// Resource is fully reconciled.
    Reconciled,
    /// Reconciliation failed.
    Failed,
}

impl ReconciliationPhase {
    pub const ALL: [ReconciliationPhase; 5] = [
        ReconciliationPhase::Unknown,
        ReconciliationPhase::Reconciling,
        ReconciliationPhase::Upgrading,
        ReconciliationPhase::Reconciled,
        ReconciliationPhase::Failed,
    ];
}

impl std::fmt::Display for ReconciliationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconciliationPhase::Unknown => write!(f, "Unknown"),
            ReconciliationPhase::Reconciling => write!(f, "Reconciling"),
            ReconciliationPhase::Upgrading => write!(f, "Upgrading"),
            ReconciliationPhase::Reconciled => write!(f, "Reconciled"),
            ReconciliationPhase::Failed => write!(f, "Failed"),
        }
    }
}

impl Astarte {
    /// Status version, if any version has been reconciled before.
    pub fn reconciled_version(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.astarte_version.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Current reconciliation phase (Unknown when no status yet).
    pub fn reconciliation_phase(&self) -> ReconciliationPhase {
        self.status
            .as_ref()
            .map(|s| s.reconciliation_phase)
            .unwrap_or_default()
    }
}

/// Condition describes the state of a resource at a certain point.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new("Ready", ready, reason, message, generation)
    }

    /// Create an "Upgrading" condition.
    pub fn upgrading(
        upgrading: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new("Upgrading", upgrading, reason, message, generation)
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
    fn test_phase_display() {
        assert_eq!(ReconciliationPhase::Unknown.to_string(), "Unknown");
        assert_eq!(ReconciliationPhase::Upgrading.to_string(), "Upgrading");
        assert_eq!(ReconciliationPhase::Reconciled.to_string(), "Reconciled");
    }

    #[test]
    fn test_phase_default() {
        assert_eq!(ReconciliationPhase::default(), ReconciliationPhase::Unknown);
    }

    #[test]
    fn test_spec_defaults_from_minimal_json() {
        let spec: AstarteSpec = serde_json::from_value(serde_json::json!({
            "version": "1.0.0"
        }))
        .unwrap();

        assert_eq!(spec.version, "1.0.0");
        assert_eq!(spec.image_registry, "astarte");
        assert!(spec.rabbitmq.deploy);
        assert_eq!(spec.rabbitmq.broker_queue, "vmq_all");
        assert_eq!(spec.vernemq.replicas, 1);
        assert!(spec.components.housekeeping.deploy);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = AstarteStatus {
            astarte_version: "0.11.0".to_string(),
            reconciliation_phase: ReconciliationPhase::Upgrading,
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["astarteVersion"], "0.11.0");
        assert_eq!(value["reconciliationPhase"], "Upgrading");
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_component_names() {
        assert_eq!(
            AstarteComponent::DataUpdaterPlant.image_name(),
            "astarte_data_updater_plant"
        );
        assert_eq!(
            AstarteComponent::Housekeeping.workload_name("astarte"),
            "astarte-housekeeping"
        );
        assert_eq!(AstarteComponent::AppEngineApi.to_string(), "appengine-api");
    }

    #[test]
    fn test_reconciled_version_empty_is_none() {
        let mut astarte = Astarte::new("astarte", AstarteSpec::default());
        assert_eq!(astarte.reconciled_version(), None);

        astarte.status = Some(AstarteStatus {
            astarte_version: String::new(),
            ..Default::default()
        });
        assert_eq!(astarte.reconciled_version(), None);

        astarte.status = Some(AstarteStatus {
            astarte_version: "0.10.2".to_string(),
            ..Default::default()
        });
        assert_eq!(astarte.reconciled_version(), Some("0.10.2"));
    }

    #[test]
    fn test_condition_upgrading() {
        let condition = Condition::upgrading(true, "UpgradeInProgress", "0.10→0.11", Some(2));
        assert_eq!(condition.r#type, "Upgrading");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.observed_generation, Some(2));
    }
}
