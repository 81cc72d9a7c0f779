//! Deployment generation for Astarte microservices.
//!
//! Every microservice runs from the same minimal template: one container
//! running `{registry}/astarte_{component}:{version}` with the configured
//! replicas and resources. The rollout strategy is chosen by the caller;
//! migrations pin `Recreate` so that two versions never run side by side.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::{Astarte, AstarteComponent, ResourceRequirementsSpec};
use crate::resources::common::{
    owner_reference, pod_selector_labels, resource_requirements, standard_labels,
};

/// HTTP port exposed by every Astarte microservice.
pub const ASTARTE_HTTP_PORT: i32 = 4000;

/// How a Deployment replaces its pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutStrategy {
    /// Kill all old pods before starting new ones.
    Recreate,
    /// Default surge-based rollout.
    RollingUpdate,
}

impl fmt::Display for RolloutStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RolloutStrategy::Recreate => write!(f, "Recreate"),
            RolloutStrategy::RollingUpdate => write!(f, "RollingUpdate"),
        }
    }
}

/// Kubernetes strategy for a rollout. The rolling-update parameters are
/// always spelled out so the field is owned by this field manager and a
/// later `Recreate` apply drops it instead of being rejected.
fn deployment_strategy(strategy: RolloutStrategy) -> DeploymentStrategy {
    let rolling_update = match strategy {
        RolloutStrategy::Recreate => None,
        RolloutStrategy::RollingUpdate => Some(RollingUpdateDeployment {
            max_surge: Some(IntOrString::String("25%".to_string())),
            max_unavailable: Some(IntOrString::String("25%".to_string())),
        }),
    };
    DeploymentStrategy {
        type_: Some(strategy.to_string()),
        rolling_update,
    }
}

/// Desired shape of one microservice Deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSpec {
    pub component: AstarteComponent,
    /// Astarte version the image is pinned to.
    pub version: String,
    pub replicas: i32,
    pub resources: ResourceRequirementsSpec,
    pub strategy: RolloutStrategy,
}

impl ComponentSpec {
    /// Component as configured in the resource spec, at `version`.
    pub fn from_astarte(astarte: &Astarte, component: AstarteComponent, version: &str) -> Self {
        let config = astarte.spec.components.get(component);
        Self {
            component,
            version: version.to_string(),
            replicas: config.replicas,
            resources: config.resources.clone(),
            strategy: RolloutStrategy::RollingUpdate,
        }
    }
}

/// Image reference for a component at a version.
pub fn component_image(astarte: &Astarte, component: AstarteComponent, version: &str) -> String {
    format!(
        "{}/{}:{}",
        astarte.spec.image_registry,
        component.image_name(),
        version
    )
}

/// Generate the Deployment for a component.
pub fn generate_deployment(astarte: &Astarte, spec: &ComponentSpec) -> Deployment {
    let name = spec.component.workload_name(&astarte.name_any());
    let component_label = spec.component.dashed_name();
    let labels = standard_labels(astarte, component_label);

    Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: astarte.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(astarte)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(pod_selector_labels(astarte, component_label)),
                ..Default::default()
            },
            strategy: Some(deployment_strategy(spec.strategy)),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: component_label.to_string(),
                        image: Some(component_image(astarte, spec.component, &spec.version)),
                        image_pull_policy: Some(astarte.spec.image_pull_policy.clone()),
                        ports: Some(vec![ContainerPort {
                            container_port: ASTARTE_HTTP_PORT,
                            name: Some("http".to_string()),
                            ..Default::default()
                        }]),
                        env: Some(component_env(astarte)),
                        resources: resource_requirements(&spec.resources),
                        security_context: Some(SecurityContext {
                            allow_privilege_escalation: Some(false),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn component_env(astarte: &Astarte) -> Vec<EnvVar> {
    let mut env = BTreeMap::new();
    env.insert("RELEASE_NAME", astarte.name_any());
    env.insert(
        "DATA_QUEUE_NAME",
        astarte.spec.rabbitmq.broker_queue.clone(),
    );

    env.into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        })
        .collect()
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
    use crate::crd::{AstarteSpec, ResourceSpec};

    fn astarte() -> Astarte {
        let mut astarte = Astarte::new(
            "astarte",
            AstarteSpec {
                version: "1.0.0".to_string(),
                ..Default::default()
            },
        );
        astarte.metadata.namespace = Some("astarte-ns".to_string());
        astarte
    }

    #[test]
    fn test_component_image() {
        assert_eq!(
            component_image(&astarte(), AstarteComponent::Housekeeping, "0.11.0"),
            "astarte/astarte_housekeeping:0.11.0"
        );
    }

    #[test]
    fn test_generate_deployment_pins_version_and_strategy() {
        let astarte = astarte();
        let spec = ComponentSpec {
            component: AstarteComponent::Housekeeping,
            version: "0.11.0".to_string(),
            replicas: 1,
            resources: ResourceRequirementsSpec {
                requests: ResourceSpec {
                    cpu: Some("300m".to_string()),
                    memory: None,
                },
                limits: ResourceSpec::default(),
            },
            strategy: RolloutStrategy::Recreate,
        };

        let deployment = generate_deployment(&astarte, &spec);
        assert_eq!(
            deployment.metadata.name.as_deref(),
            Some("astarte-housekeeping")
        );
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("astarte-ns"));

        let dspec = deployment.spec.unwrap();
        assert_eq!(dspec.replicas, Some(1));
        let strategy = dspec.strategy.unwrap();
        assert_eq!(strategy.type_.as_deref(), Some("Recreate"));
        assert!(strategy.rolling_update.is_none());

        let container = &dspec.template.spec.unwrap().containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("astarte/astarte_housekeeping:0.11.0")
        );
        assert!(container.resources.is_some());
    }

    #[test]
    fn test_from_astarte_uses_component_config() {
        let mut astarte = astarte();
        astarte.spec.components.data_updater_plant.replicas = 3;

        let spec = ComponentSpec::from_astarte(&astarte, AstarteComponent::DataUpdaterPlant, "1.0.0");
        assert_eq!(spec.replicas, 3);
        assert_eq!(spec.strategy, RolloutStrategy::RollingUpdate);
    }

    #[test]
    fn test_rolling_update_parameters_are_explicit() {
        let astarte = astarte();
        let spec = ComponentSpec::from_astarte(&astarte, AstarteComponent::Housekeeping, "1.0.0");
        let deployment = generate_deployment(&astarte, &spec);

        let strategy = deployment.spec.unwrap().strategy.unwrap();
        assert_eq!(strategy.type_.as_deref(), Some("RollingUpdate"));
        let rolling = strategy.rolling_update.unwrap();
        assert_eq!(rolling.max_surge, Some(IntOrString::String("25%".to_string())));
        assert_eq!(
            rolling.max_unavailable,
            Some(IntOrString::String("25%".to_string()))
        );

        // Switching to Recreate must not carry the rolling-update block along.
        let recreate = serde_json::to_value(deployment_strategy(RolloutStrategy::Recreate)).unwrap();
        assert_eq!(recreate, serde_json::json!({ "type": "Recreate" }));
    }
}
