//! StatefulSet generation for the VerneMQ broker.
//!
//! The broker keeps a stable identity per pod so that MQTT sessions survive
//! restarts. Scaling it to zero is the first step of the broker-down
//! migrations, which is why its replica count is also patched directly by the
//! upgrade engine.

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use crate::crd::Astarte;
use crate::resources::common::{
    owner_reference, pod_selector_labels, resource_requirements, standard_labels,
};

/// Component label of the broker.
pub const BROKER_COMPONENT: &str = "vernemq";
/// MQTT listener port
const MQTT_PORT: i32 = 1883;
/// Port Astarte services use to reach the broker's HTTP API
const BROKER_HTTP_PORT: i32 = 8888;
/// Give connected devices time to be disconnected cleanly
const TERMINATION_GRACE_PERIOD: i64 = 60;

/// Name of the broker StatefulSet (and its governing Service).
pub fn broker_name(astarte: &Astarte) -> String {
    format!("{}-{}", astarte.name_any(), BROKER_COMPONENT)
}

/// Broker image reference at a version.
pub fn broker_image(astarte: &Astarte, version: &str) -> String {
    format!("{}/vernemq:{}", astarte.spec.image_registry, version)
}

/// Generate the broker StatefulSet at a version.
pub fn generate_broker_statefulset(astarte: &Astarte, version: &str) -> StatefulSet {
    let labels = standard_labels(astarte, BROKER_COMPONENT);

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(broker_name(astarte)),
            namespace: astarte.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(astarte)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(astarte.spec.vernemq.replicas),
            service_name: Some(broker_name(astarte)),
            selector: LabelSelector {
                match_labels: Some(pod_selector_labels(astarte, BROKER_COMPONENT)),
                ..Default::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD),
                    containers: vec![Container {
                        name: BROKER_COMPONENT.to_string(),
                        image: Some(broker_image(astarte, version)),
                        image_pull_policy: Some(astarte.spec.image_pull_policy.clone()),
                        ports: Some(vec![
                            ContainerPort {
                                container_port: MQTT_PORT,
                                name: Some("mqtt".to_string()),
                                ..Default::default()
                            },
                            ContainerPort {
                                container_port: BROKER_HTTP_PORT,
                                name: Some("http".to_string()),
                                ..Default::default()
                            },
                        ]),
                        resources: resource_requirements(&astarte.spec.vernemq.resources),
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
    fn test_generate_broker_statefulset() {
        let mut spec = AstarteSpec {
            version: "1.0.0".to_string(),
            ..Default::default()
        };
        spec.vernemq.replicas = 3;
        let astarte = Astarte::new("astarte", spec);

        let sts = generate_broker_statefulset(&astarte, "1.0.0");
        assert_eq!(sts.metadata.name.as_deref(), Some("astarte-vernemq"));

        let sts_spec = sts.spec.unwrap();
        assert_eq!(sts_spec.replicas, Some(3));
        assert_eq!(sts_spec.service_name.as_deref(), Some("astarte-vernemq"));

        let container = &sts_spec.template.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("astarte/vernemq:1.0.0"));
        assert_eq!(container.ports.as_ref().unwrap().len(), 2);
    }
}
