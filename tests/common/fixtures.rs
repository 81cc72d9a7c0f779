//! Test fixtures and builder patterns for Astarte.

use std::collections::BTreeMap;

use astarte_operator::crd::{
    Astarte, AstarteSpec, AstarteStatus, RabbitMqConnectionSpec, ReconciliationPhase,
    ResourceRequirementsSpec, ResourceSpec,
};

/// Builder for creating Astarte test fixtures.
///
/// # Example
/// ```ignore
/// let astarte = AstarteBuilder::new("astarte")
///     .version("0.11.2")
///     .reconciled("0.10.5")
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct AstarteBuilder {
    name: String,
    namespace: String,
    spec: AstarteSpec,
    status: Option<AstarteStatus>,
    generation: Option<i64>,
    labels: BTreeMap<String, String>,
}

impl AstarteBuilder {
    /// Create a new builder with the given resource name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "astarte".to_string(),
            spec: AstarteSpec {
                version: "1.0.0".to_string(),
                ..Default::default()
            },
            status: None,
            generation: Some(1),
            labels: BTreeMap::new(),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Desired version (`spec.version`).
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.spec.version = version.into();
        self
    }

    /// Reconciled version (`status.astarteVersion`).
    pub fn reconciled(mut self, version: impl Into<String>) -> Self {
        self.status.get_or_insert_with(Default::default).astarte_version = version.into();
        self
    }

    pub fn phase(mut self, phase: ReconciliationPhase) -> Self {
        self.status
            .get_or_insert_with(Default::default)
            .reconciliation_phase = phase;
        self
    }

    pub fn generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// RabbitMQ hosted outside the cluster.
    pub fn external_rabbitmq(mut self, host: impl Into<String>) -> Self {
        self.spec.rabbitmq.connection = Some(RabbitMqConnectionSpec {
            host: Some(host.into()),
            ..Default::default()
        });
        self
    }

    pub fn housekeeping_requests(mut self, cpu: &str, memory: &str) -> Self {
        self.spec.components.housekeeping.resources = requests(cpu, memory);
        self
    }

    pub fn broker_requests(mut self, cpu: &str, memory: &str) -> Self {
        self.spec.vernemq.resources = requests(cpu, memory);
        self
    }

    pub fn data_updater_plant_replicas(mut self, replicas: i32) -> Self {
        self.spec.components.data_updater_plant.replicas = replicas;
        self
    }

    pub fn build(self) -> Astarte {
        let mut astarte = Astarte::new(&self.name, self.spec);
        astarte.metadata.namespace = Some(self.namespace);
        astarte.metadata.uid = Some(format!("{}-uid", self.name));
        astarte.metadata.generation = self.generation;
        astarte.spec.labels.extend(self.labels);
        astarte.status = self.status;
        astarte
    }
}

fn requests(cpu: &str, memory: &str) -> ResourceRequirementsSpec {
    ResourceRequirementsSpec {
        requests: ResourceSpec {
            cpu: Some(cpu.to_string()),
            memory: Some(memory.to_string()),
        },
        limits: ResourceSpec::default(),
    }
}
