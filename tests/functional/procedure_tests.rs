//! Individual upgrade steps against in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use astarte_operator::controller::error::Remediation;
use astarte_operator::controller::poll::ManualClock;
use astarte_operator::controller::upgrade_steps::{Step, StepContext, StepFailure};
use astarte_operator::crd::{Astarte, AstarteComponent};

use crate::common::AstarteBuilder;
use crate::mock_cluster::{MigrationBehavior, MockCluster};

async fn run_step(
    cluster: &Arc<MockCluster>,
    clock: &ManualClock,
    astarte: &Astarte,
    landing_version: &str,
    step: Step,
) -> Result<(), StepFailure> {
    let ctx = StepContext {
        astarte,
        landing_version,
        components: cluster.as_ref(),
        queue: cluster.as_ref(),
        status: cluster.as_ref(),
        clock,
    };
    ctx.run(&step).await
}

fn installation() -> Astarte {
    AstarteBuilder::new("astarte")
        .version("0.11.2")
        .reconciled("0.10.5")
        .build()
}

#[tokio::test]
async fn test_shutdown_without_broker_is_a_no_op() {
    let cluster = MockCluster::running_at("0.10.5");
    cluster.state().broker = None;
    let clock = ManualClock::new();

    run_step(&cluster, &clock, &installation(), "0.11.0", Step::ShutdownBroker)
        .await
        .unwrap();

    assert!(cluster.log().is_empty());
}

#[tokio::test]
async fn test_shutdown_waits_for_pods_to_go_away() {
    let cluster = MockCluster::running_at("0.10.5");
    cluster.state().broker_stuck = true;
    let clock = ManualClock::new();

    let failure = run_step(&cluster, &clock, &installation(), "0.11.0", Step::ShutdownBroker)
        .await
        .unwrap_err();

    assert_eq!(failure.remediation, Remediation::AutomaticRetry);
    assert!(failure.reason.contains("timed out"), "{}", failure.reason);
    assert_eq!(clock.elapsed(), Duration::from_secs(180));
    assert_eq!(cluster.log(), vec!["scale:vernemq:0"]);
}

#[tokio::test]
async fn test_queue_topology_deploys_at_least_one_instance() {
    let cluster = MockCluster::running_at("0.10.5");
    let clock = ManualClock::new();
    let astarte = AstarteBuilder::new("astarte")
        .version("0.11.2")
        .data_updater_plant_replicas(0)
        .build();

    run_step(&cluster, &clock, &astarte, "0.11.0", Step::MigrateQueueTopology)
        .await
        .unwrap();

    let state = cluster.state();
    assert_eq!(state.deployed.len(), 1);
    assert_eq!(state.deployed[0].component, AstarteComponent::DataUpdaterPlant);
    assert_eq!(state.deployed[0].replicas, 1);
    assert_eq!(state.deployed[0].version, "0.11.0");
}

#[tokio::test]
async fn test_queue_topology_keeps_configured_replicas() {
    let cluster = MockCluster::running_at("0.10.5");
    let clock = ManualClock::new();
    let astarte = AstarteBuilder::new("astarte")
        .version("0.11.2")
        .data_updater_plant_replicas(3)
        .build();

    run_step(&cluster, &clock, &astarte, "0.11.0", Step::MigrateQueueTopology)
        .await
        .unwrap();

    assert_eq!(cluster.state().deployed[0].replicas, 3);
}

#[tokio::test]
async fn test_restore_scale_without_housekeeping_succeeds() {
    let cluster = MockCluster::running_at("0.11.0");
    cluster.state().housekeeping = None;
    let clock = ManualClock::new();

    run_step(&cluster, &clock, &installation(), "0.11.0", Step::RestoreScale)
        .await
        .unwrap();

    assert_eq!(cluster.log(), vec!["scale:housekeeping:0"]);
    assert_eq!(clock.elapsed(), Duration::ZERO);
}

#[tokio::test]
async fn test_migration_waits_for_readiness() {
    let cluster =
        MockCluster::running_at("0.10.5").with_migration(MigrationBehavior::ReadyAfter(3));
    let clock = ManualClock::new();

    run_step(
        &cluster,
        &clock,
        &installation(),
        "0.11.0",
        Step::MigrateBackingStore {
            borrow_broker_resources: false,
        },
    )
    .await
    .unwrap();

    assert_eq!(clock.elapsed(), Duration::from_secs(20));
    assert_eq!(cluster.state().migration_observations, 3);
}

#[tokio::test]
async fn test_persist_version_commits_landing_version() {
    let cluster = MockCluster::running_at("0.10.5");
    cluster.state().message = Some("previous failure".to_string());
    let clock = ManualClock::new();

    run_step(&cluster, &clock, &installation(), "0.11.0", Step::PersistVersion)
        .await
        .unwrap();

    let state = cluster.state();
    assert_eq!(state.version, "0.11.0");
    assert_eq!(state.message, None);
}

#[tokio::test]
async fn test_drain_closes_after_empty_queue() {
    let cluster = MockCluster::running_at("0.10.5").with_queue_depths([Ok(3), Ok(0)]);
    let clock = ManualClock::new();

    run_step(&cluster, &clock, &installation(), "0.11.0", Step::DrainQueue)
        .await
        .unwrap();

    assert_eq!(cluster.state().depth_reads, 2);
    assert_eq!(clock.elapsed(), Duration::from_secs(5));
}
