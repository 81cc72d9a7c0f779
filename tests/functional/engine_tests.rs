//! Upgrade engine scenarios against in-memory collaborators.
//!
//! Each test drives `UpgradeEngine::ensure_upgrade` end to end and checks the
//! side effects the cluster would have seen, in order.

use std::sync::Arc;
use std::time::Duration;

use astarte_operator::client::rabbitmq::QueueStatsError;
use astarte_operator::controller::error::{Error, Remediation};
use astarte_operator::controller::poll::ManualClock;
use astarte_operator::controller::upgrade_steps::StepKind;
use astarte_operator::controller::version::AstarteVersion;
use astarte_operator::crd::{Astarte, AstarteComponent, ReconciliationPhase};
use astarte_operator::resources::deployment::RolloutStrategy;

use crate::common::AstarteBuilder;
use crate::mock_cluster::{MigrationBehavior, MockCluster};

fn v(s: &str) -> AstarteVersion {
    AstarteVersion::parse(s).unwrap()
}

fn astarte(reconciled: &str, desired: &str) -> Astarte {
    AstarteBuilder::new("astarte")
        .version(desired)
        .reconciled(reconciled)
        .phase(ReconciliationPhase::Reconciling)
        .build()
}

// ============================================================================
// Successful transitions
// ============================================================================

/// 0.10.5 → 0.11.2 runs the broker-down procedure and commits 0.11.0.
#[tokio::test]
async fn test_broker_down_migration_commits_landing_version() {
    let cluster = MockCluster::running_at("0.10.5");
    let clock = Arc::new(ManualClock::new());
    let engine = cluster.engine(clock);

    let report = engine
        .ensure_upgrade(&v("0.10.5"), &v("0.11.2"), &astarte("0.10.5", "0.11.2"))
        .await
        .unwrap();

    assert_eq!(
        cluster.log(),
        vec![
            "phase:Upgrading",
            "event:UpgradeStarted",
            "scale:vernemq:0",
            "connect",
            "deploy:housekeeping@0.11.0",
            "deploy:data-updater-plant@0.11.0",
            "version:0.11.0",
            "scale:housekeeping:0",
            "event:UpgradeCompleted",
        ]
    );

    assert_eq!(report.committed_version(), Some("0.11.0"));
    let transition = &report.transitions[0];
    assert_eq!(transition.name, "0.10→0.11");
    assert_eq!(
        transition.steps.iter().map(|s| s.step).collect::<Vec<_>>(),
        vec![
            StepKind::ShutdownBroker,
            StepKind::DrainQueue,
            StepKind::MigrateBackingStore,
            StepKind::MigrateQueueTopology,
            StepKind::PersistVersion,
            StepKind::RestoreScale,
        ]
    );

    let state = cluster.state();
    assert_eq!(state.version, "0.11.0");
    assert_eq!(state.message, None);
    // Engine leaves the phase to the reconciler once it is done
    assert_eq!(state.phase, ReconciliationPhase::Upgrading);
    assert_eq!(state.housekeeping.as_ref().unwrap().observed_replicas, 0);
}

/// 0.11.4 → 1.0.0 migrates the database first, with the broker still up.
#[tokio::test]
async fn test_live_migration_order() {
    let cluster = MockCluster::running_at("0.11.4");
    let engine = cluster.engine(Arc::new(ManualClock::new()));

    engine
        .ensure_upgrade(&v("0.11.4"), &v("1.0.0"), &astarte("0.11.4", "1.0.0"))
        .await
        .unwrap();

    assert_eq!(
        cluster.log(),
        vec![
            "phase:Upgrading",
            "event:UpgradeStarted",
            "deploy:housekeeping@1.0.0",
            "scale:vernemq:0",
            "connect",
            "deploy:data-updater-plant@1.0.0",
            "version:1.0.0",
            "scale:housekeeping:0",
            "event:UpgradeCompleted",
        ]
    );
}

/// The migration instance runs alone, recreated, pinned to the landing version.
#[tokio::test]
async fn test_migration_instance_spec() {
    let cluster = MockCluster::running_at("0.10.5");
    let engine = cluster.engine(Arc::new(ManualClock::new()));
    let astarte = AstarteBuilder::new("astarte")
        .version("0.11.2")
        .reconciled("0.10.5")
        .housekeeping_requests("500m", "512Mi")
        .broker_requests("1", "1Gi")
        .data_updater_plant_replicas(0)
        .build();

    engine
        .ensure_upgrade(&v("0.10.5"), &v("0.11.2"), &astarte)
        .await
        .unwrap();

    let state = cluster.state();
    let housekeeping = state
        .deployed
        .iter()
        .find(|s| s.component == AstarteComponent::Housekeeping)
        .unwrap();
    assert_eq!(housekeeping.replicas, 1);
    assert_eq!(housekeeping.version, "0.11.0");
    assert_eq!(housekeeping.strategy, RolloutStrategy::Recreate);
    // The broker is down, so its resources go to the migration
    assert_eq!(housekeeping.resources.requests.cpu.as_deref(), Some("1500m"));
    assert_eq!(housekeeping.resources.requests.memory.as_deref(), Some("1536Mi"));

    let dup = state
        .deployed
        .iter()
        .find(|s| s.component == AstarteComponent::DataUpdaterPlant)
        .unwrap();
    assert_eq!(dup.replicas, 1, "at least one instance declares the queues");
    assert_eq!(dup.strategy, RolloutStrategy::Recreate);
}

/// The live migration keeps the broker running, so nothing is borrowed.
#[tokio::test]
async fn test_live_migration_does_not_borrow_broker_resources() {
    let cluster = MockCluster::running_at("0.11.0");
    let engine = cluster.engine(Arc::new(ManualClock::new()));
    let astarte = AstarteBuilder::new("astarte")
        .version("1.0.0")
        .reconciled("0.11.0")
        .housekeeping_requests("500m", "512Mi")
        .broker_requests("1", "1Gi")
        .build();

    engine
        .ensure_upgrade(&v("0.11.0"), &v("1.0.0"), &astarte)
        .await
        .unwrap();

    let state = cluster.state();
    let housekeeping = &state.deployed[0];
    assert_eq!(housekeeping.component, AstarteComponent::Housekeeping);
    assert_eq!(housekeeping.resources.requests.cpu.as_deref(), Some("500m"));
}

// ============================================================================
// Selection
// ============================================================================

/// A patch upgrade inside one transition range is not the engine's business.
#[tokio::test]
async fn test_patch_upgrade_is_a_no_op() {
    let cluster = MockCluster::running_at("0.11.0");
    let engine = cluster.engine(Arc::new(ManualClock::new()));

    let report = engine
        .ensure_upgrade(&v("0.11.0"), &v("0.11.3"), &astarte("0.11.0", "0.11.3"))
        .await
        .unwrap();

    assert!(report.is_empty());
    assert!(cluster.log().is_empty(), "no phase write, no side effects");
    assert_eq!(cluster.state().phase, ReconciliationPhase::Reconciled);
}

/// Jumping two boundaries runs one hop per call.
#[tokio::test]
async fn test_double_jump_runs_first_hop_only() {
    let cluster = MockCluster::running_at("0.10.0");
    let engine = cluster.engine(Arc::new(ManualClock::new()));

    let report = engine
        .ensure_upgrade(&v("0.10.0"), &v("1.0.0"), &astarte("0.10.0", "1.0.0"))
        .await
        .unwrap();

    assert_eq!(report.transitions.len(), 1);
    assert_eq!(report.committed_version(), Some("0.11.0"));
    assert!(engine.has_pending_transition(&v("0.11.0"), &v("1.0.0")));

    // The next reconcile observes 0.11.0 and runs the second hop
    let report = engine
        .ensure_upgrade(&v("0.11.0"), &v("1.0.0"), &astarte("0.11.0", "1.0.0"))
        .await
        .unwrap();
    assert_eq!(report.committed_version(), Some("1.0.0"));
    assert!(!engine.has_pending_transition(&v("1.0.0"), &v("1.0.0")));
    assert_eq!(cluster.state().version, "1.0.0");
}

/// Running the same transition again converges to the same state.
#[tokio::test]
async fn test_rerun_is_idempotent() {
    let cluster = MockCluster::running_at("0.10.5");
    let engine = cluster.engine(Arc::new(ManualClock::new()));
    let resource = astarte("0.10.5", "0.11.2");

    engine
        .ensure_upgrade(&v("0.10.5"), &v("0.11.2"), &resource)
        .await
        .unwrap();
    engine
        .ensure_upgrade(&v("0.10.5"), &v("0.11.2"), &resource)
        .await
        .unwrap();

    let log = cluster.log();
    assert_eq!(
        log.iter().filter(|l| *l == "scale:vernemq:0").count(),
        1,
        "broker already down on the second run"
    );
    assert_eq!(log.iter().filter(|l| *l == "version:0.11.0").count(), 2);

    let state = cluster.state();
    assert_eq!(state.version, "0.11.0");
    assert_eq!(state.broker.as_ref().unwrap().observed_replicas, 0);
    assert_eq!(state.housekeeping.as_ref().unwrap().observed_replicas, 0);
}

/// The phase breadcrumb is written before any workload is touched.
#[tokio::test]
async fn test_upgrading_phase_persisted_first() {
    let cluster = MockCluster::running_at("0.10.5");
    let engine = cluster.engine(Arc::new(ManualClock::new()));

    engine
        .ensure_upgrade(&v("0.10.5"), &v("0.11.2"), &astarte("0.10.5", "0.11.2"))
        .await
        .unwrap();

    assert_eq!(cluster.log().first().map(String::as_str), Some("phase:Upgrading"));
}

// ============================================================================
// Waiting
// ============================================================================

/// Drain polls until the queue is empty.
#[tokio::test]
async fn test_drain_waits_for_empty_queue() {
    let cluster =
        MockCluster::running_at("0.10.5").with_queue_depths([Ok(120), Ok(40), Ok(0)]);
    let clock = Arc::new(ManualClock::new());
    let engine = cluster.engine(clock.clone());

    let report = engine
        .ensure_upgrade(&v("0.10.5"), &v("0.11.2"), &astarte("0.10.5", "0.11.2"))
        .await
        .unwrap();

    assert_eq!(cluster.state().depth_reads, 3);
    let drain = report.transitions[0]
        .steps
        .iter()
        .find(|s| s.step == StepKind::DrainQueue)
        .unwrap();
    assert_eq!(drain.duration, Duration::from_secs(10));
}

/// An empty queue on the first read does not wait at all.
#[tokio::test]
async fn test_drain_done_on_first_read() {
    let cluster = MockCluster::running_at("0.10.5").with_queue_depths([Ok(0)]);
    let clock = Arc::new(ManualClock::new());
    let engine = cluster.engine(clock.clone());

    engine
        .ensure_upgrade(&v("0.10.5"), &v("0.11.2"), &astarte("0.10.5", "0.11.2"))
        .await
        .unwrap();

    assert_eq!(cluster.state().depth_reads, 1);
    assert_eq!(clock.elapsed(), Duration::ZERO);
}

/// Read errors are retried like a non-empty queue.
#[tokio::test]
async fn test_drain_retries_unreachable_api() {
    let cluster = MockCluster::running_at("0.10.5").with_queue_depths([
        Err(QueueStatsError::Unreachable("connection refused".to_string())),
        Err(QueueStatsError::Status(503)),
        Ok(0),
    ]);
    let engine = cluster.engine(Arc::new(ManualClock::new()));

    engine
        .ensure_upgrade(&v("0.10.5"), &v("0.11.2"), &astarte("0.10.5", "0.11.2"))
        .await
        .unwrap();

    assert_eq!(cluster.state().version, "0.11.0");
}

/// A slow migration is waited for.
#[tokio::test]
async fn test_slow_migration_completes() {
    let cluster =
        MockCluster::running_at("0.10.5").with_migration(MigrationBehavior::ReadyAfter(30));
    let clock = Arc::new(ManualClock::new());
    let engine = cluster.engine(clock.clone());

    let report = engine
        .ensure_upgrade(&v("0.10.5"), &v("0.11.2"), &astarte("0.10.5", "0.11.2"))
        .await
        .unwrap();

    let migration = report.transitions[0]
        .steps
        .iter()
        .find(|s| s.step == StepKind::MigrateBackingStore)
        .unwrap();
    assert_eq!(migration.duration, Duration::from_secs(290));
}

// ============================================================================
// Failures
// ============================================================================

/// A crash-looping migration aborts at once and asks for a human.
#[tokio::test]
async fn test_crash_loop_is_fatal() {
    let cluster =
        MockCluster::running_at("0.10.5").with_migration(MigrationBehavior::CrashLoops);
    let clock = Arc::new(ManualClock::new());
    let engine = cluster.engine(clock.clone());

    let err = engine
        .ensure_upgrade(&v("0.10.5"), &v("0.11.2"), &astarte("0.10.5", "0.11.2"))
        .await
        .unwrap_err();

    match &err {
        Error::UpgradeStep {
            transition,
            step,
            remediation,
            reason,
        } => {
            assert_eq!(transition, "0.10→0.11");
            assert_eq!(*step, StepKind::MigrateBackingStore);
            assert_eq!(*remediation, Remediation::ManualIntervention);
            assert!(reason.contains("CrashLoopBackOff"), "{reason}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.is_retryable());
    assert_eq!(clock.elapsed(), Duration::ZERO, "no waiting on a fatal condition");

    let state = cluster.state();
    assert_eq!(state.phase, ReconciliationPhase::Upgrading);
    assert_eq!(state.version, "0.10.5", "nothing committed");
    let message = state.message.clone().unwrap();
    assert!(message.contains("manual intervention likely required"), "{message}");
    assert!(!state.log.iter().any(|l| l.starts_with("version:")));
    drop(state);

    let warnings = cluster.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].reason, "UpgradeFailed");
    let note = warnings[0].note.clone().unwrap();
    assert!(note.contains("kubectl logs"), "{note}");
    assert!(note.len() <= 1024);
}

/// A 2xx body that is not a queue description is fatal.
#[tokio::test]
async fn test_incompatible_management_api_is_fatal() {
    let cluster = MockCluster::running_at("0.10.5").with_queue_depths([Err(
        QueueStatsError::Decode("expected value at line 1 column 1".to_string()),
    )]);
    let engine = cluster.engine(Arc::new(ManualClock::new()));

    let err = engine
        .ensure_upgrade(&v("0.10.5"), &v("0.11.2"), &astarte("0.10.5", "0.11.2"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::UpgradeStep {
            step: StepKind::DrainQueue,
            remediation: Remediation::ManualIntervention,
            ..
        }
    ));
    assert_eq!(cluster.state().depth_reads, 1);
    assert!(!cluster.log().iter().any(|l| l.starts_with("deploy:")));
}

/// A queue that never drains times out and is retried automatically.
#[tokio::test]
async fn test_drain_timeout_retries() {
    let cluster =
        MockCluster::running_at("0.10.5").with_queue_depths(std::iter::repeat_n(Ok(7), 100));
    let clock = Arc::new(ManualClock::new());
    let engine = cluster.engine(clock.clone());

    let err = engine
        .ensure_upgrade(&v("0.10.5"), &v("0.11.2"), &astarte("0.10.5", "0.11.2"))
        .await
        .unwrap_err();

    assert_eq!(err.remediation(), Remediation::AutomaticRetry);
    assert!(err.is_retryable());
    assert_eq!(clock.elapsed(), Duration::from_secs(60));

    let state = cluster.state();
    assert_eq!(state.version, "0.10.5");
    assert_eq!(state.phase, ReconciliationPhase::Upgrading);
    assert!(
        state
            .message
            .as_deref()
            .unwrap()
            .contains("will retry automatically")
    );
}

/// Repeated read failures during the migration wait give up early.
#[tokio::test]
async fn test_migration_read_failures_escalate() {
    let cluster =
        MockCluster::running_at("0.10.5").with_migration(MigrationBehavior::ApiErrors);
    let clock = Arc::new(ManualClock::new());
    let engine = cluster.engine(clock.clone());

    let err = engine
        .ensure_upgrade(&v("0.10.5"), &v("0.11.2"), &astarte("0.10.5", "0.11.2"))
        .await
        .unwrap_err();

    match &err {
        Error::UpgradeStep { reason, remediation, .. } => {
            assert!(reason.contains("11 consecutive failures"), "{reason}");
            assert_eq!(*remediation, Remediation::AutomaticRetry);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // Well before the one-hour migration timeout
    assert_eq!(clock.elapsed(), Duration::from_secs(100));
}

/// A failure after the version is committed is logged, not returned.
#[tokio::test]
async fn test_restore_scale_failure_is_swallowed() {
    let cluster = MockCluster::running_at("0.10.5");
    cluster.state().fail_housekeeping_scale_down = true;
    let engine = cluster.engine(Arc::new(ManualClock::new()));

    let report = engine
        .ensure_upgrade(&v("0.10.5"), &v("0.11.2"), &astarte("0.10.5", "0.11.2"))
        .await
        .unwrap();

    let restore = report.transitions[0].steps.last().unwrap();
    assert_eq!(restore.step, StepKind::RestoreScale);
    assert!(restore.swallowed_error.is_some());

    let state = cluster.state();
    assert_eq!(state.version, "0.11.0");
    assert!(state.events.iter().all(|e| !e.warning));
}

/// A broker that never stops aborts before the queue is touched.
#[tokio::test]
async fn test_stuck_broker_times_out() {
    let cluster = MockCluster::running_at("0.10.5");
    cluster.state().broker_stuck = true;
    let clock = Arc::new(ManualClock::new());
    let engine = cluster.engine(clock.clone());

    let err = engine
        .ensure_upgrade(&v("0.10.5"), &v("0.11.2"), &astarte("0.10.5", "0.11.2"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::UpgradeStep {
            step: StepKind::ShutdownBroker,
            remediation: Remediation::AutomaticRetry,
            ..
        }
    ));
    assert_eq!(clock.elapsed(), Duration::from_secs(180));
    assert!(!cluster.log().contains(&"connect".to_string()));
}
