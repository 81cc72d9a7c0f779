//! Reconcile passes against in-memory collaborators.
//!
//! Each test drives `Reconciler::reconcile_version` once and checks the phase
//! writes, commits, workload applies and requeue it produced.

use std::sync::Arc;

use kube::runtime::controller::Action;

use astarte_operator::controller::error::{Error, Remediation};
use astarte_operator::controller::poll::ManualClock;
use astarte_operator::controller::reconciler::{NEXT_HOP_REQUEUE, RESYNC_INTERVAL};
use astarte_operator::crd::{Astarte, ReconciliationPhase};

use crate::common::AstarteBuilder;
use crate::mock_cluster::{MigrationBehavior, MockCluster};

fn astarte(phase: ReconciliationPhase, reconciled: &str, desired: &str) -> Astarte {
    AstarteBuilder::new("astarte")
        .version(desired)
        .reconciled(reconciled)
        .phase(phase)
        .build()
}

/// Index of the first log entry equal to `entry`.
fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|l| l == entry)
        .unwrap_or_else(|| panic!("{entry} not in {log:?}"))
}

/// An upgrade interrupted mid-procedure reruns it from the first step, then
/// finishes the pass at the desired version.
#[tokio::test]
async fn test_interrupted_upgrade_resumes() {
    let cluster = MockCluster::running_at("0.10.5");
    cluster.state().phase = ReconciliationPhase::Upgrading;
    let reconciler = cluster.reconciler(Arc::new(ManualClock::new()));

    let action = reconciler
        .reconcile_version(&astarte(ReconciliationPhase::Upgrading, "0.10.5", "0.11.2"))
        .await
        .unwrap();
    assert_eq!(action, Action::requeue(RESYNC_INTERVAL));

    let log = cluster.log();
    assert_eq!(log[0], "phase:Upgrading", "no Reconciling write before resuming");
    assert_eq!(log[1], "event:UpgradeStarted");
    assert_eq!(log[2], "scale:vernemq:0");

    let committed = position(&log, "version:0.11.0");
    let completed = position(&log, "phase:Reconciling");
    let broker = position(&log, "deploy:vernemq@0.11.2");
    let status = position(&log, "status:Reconciled@0.11.2");
    assert!(committed < completed && completed < broker && broker < status);
    assert_eq!(log.last().unwrap(), "event:Reconciled");

    let state = cluster.state();
    assert_eq!(state.phase, ReconciliationPhase::Reconciled);
    assert_eq!(state.version, "0.11.2");
    assert_eq!(state.message, None);
}

/// A two-hop upgrade commits the first landing version and comes back for
/// the second hop without touching the workloads at the desired version.
#[tokio::test]
async fn test_multi_hop_upgrade_requeues_between_hops() {
    let cluster = MockCluster::running_at("0.10.5");
    let reconciler = cluster.reconciler(Arc::new(ManualClock::new()));

    let action = reconciler
        .reconcile_version(&astarte(ReconciliationPhase::Reconciled, "0.10.5", "1.0.0"))
        .await
        .unwrap();
    assert_eq!(action, Action::requeue(NEXT_HOP_REQUEUE));

    let log = cluster.log();
    assert_eq!(log[0], "phase:Reconciling");
    assert_eq!(log[1], "phase:Upgrading");
    let committed = position(&log, "version:0.11.0");
    assert_eq!(log.last().unwrap(), "phase:Reconciling");
    assert!(committed < log.len() - 1);

    assert!(!log.iter().any(|l| l.contains("@1.0.0")), "{log:?}");
    assert!(!log.iter().any(|l| l.starts_with("status:")));

    let state = cluster.state();
    assert_eq!(state.phase, ReconciliationPhase::Reconciling);
    assert_eq!(state.version, "0.11.0");
}

/// A single hop walks Reconciling → Upgrading → Reconciling → Reconciled.
#[tokio::test]
async fn test_single_hop_upgrade_reaches_reconciled() {
    let cluster = MockCluster::running_at("0.10.5");
    let reconciler = cluster.reconciler(Arc::new(ManualClock::new()));

    let action = reconciler
        .reconcile_version(&astarte(ReconciliationPhase::Reconciled, "0.10.5", "0.11.2"))
        .await
        .unwrap();
    assert_eq!(action, Action::requeue(RESYNC_INTERVAL));

    let phases: Vec<String> = cluster
        .log()
        .into_iter()
        .filter(|l| l.starts_with("phase:") || l.starts_with("status:"))
        .collect();
    assert_eq!(
        phases,
        vec![
            "phase:Reconciling",
            "phase:Upgrading",
            "phase:Reconciling",
            "status:Reconciled@0.11.2",
        ]
    );
    assert_eq!(cluster.log().last().unwrap(), "event:Reconciled");

    let deployed = cluster.state().deployed.clone();
    assert!(deployed.iter().any(|spec| spec.version == "0.11.0"));
    assert!(deployed.iter().any(|spec| spec.version == "0.11.2"));
}

/// A failed upgrade leaves the resource in Upgrading with a message that
/// asks for a human, and nothing is applied at the desired version.
#[tokio::test]
async fn test_failed_upgrade_stays_upgrading() {
    let cluster =
        MockCluster::running_at("0.10.5").with_migration(MigrationBehavior::CrashLoops);
    let reconciler = cluster.reconciler(Arc::new(ManualClock::new()));

    let err = reconciler
        .reconcile_version(&astarte(ReconciliationPhase::Reconciled, "0.10.5", "0.11.2"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UpgradeStep {
            remediation: Remediation::ManualIntervention,
            ..
        }
    ));

    let state = cluster.state();
    assert_eq!(state.phase, ReconciliationPhase::Upgrading);
    assert_eq!(state.version, "0.10.5");
    let message = state.message.clone().unwrap();
    assert!(message.contains("manual intervention"), "{message}");
    assert!(!state.log.iter().any(|l| l == "phase:Failed"));
    assert!(!state.log.iter().any(|l| l.starts_with("status:")));
    assert!(!state.log.iter().any(|l| l == "deploy:vernemq@0.11.2"));
}

/// Setting spec.version back to the committed version while Upgrading
/// closes the upgrade and reconciles at that version.
#[tokio::test]
async fn test_version_set_back_mid_upgrade_settles() {
    let cluster = MockCluster::running_at("0.10.5");
    cluster.state().phase = ReconciliationPhase::Upgrading;
    let reconciler = cluster.reconciler(Arc::new(ManualClock::new()));

    let action = reconciler
        .reconcile_version(&astarte(ReconciliationPhase::Upgrading, "0.10.5", "0.10.5"))
        .await
        .unwrap();
    assert_eq!(action, Action::requeue(RESYNC_INTERVAL));

    let log = cluster.log();
    assert_eq!(log[0], "phase:Reconciling");
    assert_eq!(log[1], "deploy:vernemq@0.10.5");
    assert!(!log.iter().any(|l| l.starts_with("scale:")), "no procedure ran");
    assert_eq!(position(&log, "status:Reconciled@0.10.5"), log.len() - 2);
    assert_eq!(cluster.state().phase, ReconciliationPhase::Reconciled);
}

/// A downgrade is refused and marks the resource Failed.
#[tokio::test]
async fn test_downgrade_fails_the_pass() {
    let cluster = MockCluster::running_at("1.0.0");
    let reconciler = cluster.reconciler(Arc::new(ManualClock::new()));

    let err = reconciler
        .reconcile_version(&astarte(ReconciliationPhase::Reconciled, "1.0.0", "0.11.4"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let state = cluster.state();
    assert_eq!(state.log, vec!["phase:Failed", "event:ReconcileFailed"]);
    assert_eq!(state.phase, ReconciliationPhase::Failed);
    assert!(state.message.clone().unwrap().contains("downgrading"));
}
