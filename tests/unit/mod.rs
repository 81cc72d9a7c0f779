// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for astarte-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation.

#[path = "../common/mod.rs"]
mod common;

mod crd_tests {
    use astarte_operator::crd::{Astarte, AstarteSpec, Condition, ReconciliationPhase};

    #[test]
    fn test_phase_display() {
        assert_eq!(ReconciliationPhase::Unknown.to_string(), "Unknown");
        assert_eq!(ReconciliationPhase::Reconciling.to_string(), "Reconciling");
        assert_eq!(ReconciliationPhase::Upgrading.to_string(), "Upgrading");
        assert_eq!(ReconciliationPhase::Reconciled.to_string(), "Reconciled");
        assert_eq!(ReconciliationPhase::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_phase_default() {
        assert_eq!(ReconciliationPhase::default(), ReconciliationPhase::Unknown);
    }

    #[test]
    fn test_status_wire_names() {
        let astarte: Astarte = serde_json::from_value(serde_json::json!({
            "apiVersion": "api.astarte-platform.org/v1alpha2",
            "kind": "Astarte",
            "metadata": { "name": "astarte", "namespace": "astarte" },
            "spec": { "version": "0.11.2" },
            "status": {
                "astarteVersion": "0.10.5",
                "reconciliationPhase": "Upgrading"
            }
        }))
        .unwrap();

        assert_eq!(astarte.reconciled_version(), Some("0.10.5"));
        assert_eq!(astarte.reconciliation_phase(), ReconciliationPhase::Upgrading);
    }

    #[test]
    fn test_missing_status_reads_as_unknown() {
        let astarte = Astarte::new(
            "astarte",
            AstarteSpec {
                version: "1.0.0".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(astarte.reconciled_version(), None);
        assert_eq!(astarte.reconciliation_phase(), ReconciliationPhase::Unknown);
    }

    #[test]
    fn test_condition_ready() {
        let condition = Condition::ready(true, "Reconciled", "Astarte 1.0.0 is reconciled", Some(1));
        assert_eq!(condition.r#type, "Ready");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, "Reconciled");
        assert_eq!(condition.observed_generation, Some(1));
    }

    #[test]
    fn test_condition_upgrading() {
        let condition = Condition::upgrading(true, "UpgradeInProgress", "0.10→0.11", Some(2));
        assert_eq!(condition.r#type, "Upgrading");
        assert_eq!(condition.status, "True");
    }
}

mod state_machine_tests {
    use astarte_operator::controller::state_machine::{
        PhaseEvent, PhaseStateMachine, TransitionContext, TransitionResult,
    };
    use astarte_operator::crd::ReconciliationPhase;

    #[test]
    fn test_full_upgrade_pass() {
        let sm = PhaseStateMachine::new();
        let pending = TransitionContext::new("0.11.2", "0.10.5").with_upgrade_pending(true);
        let landed = TransitionContext::new("0.11.2", "0.11.2");

        let mut phase = ReconciliationPhase::Reconciled;
        for (event, ctx) in [
            (PhaseEvent::ReconcileStarted, &pending),
            (PhaseEvent::UpgradeSelected, &pending),
            (PhaseEvent::UpgradeCompleted, &landed),
            (PhaseEvent::ReconcileSucceeded, &landed),
        ] {
            phase = sm
                .transition(&phase, event, ctx)
                .target()
                .unwrap_or_else(|| panic!("{event} rejected from {phase}"));
        }
        assert_eq!(phase, ReconciliationPhase::Reconciled);
    }

    #[test]
    fn test_failed_upgrade_stays_upgrading() {
        let sm = PhaseStateMachine::new();
        let ctx = TransitionContext::new("0.11.2", "0.10.5").with_upgrade_pending(true);
        let result = sm.transition(
            &ReconciliationPhase::Upgrading,
            PhaseEvent::ReconcileFailed,
            &ctx,
        );
        assert!(matches!(result, TransitionResult::InvalidTransition { .. }));
    }

    #[test]
    fn test_success_guarded_by_committed_version() {
        let sm = PhaseStateMachine::new();
        let ctx = TransitionContext::new("1.0.0", "0.11.0");
        let result = sm.transition(
            &ReconciliationPhase::Reconciling,
            PhaseEvent::ReconcileSucceeded,
            &ctx,
        );
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));
    }

    #[test]
    fn test_upgrading_only_resumes_or_completes() {
        let sm = PhaseStateMachine::new();
        let ctx = TransitionContext::new("0.11.2", "0.11.2").with_upgrade_pending(true);
        let accepted: Vec<PhaseEvent> = [
            PhaseEvent::ReconcileStarted,
            PhaseEvent::UpgradeSelected,
            PhaseEvent::UpgradeResumed,
            PhaseEvent::UpgradeCompleted,
            PhaseEvent::ReconcileSucceeded,
            PhaseEvent::ReconcileFailed,
        ]
        .into_iter()
        .filter(|event| {
            sm.transition(&ReconciliationPhase::Upgrading, *event, &ctx)
                .target()
                .is_some()
        })
        .collect();
        assert_eq!(
            accepted,
            vec![PhaseEvent::UpgradeResumed, PhaseEvent::UpgradeCompleted]
        );
    }

    #[test]
    fn test_every_phase_can_start_a_pass_except_upgrading() {
        let sm = PhaseStateMachine::new();
        for phase in ReconciliationPhase::ALL {
            let ctx = TransitionContext::default();
            assert_eq!(
                sm.transition(&phase, PhaseEvent::ReconcileStarted, &ctx)
                    .target()
                    .is_some(),
                phase != ReconciliationPhase::Upgrading,
                "{phase}"
            );
        }
    }
}

mod version_tests {
    use astarte_operator::controller::version::{
        AstarteVersion, is_downgrade, is_manageable_with, satisfies,
    };
    use semver::Version;

    fn v(s: &str) -> AstarteVersion {
        AstarteVersion::parse(s).unwrap()
    }

    #[test]
    fn test_short_versions_expand() {
        assert_eq!(v("1").comparable(), Some(Version::new(1, 0, 0)));
        assert_eq!(v("0.11").comparable(), Some(Version::new(0, 11, 0)));
        assert_eq!(v("v1.0.2").comparable(), Some(Version::new(1, 0, 2)));
    }

    #[test]
    fn test_prerelease_ignored_in_constraints() {
        assert!(satisfies("1.0.0-rc.1", ">= 1.0.0").unwrap());
        assert!(!satisfies("0.11.0-beta.2", "< 0.11.0").unwrap());
    }

    #[test]
    fn test_snapshot_satisfies_nothing() {
        assert!(!satisfies("snapshot", ">= 0.0.0").unwrap());
        assert!(v("1.1-snapshot").is_snapshot());
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(AstarteVersion::parse("").is_err());
        assert!(AstarteVersion::parse("latest").is_err());
        assert!(satisfies("1.0.0", ">= banana").is_err());
    }

    #[test]
    fn test_downgrade_detection() {
        assert!(is_downgrade(&v("1.0.0"), &v("0.11.4")));
        assert!(!is_downgrade(&v("0.11.4"), &v("1.0.0")));
        assert!(!is_downgrade(&v("1.0.0"), &v("1.0.0-rc.1")));
        assert!(!is_downgrade(&v("1.0.0"), &v("snapshot")));
    }

    #[test]
    fn test_manageability() {
        let stable = Version::new(1, 0, 0);
        let prerelease = Version::parse("1.1.0-dev").unwrap();

        assert!(is_manageable_with(&v("0.10.2"), &stable));
        assert!(is_manageable_with(&v("1.0.3"), &stable));
        assert!(!is_manageable_with(&v("0.9.9"), &stable));
        assert!(!is_manageable_with(&v("1.1.0"), &stable));
        assert!(!is_manageable_with(&v("snapshot"), &stable));
        assert!(is_manageable_with(&v("snapshot"), &prerelease));
    }
}

mod transition_tests {
    use astarte_operator::controller::upgrade_steps::StepKind;
    use astarte_operator::controller::upgrade_transitions::{
        default_transitions, select_transitions,
    };
    use astarte_operator::controller::version::AstarteVersion;

    fn selected(old: &str, new: &str) -> Vec<(String, String)> {
        let table = default_transitions().unwrap();
        select_transitions(
            &table,
            &AstarteVersion::parse(old).unwrap(),
            &AstarteVersion::parse(new).unwrap(),
        )
        .into_iter()
        .map(|t| (t.name.clone(), t.landing_version.clone()))
        .collect()
    }

    #[test]
    fn test_hops_and_landing_versions() {
        assert_eq!(
            selected("0.10.5", "0.11.2"),
            vec![("0.10→0.11".to_string(), "0.11.0".to_string())]
        );
        assert_eq!(
            selected("0.11.4", "1.0.1"),
            vec![("0.11→1.0".to_string(), "1.0.0".to_string())]
        );
    }

    #[test]
    fn test_no_transition_within_a_range() {
        assert!(selected("0.10.0", "0.10.5").is_empty());
        assert!(selected("1.0.0", "1.0.3").is_empty());
    }

    #[test]
    fn test_procedures_differ_in_order() {
        let table = default_transitions().unwrap();
        assert_eq!(table[0].procedure.kinds()[0], StepKind::ShutdownBroker);
        assert_eq!(table[1].procedure.kinds()[0], StepKind::MigrateBackingStore);
    }
}

mod diagnostic_hint_tests {
    use astarte_operator::controller::diagnostic_hints::{DiagnosticHint, EVENT_NOTE_LIMIT};
    use astarte_operator::controller::upgrade_steps::StepKind;

    #[test]
    fn test_hint_targets_installation() {
        let hint = DiagnosticHint::for_step(StepKind::DrainQueue, "iot", "prod");
        let compact = hint.compact();
        assert!(compact.contains("-n iot"), "{compact}");
        assert!(compact.contains("prod-rabbitmq"), "{compact}");
        assert!(compact.len() <= EVENT_NOTE_LIMIT);
    }
}

mod error_tests {
    use astarte_operator::controller::error::{Error, Remediation};
    use astarte_operator::controller::upgrade_steps::StepKind;

    #[test]
    fn test_user_message_states_remediation() {
        let err = Error::UpgradeStep {
            transition: "0.10→0.11".to_string(),
            step: StepKind::DrainQueue,
            reason: "timed out after 60s".to_string(),
            remediation: Remediation::AutomaticRetry,
        };
        let message = err.user_message();
        assert!(message.contains("DrainQueue"), "{message}");
        assert!(message.ends_with("(will retry automatically)"), "{message}");
    }

    #[test]
    fn test_validation_errors_need_a_user() {
        let err = Error::Validation("downgrading from 1.0.0 to 0.11.4 is not supported".into());
        assert!(!err.is_retryable());
        assert_eq!(err.remediation(), Remediation::ManualIntervention);
    }
}

mod status_tests {
    use astarte_operator::controller::status::ConditionBuilder;

    #[test]
    fn test_condition_builder() {
        let mut builder = ConditionBuilder::new();
        builder
            .ready(true, "Reconciled", "done", Some(1))
            .upgrading(false, "NoUpgradePending", "", Some(1));
        let conditions = builder.build();

        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].r#type, "Ready");
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[1].r#type, "Upgrading");
        assert_eq!(conditions[1].status, "False");
    }
}

mod webhook_tests {
    use astarte_operator::crd::ReconciliationPhase;
    use astarte_operator::webhooks::policies::{ValidationContext, validate_all};

    use crate::common::AstarteBuilder;

    #[test]
    fn test_create_with_unparseable_version_denied() {
        let astarte = AstarteBuilder::new("astarte").version("latest").build();
        let ctx = ValidationContext {
            resource: &astarte,
            old_resource: None,
        };
        let result = validate_all(&ctx);
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("InvalidVersion"));
    }

    #[test]
    fn test_upgrade_allowed_when_reconciled() {
        let old = AstarteBuilder::new("astarte")
            .version("0.10.5")
            .reconciled("0.10.5")
            .phase(ReconciliationPhase::Reconciled)
            .build();
        let new = AstarteBuilder::new("astarte").version("0.11.2").build();
        let ctx = ValidationContext {
            resource: &new,
            old_resource: Some(&old),
        };
        assert!(validate_all(&ctx).allowed);
    }

    #[test]
    fn test_retarget_during_upgrade_denied() {
        let old = AstarteBuilder::new("astarte")
            .version("0.11.2")
            .reconciled("0.10.5")
            .phase(ReconciliationPhase::Upgrading)
            .build();
        let new = AstarteBuilder::new("astarte").version("1.0.0").build();
        let ctx = ValidationContext {
            resource: &new,
            old_resource: Some(&old),
        };
        let result = validate_all(&ctx);
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("UpgradeInProgress"));
    }

    #[test]
    fn test_downgrade_below_reconciled_denied() {
        let old = AstarteBuilder::new("astarte")
            .version("1.0.0")
            .reconciled("1.0.0")
            .phase(ReconciliationPhase::Reconciled)
            .build();
        let new = AstarteBuilder::new("astarte").version("0.11.4").build();
        let ctx = ValidationContext {
            resource: &new,
            old_resource: Some(&old),
        };
        let result = validate_all(&ctx);
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("DowngradeNotSupported"));
    }
}
