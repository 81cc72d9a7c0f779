//! Diagnostic hints for failed upgrade steps.
//!
//! Provides actionable kubectl commands that operators can run when an
//! upgrade step fails and is unlikely to recover on its own.

use std::fmt;

use crate::controller::upgrade_steps::StepKind;

/// Maximum size of a Kubernetes event note.
pub const EVENT_NOTE_LIMIT: usize = 1024;

/// A diagnostic command that can be run to investigate an issue.
#[derive(Debug, Clone)]
pub struct DiagnosticCommand {
    /// Description of what this command checks.
    pub description: &'static str,
    /// The actual command to run.
    pub command: String,
}

impl DiagnosticCommand {
    fn new(description: &'static str, command: impl Into<String>) -> Self {
        Self {
            description,
            command: command.into(),
        }
    }
}

/// Diagnostic hint for a failed step.
#[derive(Debug, Clone)]
pub struct DiagnosticHint {
    /// Summary of the likely issue.
    pub summary: &'static str,
    /// Common causes of this issue.
    pub common_causes: Vec<&'static str>,
    /// Commands to run to diagnose the issue.
    pub commands: Vec<DiagnosticCommand>,
}

impl DiagnosticHint {
    /// Generate a diagnostic hint for a failed upgrade step.
    pub fn for_step(step: StepKind, namespace: &str, name: &str) -> Self {
        match step {
            StepKind::ShutdownBroker => Self::shutdown_broker(namespace, name),
            StepKind::DrainQueue => Self::drain_queue(namespace, name),
            StepKind::MigrateBackingStore => Self::migrate_backing_store(namespace, name),
            StepKind::MigrateQueueTopology => Self::migrate_queue_topology(namespace, name),
            StepKind::PersistVersion => Self::persist_version(namespace, name),
            StepKind::RestoreScale => Self::restore_scale(namespace, name),
        }
    }

    fn shutdown_broker(namespace: &str, name: &str) -> Self {
        Self {
            summary: "VerneMQ broker pods are not terminating",
            common_causes: vec![
                "Pods stuck in Terminating (finalizers, unreachable node)",
                "Another controller scaling the StatefulSet back up",
            ],
            commands: vec![
                DiagnosticCommand::new(
                    "Check broker StatefulSet",
                    format!("kubectl get statefulset {name}-vernemq -n {namespace} -o wide"),
                ),
                DiagnosticCommand::new(
                    "Check broker pods",
                    format!(
                        "kubectl get pods -n {namespace} -l app.kubernetes.io/instance={name},app.kubernetes.io/component=vernemq"
                    ),
                ),
            ],
        }
    }

    fn drain_queue(namespace: &str, name: &str) -> Self {
        Self {
            summary: "Broker data queue is not draining",
            common_causes: vec![
                "No consumer attached to the queue (Data Updater Plant down)",
                "RabbitMQ management API unreachable or credentials wrong",
                "RabbitMQ version with an incompatible management API",
            ],
            commands: vec![
                DiagnosticCommand::new(
                    "Check RabbitMQ pods",
                    format!(
                        "kubectl get pods -n {namespace} -l app.kubernetes.io/instance={name},app.kubernetes.io/component=rabbitmq"
                    ),
                ),
                DiagnosticCommand::new(
                    "Inspect queue depth",
                    format!(
                        "kubectl exec -n {namespace} {name}-rabbitmq-0 -- rabbitmqctl list_queues name messages_ready consumers"
                    ),
                ),
                DiagnosticCommand::new(
                    "Check credentials Secret",
                    format!("kubectl get secret {name}-rabbitmq-user-credentials -n {namespace}"),
                ),
            ],
        }
    }

    fn migrate_backing_store(namespace: &str, name: &str) -> Self {
        Self {
            summary: "Database migration by housekeeping did not complete",
            common_causes: vec![
                "Migration crashing (CrashLoopBackOff), often a database schema problem",
                "Database (Cassandra/Scylla) unreachable",
                "Insufficient resources for the migration pod",
            ],
            commands: vec![
                DiagnosticCommand::new(
                    "Check housekeeping pods",
                    format!(
                        "kubectl get pods -n {namespace} -l app.kubernetes.io/instance={name},app.kubernetes.io/component=housekeeping"
                    ),
                ),
                DiagnosticCommand::new(
                    "Check migration logs",
                    format!("kubectl logs -n {namespace} deployment/{name}-housekeeping --previous"),
                ),
                DiagnosticCommand::new(
                    "Check events in namespace",
                    format!(
                        "kubectl get events -n {namespace} --sort-by='.lastTimestamp' | tail -20"
                    ),
                ),
            ],
        }
    }

    fn migrate_queue_topology(namespace: &str, name: &str) -> Self {
        Self {
            summary: "Data Updater Plant did not become ready at the new version",
            common_causes: vec![
                "Image not available for the target version (ImagePullBackOff)",
                "RabbitMQ unreachable from Data Updater Plant",
            ],
            commands: vec![
                DiagnosticCommand::new(
                    "Check Data Updater Plant rollout",
                    format!(
                        "kubectl rollout status deployment/{name}-data-updater-plant -n {namespace}"
                    ),
                ),
                DiagnosticCommand::new(
                    "Check Data Updater Plant logs",
                    format!("kubectl logs -n {namespace} deployment/{name}-data-updater-plant"),
                ),
            ],
        }
    }

    fn persist_version(namespace: &str, name: &str) -> Self {
        Self {
            summary: "Could not write the upgraded version to the Astarte status",
            common_causes: vec![
                "Operator lacks RBAC permission on astartes/status",
                "API server unavailable",
            ],
            commands: vec![
                DiagnosticCommand::new(
                    "Check Astarte status",
                    format!("kubectl get astarte {name} -n {namespace} -o yaml"),
                ),
                DiagnosticCommand::new(
                    "Check operator permissions",
                    format!(
                        "kubectl auth can-i patch astartes/status -n {namespace} --as=system:serviceaccount:{namespace}:astarte-operator"
                    ),
                ),
            ],
        }
    }

    fn restore_scale(namespace: &str, name: &str) -> Self {
        Self {
            summary: "Migration housekeeping instance was not scaled down",
            common_causes: vec!["Pods stuck in Terminating"],
            commands: vec![DiagnosticCommand::new(
                "Check housekeeping deployment",
                format!("kubectl get deployment {name}-housekeeping -n {namespace} -o wide"),
            )],
        }
    }

    /// Single-line form that fits in an event note.
    pub fn compact(&self) -> String {
        let commands = self
            .commands
            .iter()
            .map(|c| c.command.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        truncate(&format!("{}. Try: {}", self.summary, commands), EVENT_NOTE_LIMIT)
    }
}

/// Truncate to at most `limit` bytes on a char boundary.
pub fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.get(..end).unwrap_or_default().to_string()
}

impl fmt::Display for DiagnosticHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Issue: {}", self.summary)?;
        writeln!(f)?;
        writeln!(f, "Common causes:")?;
        for cause in &self.common_causes {
            writeln!(f, "  - {cause}")?;
        }
        writeln!(f)?;
        writeln!(f, "Diagnostic commands:")?;
        for (i, cmd) in self.commands.iter().enumerate() {
            writeln!(f, "  {}. {}", i + 1, cmd.description)?;
            writeln!(f, "     $ {}", cmd.command)?;
        }
        Ok(())
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

    const ALL_STEPS: [StepKind; 6] = [
        StepKind::ShutdownBroker,
        StepKind::DrainQueue,
        StepKind::MigrateBackingStore,
        StepKind::MigrateQueueTopology,
        StepKind::PersistVersion,
        StepKind::RestoreScale,
    ];

    #[test]
    fn test_all_steps_have_hints() {
        for step in ALL_STEPS {
            let hint = DiagnosticHint::for_step(step, "test-ns", "astarte");
            assert!(!hint.summary.is_empty(), "{step} has empty summary");
            assert!(!hint.commands.is_empty(), "{step} has no commands");
            for cmd in &hint.commands {
                assert!(cmd.command.contains("test-ns"), "{}", cmd.command);
            }
        }
    }

    #[test]
    fn test_compact_fits_event_note() {
        for step in ALL_STEPS {
            let hint = DiagnosticHint::for_step(step, "a-rather-long-namespace", "astarte");
            let note = hint.compact();
            assert!(note.len() <= EVENT_NOTE_LIMIT);
            assert!(note.contains("kubectl"));
        }
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate("0.10→0.11", 5), "0.10");
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn test_display_format() {
        let hint = DiagnosticHint::for_step(StepKind::MigrateBackingStore, "default", "astarte");
        let output = hint.to_string();
        assert!(output.contains("Issue:"));
        assert!(output.contains("Common causes:"));
        assert!(output.contains("kubectl logs -n default deployment/astarte-housekeeping"));
    }
}
