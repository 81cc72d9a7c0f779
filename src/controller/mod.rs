//! Controller module for astarte-operator.
//!
//! Contains the reconciliation loop, the phase state machine, status
//! management, and the upgrade orchestration engine that moves an
//! installation across version transitions.

// Shared modules
pub mod context;
pub mod error;
pub mod state_machine;
pub mod status;

// Astarte controller
pub mod reconciler;

// Upgrade orchestration
pub mod diagnostic_hints;
pub mod poll;
pub mod upgrade_engine;
pub mod upgrade_steps;
pub mod upgrade_transitions;
pub mod version;
