//! Webhook module for validating admission requests.
//!
//! This module provides a ValidatingAdmissionWebhook for Astarte with tiered
//! validation policies:
//! - Tier 1 (Critical): Always enforced (version parses and is manageable)
//! - Tier 2 (Update): Only on UPDATE operations (upgrade protection)

pub mod policies;
mod server;

pub use policies::{ValidationContext, ValidationResult};
pub use server::{
    VALIDATE_PATH, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError,
    run_webhook_server,
};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
