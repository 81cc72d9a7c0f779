//! Resource generation module.
//!
//! Contains utilities for generating and operating the Kubernetes resources
//! owned by an Astarte installation.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | Deployment | One per Astarte microservice |
//! | StatefulSet | VerneMQ broker |

pub mod common;
pub mod deployment;
pub mod port_forward;
pub mod statefulset;
pub mod workloads;

// Re-export commonly used items from common
pub use common::{owner_reference, standard_labels};
