//! Custom Resource Definitions (CRDs) for astarte-operator.
//!
//! - `Astarte`: an Astarte installation, reconciled and upgraded across
//!   version transitions by the operator

mod astarte;

pub use astarte::*;
