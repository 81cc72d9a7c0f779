//! Admission policies for `Astarte` resources.
//!
//! Policies run in tier order and the first denial wins. Version checks
//! apply to every write; upgrade protection only when an old object exists.

pub mod upgrade_protection;
pub mod version;

use crate::crd::Astarte;

/// Outcome of one policy.
#[derive(Debug)]
pub struct ValidationResult {
    pub allowed: bool,
    /// Machine-readable denial reason, e.g. `DowngradeNotSupported`
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
        }
    }

    pub fn denied(reason: &str, message: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }
}

/// The object under review, and the stored one on UPDATE.
pub struct ValidationContext<'a> {
    pub resource: &'a Astarte,
    pub old_resource: Option<&'a Astarte>,
}

impl ValidationContext<'_> {
    pub fn is_update(&self) -> bool {
        self.old_resource.is_some()
    }
}

type Policy = fn(&ValidationContext<'_>) -> ValidationResult;

/// `(update_only, policy)` in evaluation order.
const TIERS: &[(bool, Policy)] = &[
    (false, version::validate),
    (true, upgrade_protection::validate),
];

/// Run every applicable policy, stopping at the first denial.
pub fn validate_all(ctx: &ValidationContext<'_>) -> ValidationResult {
    TIERS
        .iter()
        .filter(|(update_only, _)| !update_only || ctx.is_update())
        .map(|(_, policy)| policy(ctx))
        .find(|result| !result.allowed)
        .unwrap_or_else(ValidationResult::allowed)
}
