//! Common resource generation utilities.
//!
//! Labels, owner references and resource-requirement helpers shared by the
//! Deployment and StatefulSet builders.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::{Astarte, ResourceRequirementsSpec, ResourceSpec};

/// Value of the managed-by label on every object this operator creates.
pub const MANAGED_BY: &str = "astarte-operator";

/// Standard labels applied to all managed resources of one component
pub fn standard_labels(astarte: &Astarte, component: &str) -> BTreeMap<String, String> {
    let mut labels = pod_selector_labels(astarte, component);
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    labels.insert(
        "app.kubernetes.io/part-of".to_string(),
        "astarte".to_string(),
    );

    for (key, value) in &astarte.spec.labels {
        labels.insert(key.clone(), value.clone());
    }

    labels
}

/// Labels used in selectors. Must stay stable across versions, since
/// workload selectors are immutable.
pub fn pod_selector_labels(astarte: &Astarte, component: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/instance".to_string(),
        astarte.name_any(),
    );
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        component.to_string(),
    );
    labels
}

/// Render labels as a label selector string
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Create owner reference for an Astarte resource
pub fn owner_reference(astarte: &Astarte) -> OwnerReference {
    OwnerReference {
        api_version: "api.astarte-platform.org/v1alpha2".to_string(),
        kind: "Astarte".to_string(),
        name: astarte.name_any(),
        uid: astarte.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Convert the CRD resource spec into Kubernetes resource requirements.
/// Returns `None` when nothing is set.
pub fn resource_requirements(spec: &ResourceRequirementsSpec) -> Option<ResourceRequirements> {
    fn to_map(spec: &ResourceSpec) -> Option<BTreeMap<String, Quantity>> {
        let mut map = BTreeMap::new();
        if let Some(cpu) = &spec.cpu {
            map.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &spec.memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        (!map.is_empty()).then_some(map)
    }

    let requests = to_map(&spec.requests);
    let limits = to_map(&spec.limits);
    if requests.is_none() && limits.is_none() {
        return None;
    }
    Some(ResourceRequirements {
        requests,
        limits,
        ..Default::default()
    })
}

/// Add two resource specs field by field.
///
/// A missing value on either side leaves the other side's value. Quantities
/// that cannot be parsed are not summed; the base value is kept.
pub fn sum_resources(
    base: &ResourceRequirementsSpec,
    extra: &ResourceRequirementsSpec,
) -> ResourceRequirementsSpec {
    fn sum_spec(base: &ResourceSpec, extra: &ResourceSpec) -> ResourceSpec {
        ResourceSpec {
            cpu: add_quantities(base.cpu.as_deref(), extra.cpu.as_deref()),
            memory: add_quantities(base.memory.as_deref(), extra.memory.as_deref()),
        }
    }

    ResourceRequirementsSpec {
        requests: sum_spec(&base.requests, &extra.requests),
        limits: sum_spec(&base.limits, &extra.limits),
    }
}

/// Add two Kubernetes quantity strings (e.g. `500m` + `1` = `1500m`).
pub fn add_quantities(a: Option<&str>, b: Option<&str>) -> Option<String> {
    match (a, b) {
        (None, None) => None,
        (Some(a), None) => Some(a.to_string()),
        (None, Some(b)) => Some(b.to_string()),
        (Some(a), Some(b)) => match (parse_quantity(a), parse_quantity(b)) {
            (Some(x), Some(y)) => match x.checked_add(y) {
                Some(sum) => Some(format_quantity(sum)),
                None => {
                    tracing::warn!(base = a, extra = b, "Quantity sum overflows, keeping base value");
                    Some(a.to_string())
                }
            },
            _ => {
                tracing::warn!(base = a, extra = b, "Cannot add quantities, keeping base value");
                Some(a.to_string())
            }
        },
    }
}

/// Parse a quantity into thousandths of its base unit (millicores, millibytes).
pub fn parse_quantity(quantity: &str) -> Option<u128> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);

    let milli_per_unit: u128 = match suffix {
        "" => 1_000,
        "m" => 1,
        "k" => 1_000_000,
        "M" => 1_000_000_000,
        "G" => 1_000_000_000_000,
        "T" => 1_000_000_000_000_000,
        "Ki" => 1_000 << 10,
        "Mi" => 1_000 << 20,
        "Gi" => 1_000 << 30,
        "Ti" => 1_000 << 40,
        _ => return None,
    };

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut value = whole.checked_mul(milli_per_unit)?;

    if !fraction.is_empty() {
        let digits = u32::try_from(fraction.len()).ok()?;
        let numerator: u128 = fraction.parse().ok()?;
        let denominator = 10u128.checked_pow(digits)?;
        value = value.checked_add(numerator.checked_mul(milli_per_unit)? / denominator)?;
    }

    Some(value)
}

/// Format thousandths of a base unit back into a quantity string.
pub fn format_quantity(milli: u128) -> String {
    if milli % 1_000 != 0 {
        return format!("{milli}m");
    }
    let base = milli / 1_000;
    for (suffix, factor) in [("Ti", 1u128 << 40), ("Gi", 1 << 30), ("Mi", 1 << 20), ("Ki", 1 << 10)] {
        if base >= factor && base % factor == 0 {
            return format!("{}{}", base / factor, suffix);
        }
    }
    base.to_string()
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
    use crate::crd::AstarteSpec;

    fn astarte() -> Astarte {
        let mut spec = AstarteSpec {
            version: "1.0.0".to_string(),
            ..Default::default()
        };
        spec.labels.insert("team".to_string(), "iot".to_string());
        let mut astarte = Astarte::new("example", spec);
        astarte.metadata.uid = Some("uid-1".to_string());
        astarte
    }

    #[test]
    fn test_standard_labels_include_user_labels() {
        let labels = standard_labels(&astarte(), "housekeeping");
        assert_eq!(labels["app.kubernetes.io/instance"], "example");
        assert_eq!(labels["app.kubernetes.io/component"], "housekeeping");
        assert_eq!(labels["app.kubernetes.io/managed-by"], MANAGED_BY);
        assert_eq!(labels["team"], "iot");
    }

    #[test]
    fn test_selector_string() {
        let labels = pod_selector_labels(&astarte(), "vernemq");
        assert_eq!(
            selector_string(&labels),
            "app.kubernetes.io/component=vernemq,app.kubernetes.io/instance=example"
        );
    }

    #[test]
    fn test_owner_reference() {
        let owner = owner_reference(&astarte());
        assert_eq!(owner.kind, "Astarte");
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("500m"), Some(500));
        assert_eq!(parse_quantity("1"), Some(1_000));
        assert_eq!(parse_quantity("1.5"), Some(1_500));
        assert_eq!(parse_quantity("0.25"), Some(250));
        assert_eq!(parse_quantity("1Ki"), Some(1_024_000));
        assert_eq!(parse_quantity("1G"), Some(1_000_000_000_000));
        assert_eq!(parse_quantity("abc"), None);
        assert_eq!(parse_quantity("1Xi"), None);
        assert_eq!(parse_quantity(""), None);
    }

    #[test]
    fn test_add_quantities() {
        assert_eq!(add_quantities(Some("500m"), Some("1")), Some("1500m".to_string()));
        assert_eq!(add_quantities(Some("1"), Some("1")), Some("2".to_string()));
        assert_eq!(
            add_quantities(Some("512Mi"), Some("1Gi")),
            Some("1536Mi".to_string())
        );
        assert_eq!(add_quantities(None, Some("256Mi")), Some("256Mi".to_string()));
        assert_eq!(add_quantities(Some("256Mi"), None), Some("256Mi".to_string()));
        assert_eq!(add_quantities(None, None), None);
        assert_eq!(add_quantities(Some("bogus"), Some("1")), Some("bogus".to_string()));
    }

    #[test]
    fn test_add_quantities_overflow_keeps_base() {
        let big = "200000000000000000000000000000000000";
        assert!(parse_quantity(big).is_some());
        assert_eq!(add_quantities(Some(big), Some(big)), Some(big.to_string()));
    }

    #[test]
    fn test_sum_resources() {
        let base = ResourceRequirementsSpec {
            requests: ResourceSpec {
                cpu: Some("100m".to_string()),
                memory: Some("256Mi".to_string()),
            },
            limits: ResourceSpec::default(),
        };
        let extra = ResourceRequirementsSpec {
            requests: ResourceSpec {
                cpu: Some("200m".to_string()),
                memory: Some("256Mi".to_string()),
            },
            limits: ResourceSpec {
                cpu: Some("1".to_string()),
                memory: None,
            },
        };

        let sum = sum_resources(&base, &extra);
        assert_eq!(sum.requests.cpu.as_deref(), Some("300m"));
        assert_eq!(sum.requests.memory.as_deref(), Some("512Mi"));
        assert_eq!(sum.limits.cpu.as_deref(), Some("1"));
        assert_eq!(sum.limits.memory, None);
    }

    #[test]
    fn test_resource_requirements_empty_is_none() {
        assert!(resource_requirements(&ResourceRequirementsSpec::default()).is_none());

        let spec = ResourceRequirementsSpec {
            requests: ResourceSpec {
                cpu: Some("100m".to_string()),
                memory: None,
            },
            limits: ResourceSpec::default(),
        };
        let requirements = resource_requirements(&spec).unwrap();
        assert_eq!(requirements.requests.unwrap()["cpu"], Quantity("100m".to_string()));
        assert!(requirements.limits.is_none());
    }
}
