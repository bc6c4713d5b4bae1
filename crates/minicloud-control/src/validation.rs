//! Provision request validation.
//!
//! Every rule is checked; violations are collected rather than failing on
//! the first one.

use minicloud_store::InstanceSpec;

/// Smallest accepted memory size.
pub const MIN_MEMORY_MB: u32 = 512;
/// Largest accepted memory size.
pub const MAX_MEMORY_MB: u32 = 32_768;
/// Smallest accepted CPU count.
pub const MIN_CPU: u32 = 1;
/// Largest accepted CPU count.
pub const MAX_CPU: u32 = 16;

/// Limits a spec is validated against.
#[derive(Debug, Clone)]
pub struct ValidationRules {
    /// Images instances may boot from.
    pub allowed_images: Vec<String>,
    /// Maximum non-terminated instances per project.
    pub max_instances_per_project: u32,
}

/// Validate `spec` for a project that currently has `active_instances`
/// non-terminated instances (not counting the one being validated).
///
/// Returns the list of violations; empty means valid.
#[must_use]
pub fn validate_spec(spec: &InstanceSpec, active_instances: u32, rules: &ValidationRules) -> Vec<String> {
    let mut errors = Vec::new();

    if spec.name.trim().is_empty() {
        errors.push("Instance name is required".to_string());
    }
    if spec.memory_mb < MIN_MEMORY_MB {
        errors.push("Minimum memory is 512MB".to_string());
    }
    if spec.memory_mb > MAX_MEMORY_MB {
        errors.push("Maximum memory is 32GB".to_string());
    }
    if spec.cpu < MIN_CPU {
        errors.push("Minimum 1 CPU required".to_string());
    }
    if spec.cpu > MAX_CPU {
        errors.push("Maximum 16 CPUs allowed".to_string());
    }
    if active_instances >= rules.max_instances_per_project {
        errors.push(format!(
            "Instance quota exceeded ({})",
            rules.max_instances_per_project
        ));
    }
    if !rules.allowed_images.iter().any(|image| *image == spec.image) {
        errors.push(format!(
            "Image not allowed. Use: [{}]",
            rules.allowed_images.join(", ")
        ));
    }

    errors
}
