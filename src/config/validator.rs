//! Validation of desired-state documents.
//!
//! This module checks a document for problems that can be reported before
//! any graph is built: malformed names, conflicting repetition specifiers,
//! unusable settings and empty provisioners.

use crate::error::{ConfigError, ConvergeError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{
    ConnectionMethod, DesiredDocument, EngineSettings, ModuleDeclaration, ResourceDeclaration,
    ResourceKind, StateBackend, StateConfig,
};

/// Names that cannot be used as resource types.
const RESERVED_TYPES: &[&str] = &["module", "self", "count", "each"];

/// Validator for desired-state documents.
#[derive(Debug, Default)]
pub struct DocumentValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl DocumentValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a document, returning every finding.
    #[must_use]
    pub fn check(&self, document: &DesiredDocument) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_settings(&document.settings, &mut result);
        Self::validate_state(&document.state, &mut result);

        if document.declaration_count() == 0 {
            result.warnings.push(String::from(
                "No resources declared; apply will destroy everything in state",
            ));
        }

        Self::validate_module("", &document.resources, &document.modules, &mut result);

        result
    }

    /// Validates a document.
    ///
    /// # Errors
    ///
    /// Returns the first error if validation fails.
    pub fn validate(&self, document: &DesiredDocument) -> Result<ValidationResult> {
        let result = self.check(document);

        if result.errors.is_empty() {
            debug!("Document validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(ConvergeError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Validates engine settings.
    fn validate_settings(settings: &EngineSettings, result: &mut ValidationResult) {
        if settings.parallelism == 0 {
            result.errors.push(ValidationError {
                field: String::from("settings.parallelism"),
                message: String::from("Parallelism must be at least 1"),
            });
        } else if settings.parallelism > 256 {
            result.warnings.push(format!(
                "settings.parallelism: {} concurrent steps is unusually high",
                settings.parallelism
            ));
        }

        if settings.lock_holder.as_ref().is_some_and(|h| h.trim().is_empty()) {
            result.errors.push(ValidationError {
                field: String::from("settings.lock_holder"),
                message: String::from("Lock holder cannot be blank"),
            });
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result.warnings.push(String::from(
                        "state.bucket is ignored by the local backend",
                    ));
                }
            }
        }
    }

    /// Validates the declarations of one module and recurses into children.
    fn validate_module(
        prefix: &str,
        resources: &[ResourceDeclaration],
        modules: &[ModuleDeclaration],
        result: &mut ValidationResult,
    ) {
        let mut seen = HashSet::new();
        for (i, resource) in resources.iter().enumerate() {
            let field = format!("{prefix}resources[{i}]");

            if !seen.insert((&resource.resource_type, &resource.name)) {
                result.errors.push(ValidationError {
                    field: format!("{field}.name"),
                    message: format!(
                        "Duplicate declaration: {}.{}",
                        resource.resource_type, resource.name
                    ),
                });
            }

            Self::validate_resource(resource, &field, result);
        }

        let mut module_names = HashSet::new();
        for (i, module) in modules.iter().enumerate() {
            let field = format!("{prefix}modules[{i}]");

            if !is_valid_name(&module.name) {
                result.errors.push(ValidationError {
                    field: format!("{field}.name"),
                    message: format!("Module name '{}' is invalid", module.name),
                });
            }
            if !module_names.insert(&module.name) {
                result.errors.push(ValidationError {
                    field: format!("{field}.name"),
                    message: format!("Duplicate module name: {}", module.name),
                });
            }

            Self::validate_module(&format!("{field}."), &module.resources, &module.modules, result);
        }
    }

    /// Validates a single resource declaration.
    fn validate_resource(
        resource: &ResourceDeclaration,
        field: &str,
        result: &mut ValidationResult,
    ) {
        if !is_valid_name(&resource.resource_type) || resource.resource_type.contains('-') {
            result.errors.push(ValidationError {
                field: format!("{field}.type"),
                message: format!(
                    "Resource type '{}' must be lowercase alphanumeric with underscores",
                    resource.resource_type
                ),
            });
        } else if RESERVED_TYPES.contains(&resource.resource_type.as_str()) {
            result.errors.push(ValidationError {
                field: format!("{field}.type"),
                message: format!("Resource type '{}' is reserved", resource.resource_type),
            });
        }

        if !is_valid_name(&resource.name) {
            result.errors.push(ValidationError {
                field: format!("{field}.name"),
                message: format!(
                    "Resource name '{}' is invalid. Must start with a lowercase letter.",
                    resource.name
                ),
            });
        }

        if resource.count.is_some() && resource.for_each.is_some() {
            result.errors.push(ValidationError {
                field: field.to_string(),
                message: String::from("count and for_each cannot be used together"),
            });
        }

        if resource.count == Some(0) {
            result.warnings.push(format!(
                "{field}.count: count is 0, no instances will exist"
            ));
        }

        let lifecycle = &resource.lifecycle;
        for attribute in &lifecycle.force_new {
            if lifecycle.ignore_changes.contains(attribute) {
                result.warnings.push(format!(
                    "{field}.lifecycle: ignore_changes overrides force_new for '{attribute}'"
                ));
            }
        }
        for attribute in lifecycle.force_new.iter().chain(&lifecycle.ignore_changes) {
            if !resource.attributes.contains_key(attribute) {
                result.warnings.push(format!(
                    "{field}.lifecycle: '{attribute}' is not a declared attribute"
                ));
            }
        }

        if resource.kind == ResourceKind::Trigger && !lifecycle.force_new.is_empty() {
            result.warnings.push(format!(
                "{field}.lifecycle.force_new: triggers are replaced on any change"
            ));
        }

        for (i, provisioner) in resource.provisioners.iter().enumerate() {
            if provisioner.commands.is_empty() {
                result.errors.push(ValidationError {
                    field: format!("{field}.provisioners[{i}].commands"),
                    message: String::from("Provisioner must list at least one command"),
                });
            }
            if provisioner.commands.iter().any(|c| c.trim().is_empty()) {
                result.errors.push(ValidationError {
                    field: format!("{field}.provisioners[{i}].commands"),
                    message: String::from("Provisioner commands cannot be blank"),
                });
            }
            if provisioner.connection.method == ConnectionMethod::Ssh
                && provisioner.connection.host.is_none()
            {
                result.errors.push(ValidationError {
                    field: format!("{field}.provisioners[{i}].connection.host"),
                    message: String::from("SSH connections require a host"),
                });
            }
            if provisioner.connection.timeout_secs == 0 {
                result.errors.push(ValidationError {
                    field: format!("{field}.provisioners[{i}].connection.timeout_secs"),
                    message: String::from("Timeout must be at least 1 second"),
                });
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names start with a lowercase letter and continue with lowercase
/// alphanumerics, underscores or hyphens.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
