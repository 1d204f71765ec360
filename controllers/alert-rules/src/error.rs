//! Controller-specific error types.
//!
//! This module defines error types specific to the alert rules controller
//! that are not covered by upstream library errors.

use kube::Error as KubeError;
use rule_templates::TemplateError;
use thiserror::Error;

/// Errors that can occur in the alert rules controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Template registry error (zero templates is fatal at startup)
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Caches did not synchronize before the startup deadline
    #[error("caches failed to synchronize within {0:?}")]
    CacheSync(std::time::Duration),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
