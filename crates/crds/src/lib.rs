//! alertops CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the alertops controllers.

pub mod prometheus_rule;

pub use prometheus_rule::*;
