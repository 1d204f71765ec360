//! Alert rule template registry.
//!
//! Holds the named rule templates loaded once at process start and renders
//! them against a typed parameter set. The output of a successful render is
//! a YAML `PrometheusRule` document which is then parsed into the typed CRD
//! from the `crds` crate.
//!
//! Template names are the file stems of `*.tmpl` files in the template
//! directory and are referenced from workload annotations
//! (`alertops.microscaler.io/<template-name>`).

use std::fs;
use std::path::Path;

use crds::PrometheusRule;
use handlebars::Handlebars;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading, rendering, or parsing rule templates.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Template directory could not be read
    #[error("error reading template directory: {0}")]
    Io(#[from] std::io::Error),

    /// A template file failed to compile at load time
    #[error("error compiling template: {0}")]
    Compile(#[from] Box<handlebars::TemplateError>),

    /// The directory yielded no templates; fatal at startup
    #[error("no templates defined in {0}")]
    NoTemplates(String),

    /// A directive referenced a template name that was never registered
    #[error("no template registered for \"{0}\"")]
    NotFound(String),

    /// Parameter substitution failed (missing field, bad helper)
    #[error("error rendering template: {0}")]
    Render(#[from] Box<handlebars::RenderError>),

    /// The rendered document is not a valid PrometheusRule
    #[error("error parsing rendered rule: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Parameter set passed to every rule template.
///
/// All fields are always present to the template engine; fields that do not
/// apply to a workload kind are empty strings. Templates reference them by
/// the field names below, e.g. `{{threshold}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleParams {
    /// `<namespace>.<name>` of the workload
    pub identifier: String,
    /// Workload namespace
    pub namespace: String,
    /// Workload name
    pub name: String,
    /// The annotation directive's value, verbatim
    pub threshold: String,
    /// Workload selector rendered as `,key="value"` pairs for PromQL matchers
    pub generated_labels: String,
    /// Prometheus instance the workload's namespace reports to
    pub prometheus: String,
    /// Resolved ownership: owning team
    pub owner: String,
    /// Resolved ownership: environment
    pub environment: String,
    /// Resolved ownership: criticality
    pub criticality: String,
    /// Resolved ownership: data sensitivity
    pub sensitivity: String,
}

/// Registry of named rule templates, immutable after load.
pub struct TemplateRegistry {
    registry: Handlebars<'static>,
}

impl std::fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRegistry").field("templates", &self.names()).finish()
    }
}

impl TemplateRegistry {
    /// Loads every `*.tmpl` file from a flat directory, registering each
    /// template under its file stem. A directory yielding zero templates is
    /// an error; the caller treats it as fatal.
    pub fn load(directory: &Path) -> Result<Self, TemplateError> {
        let mut sources = Vec::new();
        for entry in fs::read_dir(directory)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("tmpl") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            sources.push((name.to_string(), fs::read_to_string(&path)?));
        }

        if sources.is_empty() {
            return Err(TemplateError::NoTemplates(directory.display().to_string()));
        }

        let registry = Self::from_sources(sources)?;
        debug!(templates = ?registry.names(), "loaded rule templates");
        Ok(registry)
    }

    /// Builds a registry from in-memory (name, source) pairs.
    pub fn from_sources<I>(sources: I) -> Result<Self, TemplateError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut registry = Handlebars::new();
        // Rendered output is PromQL inside YAML, not HTML; escaping would
        // mangle the quotes in label matchers.
        registry.register_escape_fn(handlebars::no_escape);
        // A template referencing a parameter we never provide is a render
        // error, not silently-empty output.
        registry.set_strict_mode(true);

        for (name, source) in sources {
            registry
                .register_template_string(&name, source)
                .map_err(Box::new)?;
        }

        Ok(Self { registry })
    }

    /// Names of all registered templates, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.registry.get_templates().keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Whether a template is registered under `name`.
    pub fn has(&self, name: &str) -> bool {
        self.registry.has_template(name)
    }

    /// Renders the named template against `params`.
    ///
    /// Deterministic: identical inputs produce byte-identical output.
    pub fn render(&self, name: &str, params: &RuleParams) -> Result<String, TemplateError> {
        if !self.registry.has_template(name) {
            return Err(TemplateError::NotFound(name.to_string()));
        }
        self.registry.render(name, params).map_err(|e| TemplateError::Render(Box::new(e)))
    }
}

/// Parses a rendered YAML document into a typed `PrometheusRule`.
pub fn parse_rule(document: &str) -> Result<PrometheusRule, TemplateError> {
    Ok(serde_yaml::from_str(document)?)
}
