//! Plugin component registry
//!
//! The parser never constructs builders, provisioners, post-processors or
//! data sources itself. A [Registry] value, built once at process start and
//! read-only afterwards, answers "is this component type known", "which types
//! are known" and "start an instance of this type". The component instances
//! it hands out are opaque to the parser except for the capability traits
//! below.

use crate::diagnostics::{Diagnostic, Diagnostics, SourceRange};
use crate::schema::Decodable;
use crate::schema::DecodedConfig;
use hcl::Value;
use std::collections::HashMap;
use std::fmt;

/// The four component kinds a plugin can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Builder,
    Provisioner,
    PostProcessor,
    Datasource,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentKind::Builder => f.write_str("builder"),
            ComponentKind::Provisioner => f.write_str("provisioner"),
            ComponentKind::PostProcessor => f.write_str("post-processor"),
            ComponentKind::Datasource => f.write_str("data source"),
        }
    }
}

/// What a builder reports back from [Builder::prepare].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrepareOutcome {
    /// Names of variables the builder will generate at run time, usable in
    /// provisioner configuration as `build.<name>`.
    pub generated_vars: Vec<String>,
    pub warnings: Vec<String>,
}

pub trait Builder: Decodable {
    /// Validates and applies the decoded configuration.
    fn prepare(&mut self, config: &DecodedConfig) -> anyhow::Result<PrepareOutcome>;
}

pub trait Provisioner: Decodable {
    /// Validates and applies the decoded configuration, returning warnings.
    fn prepare(&mut self, config: &DecodedConfig) -> anyhow::Result<Vec<String>>;
}

pub trait PostProcessor: Decodable {
    fn configure(&mut self, config: &DecodedConfig) -> anyhow::Result<Vec<String>>;
}

pub trait DataSource: Decodable {
    fn configure(&mut self, config: &DecodedConfig) -> anyhow::Result<()>;

    /// Runs the lookup and returns its output as a value, exposed to
    /// expressions under `data.<type>.<name>`.
    fn execute(&self) -> anyhow::Result<Value>;
}

pub type BuilderFactory = Box<dyn Fn() -> Box<dyn Builder> + Send + Sync>;
pub type ProvisionerFactory = Box<dyn Fn() -> Box<dyn Provisioner> + Send + Sync>;
pub type PostProcessorFactory = Box<dyn Fn() -> Box<dyn PostProcessor> + Send + Sync>;
pub type DataSourceFactory = Box<dyn Fn() -> Box<dyn DataSource> + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum StartError {
    #[error("Unknown {kind} type {type_name:?}; known {kind} types: {}", known.join(", "))]
    UnknownType {
        kind: ComponentKind,
        type_name: String,
        known: Vec<String>,
    },
}

impl StartError {
    /// Renders the error as a diagnostic at the offending block.
    pub fn to_diagnostic(&self, subject: &SourceRange) -> Diagnostic {
        match self {
            StartError::UnknownType {
                kind, type_name, ..
            } => Diagnostic::error(format!("Unknown {kind} type {type_name:?}"))
                .with_detail(self.to_string())
                .with_subject(subject.clone()),
        }
    }
}

/// All known component types plus the redirect table used to infer implicit
/// plugin requirements.
#[derive(Default)]
pub struct Registry {
    builders: HashMap<String, BuilderFactory>,
    provisioners: HashMap<String, ProvisionerFactory>,
    post_processors: HashMap<String, PostProcessorFactory>,
    datasources: HashMap<String, DataSourceFactory>,
    /// component type -> full plugin source string, e.g.
    /// `amazon-ebs -> github.com/hashicorp/amazon`
    redirects: HashMap<(ComponentKind, String), String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_builder(&mut self, type_name: impl Into<String>, factory: BuilderFactory) {
        self.builders.insert(type_name.into(), factory);
    }

    pub fn register_provisioner(
        &mut self,
        type_name: impl Into<String>,
        factory: ProvisionerFactory,
    ) {
        self.provisioners.insert(type_name.into(), factory);
    }

    pub fn register_post_processor(
        &mut self,
        type_name: impl Into<String>,
        factory: PostProcessorFactory,
    ) {
        self.post_processors.insert(type_name.into(), factory);
    }

    pub fn register_datasource(
        &mut self,
        type_name: impl Into<String>,
        factory: DataSourceFactory,
    ) {
        self.datasources.insert(type_name.into(), factory);
    }

    pub fn register_redirect(
        &mut self,
        kind: ComponentKind,
        type_name: impl Into<String>,
        plugin_source: impl Into<String>,
    ) {
        self.redirects
            .insert((kind, type_name.into()), plugin_source.into());
    }

    pub fn has(&self, kind: ComponentKind, type_name: &str) -> bool {
        match kind {
            ComponentKind::Builder => self.builders.contains_key(type_name),
            ComponentKind::Provisioner => self.provisioners.contains_key(type_name),
            ComponentKind::PostProcessor => self.post_processors.contains_key(type_name),
            ComponentKind::Datasource => self.datasources.contains_key(type_name),
        }
    }

    /// All known types of one kind, sorted for stable error messages.
    pub fn list(&self, kind: ComponentKind) -> Vec<String> {
        let mut known: Vec<String> = match kind {
            ComponentKind::Builder => self.builders.keys().cloned().collect(),
            ComponentKind::Provisioner => self.provisioners.keys().cloned().collect(),
            ComponentKind::PostProcessor => self.post_processors.keys().cloned().collect(),
            ComponentKind::Datasource => self.datasources.keys().cloned().collect(),
        };
        known.sort();
        known
    }

    /// The plugin source string a component type redirects to, if any.
    pub fn redirect(&self, kind: ComponentKind, type_name: &str) -> Option<&str> {
        self.redirects
            .get(&(kind, type_name.to_string()))
            .map(String::as_str)
    }

    pub fn start_builder(&self, type_name: &str) -> Result<Box<dyn Builder>, StartError> {
        self.builders
            .get(type_name)
            .map(|factory| factory())
            .ok_or_else(|| self.unknown(ComponentKind::Builder, type_name))
    }

    pub fn start_provisioner(&self, type_name: &str) -> Result<Box<dyn Provisioner>, StartError> {
        self.provisioners
            .get(type_name)
            .map(|factory| factory())
            .ok_or_else(|| self.unknown(ComponentKind::Provisioner, type_name))
    }

    pub fn start_post_processor(
        &self,
        type_name: &str,
    ) -> Result<Box<dyn PostProcessor>, StartError> {
        self.post_processors
            .get(type_name)
            .map(|factory| factory())
            .ok_or_else(|| self.unknown(ComponentKind::PostProcessor, type_name))
    }

    pub fn start_datasource(&self, type_name: &str) -> Result<Box<dyn DataSource>, StartError> {
        self.datasources
            .get(type_name)
            .map(|factory| factory())
            .ok_or_else(|| self.unknown(ComponentKind::Datasource, type_name))
    }

    fn unknown(&self, kind: ComponentKind, type_name: &str) -> StartError {
        StartError::UnknownType {
            kind,
            type_name: type_name.to_string(),
            known: self.list(kind),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("builders", &self.list(ComponentKind::Builder))
            .field("provisioners", &self.list(ComponentKind::Provisioner))
            .field("post_processors", &self.list(ComponentKind::PostProcessor))
            .field("datasources", &self.list(ComponentKind::Datasource))
            .field("redirects", &self.redirects.len())
            .finish()
    }
}

/// Converts plugin-reported warnings and an optional error into diagnostics,
/// preserving the warning/fatal distinction.
pub fn warnings_to_diagnostics(
    warnings: &[String],
    error: Option<&anyhow::Error>,
    subject: &SourceRange,
) -> Diagnostics {
    let mut diags = Diagnostics::new();
    for warning in warnings {
        diags.push(
            Diagnostic::warning(warning.clone()).with_subject(subject.clone()),
        );
    }
    if let Some(error) = error {
        diags.push(
            Diagnostic::error("Component reported an error")
                .with_detail(format!("{error:#}"))
                .with_subject(subject.clone()),
        );
    }
    diags
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::schema::{ConfigSpec, SchemaType};
    use pretty_assertions::assert_eq;

    /// Minimal in-process builder used across the test suite.
    #[derive(Default)]
    pub struct NullBuilder;

    impl Decodable for NullBuilder {
        fn config_spec(&self) -> ConfigSpec {
            ConfigSpec::new()
                .optional("region", SchemaType::String)
                .optional("packer_build_name", SchemaType::String)
                .optional("packer_builder_type", SchemaType::String)
        }
    }

    impl Builder for NullBuilder {
        fn prepare(&mut self, _config: &DecodedConfig) -> anyhow::Result<PrepareOutcome> {
            Ok(PrepareOutcome::default())
        }
    }

    pub fn test_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_builder("null", Box::new(|| Box::new(NullBuilder)));
        registry.register_redirect(
            ComponentKind::Builder,
            "amazon-ebs",
            "github.com/hashicorp/amazon",
        );
        registry
    }

    #[test]
    fn has_and_list() {
        let registry = test_registry();
        assert!(registry.has(ComponentKind::Builder, "null"));
        assert!(!registry.has(ComponentKind::Builder, "amazon-ebs"));
        assert_eq!(registry.list(ComponentKind::Builder), vec!["null"]);
        assert!(registry.list(ComponentKind::Datasource).is_empty());
    }

    #[test]
    fn unknown_type_names_known_types() {
        let registry = test_registry();
        let err = match registry.start_builder("nul") {
            Err(err) => err,
            Ok(_) => panic!("expected an unknown type error"),
        };
        let message = err.to_string();
        assert!(message.contains("Unknown builder type"), "{message}");
        assert!(message.contains("null"), "{message}");
    }

    #[test]
    fn redirect_lookup() {
        let registry = test_registry();
        assert_eq!(
            registry.redirect(ComponentKind::Builder, "amazon-ebs"),
            Some("github.com/hashicorp/amazon")
        );
        assert_eq!(registry.redirect(ComponentKind::Builder, "null"), None);
    }

    #[test]
    fn warning_conversion_keeps_severity() {
        let diags = warnings_to_diagnostics(
            &["deprecated field".to_string()],
            None,
            &SourceRange::default(),
        );
        assert!(!diags.has_errors());
        assert_eq!(diags.len(), 1);
    }
}
