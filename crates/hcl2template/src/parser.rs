//! Top-level parse orchestration
//!
//! [Parser::parse] runs the structural phases in a fixed order and returns a
//! [PackerConfig] together with every diagnostic found on the way:
//!
//! 1. discover and syntax-check the template files
//! 2. check `required_version` against the running core version
//! 3. decode `packer { required_plugins {} }` blocks
//! 4. declare input variables and locals
//! 5. apply variable overrides (environment, var files, command line)
//! 6. decode `source`, `data`, `communicator` and `build` blocks
//! 7. derive implicit plugin requirements from component types
//!
//! Expression evaluation is deliberately absent here; it happens in
//! [PackerConfig::initialize] and [PackerConfig::get_builds] once every
//! declaration is known.

use crate::addrs::parse_plugin_source_string;
use crate::build::{decode_build_block, BuildBlock};
use crate::config::{decode_communicator_block, PackerConfig};
use crate::datasource::decode_data_block;
use crate::diagnostics::{Diagnostic, Diagnostics, SourceRange};
use crate::documents::{auto_var_files, TemplateFiles};
use crate::plugin::{ComponentKind, Registry};
use crate::required_plugins::{
    decode_required_plugins_block, implicit_required_plugin, RequiredPlugins, VersionConstraint,
};
use crate::source::decode_source_block;
use crate::util::did_you_mean;
use crate::variables::{
    decode_local_block, decode_variable_block, decode_variables_block, env_overrides,
    AssignmentSource, Variables,
};
use hcl::eval::{Context, Evaluate};
use std::path::{Path, PathBuf};

/// Root block types a template file may contain.
const ROOT_BLOCK_TYPES: &[&str] = &[
    "build",
    "communicator",
    "data",
    "local",
    "locals",
    "packer",
    "source",
    "variable",
    "variables",
];

#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Extra variable files, applied after the auto-loaded ones, in order.
    pub var_files: Vec<PathBuf>,
    /// Command-line variable assignments, highest precedence.
    pub variables: Vec<(String, String)>,
    /// Warn when a var file assigns a variable no template declares.
    pub warn_on_undeclared_var: bool,
}

/// Turns template files into a [PackerConfig].
#[derive(Debug)]
pub struct Parser {
    registry: Registry,
    core_version: semver::Version,
}

impl Parser {
    pub fn new(registry: Registry, core_version: semver::Version) -> Self {
        Self {
            registry,
            core_version,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Loads `path` (a template file or a directory of them) and parses it.
    pub fn parse(&self, path: &Path, opts: &ParseOptions) -> (PackerConfig, Diagnostics) {
        let base_dir = if path.is_dir() {
            path.to_path_buf()
        } else {
            path.parent().unwrap_or(Path::new(".")).to_path_buf()
        };

        let mut files = TemplateFiles::default();
        let mut diags = Diagnostics::new();
        if path.is_dir() {
            match files.load_directory(path) {
                // broken files are reported but do not hide the others
                Ok(failed) => {
                    for (file_path, err) in failed {
                        diags.push(
                            Diagnostic::error(format!("Failed to load {}", file_path.display()))
                                .with_detail(format!("{err}")),
                        );
                    }
                }
                Err(err) => {
                    diags.push(
                        Diagnostic::error(format!("Failed to load {}", path.display()))
                            .with_detail(format!("{err}")),
                    );
                    return (
                        PackerConfig::new(base_dir, self.core_version.clone()),
                        diags,
                    );
                }
            }
        } else if let Err(err) = files.load_file(path) {
            diags.push(
                Diagnostic::error(format!("Failed to load {}", path.display()))
                    .with_detail(format!("{err}")),
            );
            return (
                PackerConfig::new(base_dir, self.core_version.clone()),
                diags,
            );
        }

        let (config, parse_diags) = self.parse_files(files, base_dir, opts);
        diags.extend(parse_diags);
        (config, diags)
    }

    /// Parses already-loaded documents. `base_dir` is where auto-loaded var
    /// files are searched and what `path.root` resolves to.
    pub fn parse_files(
        &self,
        files: TemplateFiles,
        base_dir: impl Into<PathBuf>,
        opts: &ParseOptions,
    ) -> (PackerConfig, Diagnostics) {
        let mut diags = Diagnostics::new();
        let mut config = PackerConfig::new(base_dir, self.core_version.clone());
        config.files = files;

        // top-level attributes are never valid in a template file
        for (_, source, attribute) in config.files.attributes() {
            diags.push(
                Diagnostic::error(format!(
                    "Unexpected attribute {:?} at the top level",
                    attribute.key.as_str()
                ))
                .with_detail(
                    "Only blocks are allowed at the top level of a template file; \
                     variable values belong in a `.pkrvars.hcl` file or a variable default.",
                )
                .with_subject(SourceRange::new(source.clone(), None)),
            );
        }

        diags.extend(self.decode_packer_blocks(&mut config));
        diags.extend(self.decode_variable_declarations(&mut config));
        diags.extend(self.apply_variable_overrides(&mut config, opts));
        diags.extend(self.decode_component_blocks(&mut config));
        diags.extend(self.derive_implicit_plugins(&mut config));

        (config, diags)
    }

    /// `packer {}` blocks: `required_version` and `required_plugins`.
    fn decode_packer_blocks(&self, config: &mut PackerConfig) -> Diagnostics {
        let mut diags = Diagnostics::new();

        for (index, _, block) in config.files.blocks() {
            if block.ident.as_str() != "packer" {
                continue;
            }
            let location = config.files.location(index);

            for attribute in block.body.attributes() {
                match attribute.key.as_str() {
                    "required_version" => {
                        let expr: hcl::Expression = attribute.value.clone().into();
                        let constraint = match expr.evaluate(&Context::new()) {
                            Ok(hcl::Value::String(text)) => VersionConstraint::parse(&text),
                            _ => {
                                diags.push(
                                    Diagnostic::error("Invalid required_version")
                                        .with_detail(
                                            "required_version must be a literal version \
                                             constraint string, e.g. \">= 1.9.0\".",
                                        )
                                        .with_subject(location.clone()),
                                );
                                continue;
                            }
                        };
                        match constraint {
                            Ok(constraint) => {
                                if !constraint.matches(&self.core_version) {
                                    diags.push(
                                        Diagnostic::error("Unsupported core version")
                                            .with_detail(format!(
                                                "The currently running version ({}) does not \
                                                 satisfy the version constraint {constraint}.",
                                                self.core_version
                                            ))
                                            .with_subject(location.clone()),
                                    );
                                }
                                config.core_version_constraints.push(constraint);
                            }
                            Err(err) => diags.push(
                                Diagnostic::error("Invalid required_version")
                                    .with_detail(err.to_string())
                                    .with_subject(location.clone()),
                            ),
                        }
                    }
                    other => diags.push(
                        Diagnostic::error(format!(
                            "Unsupported argument {other:?} in packer block"
                        ))
                        .with_detail("The packer block only accepts `required_version`.")
                        .with_subject(location.clone()),
                    ),
                }
            }

            for nested in block.body.blocks() {
                match nested.ident.as_str() {
                    "required_plugins" => {
                        let (plugins, more_diags) =
                            decode_required_plugins_block(nested, &location);
                        diags.extend(more_diags);
                        config.required_plugins.push(plugins);
                    }
                    other => diags.push(
                        Diagnostic::error(format!(
                            "Unsupported block type {other:?} in packer block"
                        ))
                        .with_detail("The packer block only accepts `required_plugins` blocks.")
                        .with_subject(location.clone()),
                    ),
                }
            }
        }

        diags
    }

    /// `variable`, `variables`, `locals` and `local` blocks.
    fn decode_variable_declarations(&self, config: &mut PackerConfig) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let mut variables = Variables::default();
        let mut locals = vec![];

        for (index, _, block) in config.files.blocks() {
            let location = config.files.location(index);
            match block.ident.as_str() {
                "variable" => {
                    let (variable, more_diags) = decode_variable_block(block, &location);
                    diags.extend(more_diags);
                    if let Some(variable) = variable {
                        if let Err(diag) = variables.declare(variable) {
                            diags.push(diag);
                        }
                    }
                }
                "variables" => {
                    let (decoded, more_diags) = decode_variables_block(block, &location);
                    diags.extend(more_diags);
                    for variable in decoded {
                        if let Err(diag) = variables.declare(variable) {
                            diags.push(diag);
                        }
                    }
                }
                "locals" | "local" => {
                    let (decoded, more_diags) = decode_local_block(block, &location);
                    diags.extend(more_diags);
                    locals.extend(decoded);
                }
                _ => {}
            }
        }

        // locals may be spread over many blocks, so duplicates are only
        // detectable once all of them are collected
        let mut seen: Vec<&crate::variables::LocalBlock> = vec![];
        for local in &locals {
            match seen.iter().find(|other| other.name == local.name) {
                Some(previous) => diags.push(
                    Diagnostic::error(format!("Duplicate local value {:?}", local.name))
                        .with_detail(format!("Previously declared at {}.", previous.range))
                        .with_subject(local.range.clone()),
                ),
                None => seen.push(local),
            }
        }

        config.input_variables = variables;
        config.local_blocks = locals;
        diags
    }

    /// Environment, auto-loaded var files, explicit var files, then command
    /// line values; later phases override earlier ones.
    fn apply_variable_overrides(
        &self,
        config: &mut PackerConfig,
        opts: &ParseOptions,
    ) -> Diagnostics {
        let mut diags = Diagnostics::new();

        for (name, raw) in env_overrides(std::env::vars()) {
            diags.extend(
                config
                    .input_variables
                    .apply(&name, &raw, AssignmentSource::Env),
            );
        }

        let auto_files = match auto_var_files(&config.base_dir) {
            Ok(files) => files,
            Err(crate::documents::LoadError::IoError(err))
                if err.kind() == std::io::ErrorKind::NotFound =>
            {
                vec![]
            }
            Err(err) => {
                diags.push(
                    Diagnostic::error("Failed to list variable files")
                        .with_detail(format!("{err}")),
                );
                vec![]
            }
        };
        for path in auto_files.iter().chain(opts.var_files.iter()) {
            diags.extend(self.apply_var_file(config, path, opts.warn_on_undeclared_var));
        }

        for (name, raw) in &opts.variables {
            diags.extend(
                config
                    .input_variables
                    .apply(name, raw, AssignmentSource::CommandLine),
            );
        }

        diags
    }

    fn apply_var_file(
        &self,
        config: &mut PackerConfig,
        path: &Path,
        warn_on_undeclared: bool,
    ) -> Diagnostics {
        let mut diags = Diagnostics::new();
        tracing::info!(path = %path.display(), "loading variable file");

        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                diags.push(
                    Diagnostic::error(format!("Failed to read {}", path.display()))
                        .with_detail(err.to_string()),
                );
                return diags;
            }
        };
        let parsed = if crate::documents::is_json_path(path) {
            crate::documents::parse_json_varfile(&contents).map_err(|err| err.to_string())
        } else {
            hcl_edit::parser::parse_body(&contents).map_err(|err| err.to_string())
        };
        let body = match parsed {
            Ok(body) => body,
            Err(detail) => {
                diags.push(
                    Diagnostic::error(format!("Failed to parse {}", path.display()))
                        .with_detail(detail),
                );
                return diags;
            }
        };

        diags.extend(
            config
                .input_variables
                .apply_varfile_body(&body, path, warn_on_undeclared),
        );
        diags
    }

    /// `source`, `data`, `communicator` and `build` blocks, plus the unknown
    /// block type check.
    fn decode_component_blocks(&self, config: &mut PackerConfig) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let mut sources = crate::source::Sources::default();
        let mut datasources = crate::datasource::Datasources::default();
        let mut communicators = crate::config::Communicators::default();
        let mut builds: Vec<BuildBlock> = vec![];

        for (index, _, block) in config.files.blocks() {
            let location = config.files.location(index);
            match block.ident.as_str() {
                "source" => {
                    let (source, more_diags) =
                        decode_source_block(block, index, &location, &self.registry);
                    diags.extend(more_diags);
                    if let Some(source) = source {
                        if let Err(diag) = sources.insert(source) {
                            diags.push(diag);
                        }
                    }
                }
                "data" => {
                    let (datasource, more_diags) =
                        decode_data_block(block, index, &location, &self.registry);
                    diags.extend(more_diags);
                    if let Some(datasource) = datasource {
                        if let Err(diag) = datasources.insert(datasource) {
                            diags.push(diag);
                        }
                    }
                }
                "communicator" => {
                    let (communicator, more_diags) =
                        decode_communicator_block(block, index, &location);
                    diags.extend(more_diags);
                    if let Some(communicator) = communicator {
                        if let Err(diag) = communicators.insert(communicator) {
                            diags.push(diag);
                        }
                    }
                }
                "build" => {
                    let (build, more_diags) = decode_build_block(block, &location, &self.registry);
                    diags.extend(more_diags);
                    builds.push(build);
                }
                "packer" | "variable" | "variables" | "locals" | "local" => {}
                other => {
                    let mut detail = format!(
                        "Root blocks must be one of: {}.",
                        ROOT_BLOCK_TYPES.join(", ")
                    );
                    if let Some(suggestion) = did_you_mean(other, ROOT_BLOCK_TYPES.iter().copied())
                    {
                        detail.push_str(&format!(" Did you mean {suggestion:?}?"));
                    }
                    diags.push(
                        Diagnostic::error(format!("Unknown block type {other:?}"))
                            .with_detail(detail)
                            .with_subject(location),
                    );
                }
            }
        }

        config.sources = sources;
        config.datasources = datasources;
        config.communicators = communicators;
        config.builds = builds;
        diags
    }

    /// Components whose type is only known through a redirect imply a plugin
    /// requirement even without an explicit `required_plugins` entry.
    fn derive_implicit_plugins(&self, config: &mut PackerConfig) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let mut candidates: Vec<(ComponentKind, String, SourceRange)> = vec![];

        for source in config.sources.iter() {
            candidates.push((
                ComponentKind::Builder,
                source.type_name.clone(),
                source.range.clone(),
            ));
        }
        for datasource in config.datasources.iter() {
            candidates.push((
                ComponentKind::Datasource,
                datasource.type_name.clone(),
                datasource.range.clone(),
            ));
        }
        for build in &config.builds {
            for provisioner in build
                .provisioners
                .iter()
                .chain(build.error_cleanup_provisioner.iter())
            {
                candidates.push((
                    ComponentKind::Provisioner,
                    provisioner.type_name.clone(),
                    provisioner.range.clone(),
                ));
            }
            for post_processor in build.post_processor_lists.iter().flatten() {
                candidates.push((
                    ComponentKind::PostProcessor,
                    post_processor.type_name.clone(),
                    post_processor.range.clone(),
                ));
            }
        }

        let mut implied: Vec<RequiredPlugins> = vec![];
        for (kind, type_name, range) in candidates {
            if self.registry.has(kind, &type_name) {
                continue;
            }
            let Some(plugin_source) = self.registry.redirect(kind, &type_name) else {
                // the component decode already reported the unknown type
                continue;
            };

            let plugin = match parse_plugin_source_string(plugin_source) {
                Ok(plugin) => plugin,
                Err(err) => {
                    diags.push(
                        Diagnostic::error(format!(
                            "Invalid plugin source {plugin_source:?} for type {type_name:?}"
                        ))
                        .with_detail(err.to_string())
                        .with_subject(range),
                    );
                    continue;
                }
            };

            let covered = config
                .required_plugins
                .iter()
                .chain(implied.iter())
                .any(|block| block.requires_type(&plugin.type_name));
            if covered {
                continue;
            }

            tracing::debug!(%type_name, plugin = %plugin.for_display(), "implicit plugin requirement");
            implied.push(implicit_required_plugin(plugin, range));
        }

        config.required_plugins.extend(implied);
        diags
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plugin::test::test_registry;
    use crate::template_files;

    fn parser() -> Parser {
        Parser::new(test_registry(), semver::Version::new(1, 10, 0))
    }

    fn parse(source: &str) -> (PackerConfig, Diagnostics) {
        parse_with_options(source, &ParseOptions::default())
    }

    fn parse_with_options(source: &str, opts: &ParseOptions) -> (PackerConfig, Diagnostics) {
        let files = template_files! {source};
        // nonexistent base dir: no auto var files are picked up
        parser().parse_files(files, "/nonexistent", opts)
    }

    #[test]
    fn parses_a_complete_template() {
        let (config, diags) = parse(
            r#"
            packer {
              required_plugins {
                happycloud = {
                  source  = "github.com/hashicorp/happycloud"
                  version = ">= 1.0.0"
                }
              }
            }

            variable "region" {
              type    = string
              default = "us-east-1"
            }

            locals {
              name_prefix = "demo"
            }

            source "null" "example" {}

            build {
              sources = ["source.null.example"]
            }
            "#,
        );

        assert!(!diags.has_errors(), "{diags}");
        assert_eq!(config.input_variables.len(), 1);
        assert_eq!(config.local_blocks.len(), 1);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.builds.len(), 1);
        assert_eq!(config.required_plugins.len(), 1);
    }

    #[test]
    fn top_level_attributes_are_rejected() {
        let (_, diags) = parse("region = \"us-east-1\"");
        assert!(diags.has_errors());
        assert!(diags.to_string().contains("Unexpected attribute \"region\""));
    }

    #[test]
    fn unknown_root_blocks_get_a_suggestion() {
        let (_, diags) = parse("surce \"null\" \"x\" {}");
        assert!(diags.has_errors());
        assert!(diags.to_string().contains("Unknown block type \"surce\""));
        assert!(diags.to_string().contains("Did you mean \"source\"?"));
    }

    #[test]
    fn required_version_mismatch_is_an_error() {
        let (config, diags) = parse("packer {\n required_version = \">= 2.0.0\"\n}");
        assert!(diags.has_errors());
        assert!(diags.to_string().contains("Unsupported core version"));
        assert_eq!(config.core_version_constraints.len(), 1);
    }

    #[test]
    fn required_version_match_is_quiet() {
        let (_, diags) = parse("packer {\n required_version = \">= 1.9.0, < 2.0.0\"\n}");
        assert!(!diags.has_errors(), "{diags}");
    }

    #[test]
    fn duplicate_local_across_blocks_is_an_error() {
        let (_, diags) = parse("locals {\n a = 1\n}\n\nlocals {\n a = 2\n}");
        assert!(diags.has_errors());
        assert!(diags.to_string().contains("Duplicate local value \"a\""));
    }

    #[test]
    fn redirected_source_implies_a_plugin_requirement() {
        let (config, diags) = parse(
            "source \"amazon-ebs\" \"ubuntu\" {}\n\nbuild {\n sources = [\"source.amazon-ebs.ubuntu\"]\n}",
        );
        assert!(!diags.has_errors(), "{diags}");

        let (requirements, req_diags) = config.plugin_requirements();
        assert!(!req_diags.has_errors(), "{req_diags}");
        assert_eq!(requirements.len(), 1);
        assert_eq!(requirements[0].identifier.type_name, "amazon");
    }

    #[test]
    fn explicit_required_plugin_suppresses_the_implicit_one() {
        let (config, diags) = parse(
            r#"
            packer {
              required_plugins {
                amazon = {
                  source  = "github.com/hashicorp/amazon"
                  version = ">= 1.2.0"
                }
              }
            }

            source "amazon-ebs" "ubuntu" {}
            "#,
        );
        assert!(!diags.has_errors(), "{diags}");

        let (requirements, _) = config.plugin_requirements();
        assert_eq!(requirements.len(), 1);
        assert!(requirements[0].version_constraints.is_constrained());
    }

    #[test]
    fn command_line_variables_apply() {
        let opts = ParseOptions {
            variables: vec![("region".to_string(), "eu-west-1".to_string())],
            ..ParseOptions::default()
        };
        let (config, _) = parse_with_options(
            "variable \"region\" {\n type    = string\n default = \"us-east-1\"\n}",
            &opts,
        );

        let values = config.input_variables.values();
        assert_eq!(
            values.get("region"),
            Some(&hcl::Value::String("eu-west-1".into()))
        );
    }

    #[test]
    fn unknown_command_line_variable_is_an_error() {
        let opts = ParseOptions {
            variables: vec![("rigion".to_string(), "x".to_string())],
            ..ParseOptions::default()
        };
        let (_, diags) = parse_with_options("variable \"region\" {}", &opts);
        assert!(diags.has_errors());
    }
}
