//! The resolved configuration aggregate
//!
//! [PackerConfig] is built incrementally by [crate::parser::Parser::parse]
//! and becomes read-only once handed to callers, except for
//! [PackerConfig::initialize] which fills in the evaluated local values and
//! data source outputs. [PackerConfig::get_builds] then expands
//! build × source combinations into runnable [CoreBuild] units for the
//! execution engine.

use crate::build::{BuildBlock, PostProcessorBlock, ProvisionerBlock};
use crate::datasource::{DatasourceRef, Datasources};
use crate::diagnostics::{Diagnostic, Diagnostics, SourceRange};
use crate::documents::TemplateFiles;
use crate::plugin::{
    warnings_to_diagnostics, Builder, PostProcessor, Provisioner, Registry,
};
use crate::required_plugins::{RequiredPlugins, VersionConstraint};
use crate::schema::{decode_spec, DecodedConfig};
use crate::source::{SourceRef, SourceUseBlock, Sources};
use crate::variables::{LocalBlock, Variables};
use crate::visit::paths_with_root;
use hcl::eval::{Context, Evaluate};
use hcl::Value;
use indexmap::IndexMap;
use std::path::PathBuf;

/// Data source dependency chains deeper than this are rejected; in practice
/// such chains indicate a cycle or a runaway template.
const MAX_DATASOURCE_DEPTH: usize = 10;

/// Placeholder exposed as `build.<generated var>` while configuring
/// provisioners, before the builder has produced the real value.
const UNKNOWN_PLACEHOLDER: &str = "<unknown>";

/// Key into the configuration's communicator table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommunicatorRef {
    pub type_name: String,
    pub name: String,
}

impl CommunicatorRef {
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
        }
    }

    /// Parses a `<type>.<name>` communicator reference.
    pub fn from_string(text: &str) -> Result<Self, Diagnostic> {
        match text.split('.').collect::<Vec<_>>().as_slice() {
            [type_name, name] if !type_name.is_empty() && !name.is_empty() => {
                Ok(Self::new(*type_name, *name))
            }
            _ => Err(Diagnostic::error(format!(
                "Invalid communicator reference {text:?}"
            ))
            .with_detail("A communicator reference has the form `<type>.<name>`.")),
        }
    }
}

impl std::fmt::Display for CommunicatorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.type_name, self.name)
    }
}

/// A declared `communicator` block, body left undecoded for the execution
/// engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CommunicatorBlock {
    pub type_name: String,
    pub name: String,
    pub block_index: usize,
    pub range: SourceRange,
}

impl CommunicatorBlock {
    pub fn ref_(&self) -> CommunicatorRef {
        CommunicatorRef::new(&self.type_name, &self.name)
    }
}

/// Decodes the labels of a `communicator` block.
pub fn decode_communicator_block(
    block: &hcl_edit::structure::Block,
    block_index: usize,
    location: &SourceRange,
) -> (Option<CommunicatorBlock>, Diagnostics) {
    let mut diags = Diagnostics::new();

    let (Some(type_name), Some(name)) = (
        block.labels.first().map(|label| label.as_str().to_string()),
        block.labels.get(1).map(|label| label.as_str().to_string()),
    ) else {
        diags.push(
            Diagnostic::error("Invalid communicator block")
                .with_detail(
                    "A communicator block requires a type and a name: \
                     `communicator \"type\" \"name\" {}`.",
                )
                .with_subject(location.clone()),
        );
        return (None, diags);
    };

    (
        Some(CommunicatorBlock {
            type_name,
            name,
            block_index,
            range: location.clone(),
        }),
        diags,
    )
}

/// The communicator table; insertion enforces (type, name) uniqueness.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Communicators {
    communicators: IndexMap<CommunicatorRef, CommunicatorBlock>,
}

impl Communicators {
    pub fn insert(&mut self, communicator: CommunicatorBlock) -> Result<(), Diagnostic> {
        let ref_ = communicator.ref_();
        match self.communicators.get(&ref_) {
            Some(previous) => Err(Diagnostic::error(format!(
                "Duplicate communicator block {ref_}"
            ))
            .with_detail(format!("Previously declared at {}.", previous.range))
            .with_subject(communicator.range)),
            None => {
                self.communicators.insert(ref_, communicator);
                Ok(())
            }
        }
    }

    pub fn get(&self, ref_: &CommunicatorRef) -> Option<&CommunicatorBlock> {
        self.communicators.get(ref_)
    }

    pub fn len(&self) -> usize {
        self.communicators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.communicators.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitializeOptions {
    /// Replace data source outputs with null instead of executing the
    /// lookups, e.g. for `validate`-style runs that must not hit APIs.
    pub skip_datasources_execution: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GetBuildsOptions {
    /// Glob patterns of build names to keep.
    pub only: Vec<String>,
    /// Glob patterns of build names (or post-processor names) to drop.
    pub except: Vec<String>,
}

/// A materialized, runnable build unit.
pub struct CoreBuild {
    /// Full display name, `[buildname.]type.srcname`.
    pub name: String,
    pub build_name: Option<String>,
    pub source: SourceRef,
    pub builder_type: String,
    pub builder: Box<dyn Builder>,
    pub builder_config: DecodedConfig,
    pub communicator: Option<CommunicatorRef>,
    pub provisioners: Vec<CoreBuildProvisioner>,
    pub error_cleanup_provisioner: Option<CoreBuildProvisioner>,
    /// Sequential chains; each chain feeds the previous artifact forward.
    pub post_processors: Vec<Vec<CoreBuildPostProcessor>>,
}

pub struct CoreBuildProvisioner {
    pub ptype: String,
    pub pname: String,
    pub provisioner: Box<dyn Provisioner>,
    pub config: DecodedConfig,
}

pub struct CoreBuildPostProcessor {
    pub ptype: String,
    pub pname: String,
    pub keep_input_artifact: Option<bool>,
    pub post_processor: Box<dyn PostProcessor>,
    pub config: DecodedConfig,
}

/// The top-level configuration, aggregate of every decode pass.
#[derive(Debug)]
pub struct PackerConfig {
    pub base_dir: PathBuf,
    pub core_version: semver::Version,
    pub files: TemplateFiles,
    pub input_variables: Variables,
    pub local_blocks: Vec<LocalBlock>,
    /// Filled by [PackerConfig::initialize].
    pub local_values: hcl::Map<String, Value>,
    pub sources: Sources,
    pub datasources: Datasources,
    pub communicators: Communicators,
    pub builds: Vec<BuildBlock>,
    pub required_plugins: Vec<RequiredPlugins>,
    pub core_version_constraints: Vec<VersionConstraint>,
}

impl PackerConfig {
    pub fn new(base_dir: impl Into<PathBuf>, core_version: semver::Version) -> Self {
        Self {
            base_dir: base_dir.into(),
            core_version,
            files: TemplateFiles::default(),
            input_variables: Variables::default(),
            local_blocks: vec![],
            local_values: hcl::Map::new(),
            sources: Sources::default(),
            datasources: Datasources::default(),
            communicators: Communicators::default(),
            builds: vec![],
            required_plugins: vec![],
            core_version_constraints: vec![],
        }
    }

    /// The evaluation context exposing the `var`, `local`, `data`, `path`
    /// and `packer` namespaces from the currently resolved state.
    pub fn eval_context(&self) -> Context<'static> {
        let mut ctx = Context::new();
        ctx.declare_var("var", Value::Object(self.input_variables.values()));
        ctx.declare_var("local", Value::Object(self.local_values.clone()));
        ctx.declare_var("data", Value::Object(self.datasources.values()));

        let cwd = std::env::current_dir().unwrap_or_default();
        let mut path = hcl::Map::new();
        path.insert("cwd".to_string(), Value::String(cwd.display().to_string()));
        path.insert(
            "root".to_string(),
            Value::String(self.base_dir.display().to_string()),
        );
        ctx.declare_var("path", Value::Object(path));

        let mut packer = hcl::Map::new();
        packer.insert(
            "version".to_string(),
            Value::String(self.core_version.to_string()),
        );
        ctx.declare_var("packer", Value::Object(packer));

        ctx
    }

    /// Post-parse consistency pass: checks that every variable has a value
    /// and passes its validations, then runs the data source lookups and
    /// evaluates locals in dependency order.
    pub fn initialize(&mut self, opts: &InitializeOptions, registry: &Registry) -> Diagnostics {
        let mut diags = Diagnostics::new();

        diags.extend(self.input_variables.check_all_set());
        for variable in self.input_variables.iter() {
            diags.extend(variable.validate());
        }
        if diags.has_errors() {
            // locals and data sources would evaluate against garbage values
            return diags;
        }

        // data sources first: locals may reference their outputs
        diags.extend(self.evaluate_datasources(opts.skip_datasources_execution, registry));
        if diags.has_errors() {
            return diags;
        }

        diags.extend(self.evaluate_locals());
        diags
    }

    /// Evaluates all local values to a fixpoint. Declaration order does not
    /// matter: a local that references a not-yet-evaluated local is retried
    /// once its dependency resolves. Leftovers after a pass without progress
    /// are classified as a dependency cycle or reported with their raw
    /// evaluation error.
    fn evaluate_locals(&mut self) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let mut pending: Vec<LocalBlock> = self.local_blocks.clone();

        loop {
            let mut progressed = false;
            let mut remaining = vec![];

            for local in pending {
                let ctx = self.eval_context();
                match local.expr.evaluate(&ctx) {
                    Ok(value) => {
                        tracing::debug!(name = %local.name, "local value evaluated");
                        self.local_values.insert(local.name.clone(), value);
                        progressed = true;
                    }
                    Err(_) => remaining.push(local),
                }
            }

            pending = remaining;
            if pending.is_empty() || !progressed {
                break;
            }
        }

        let pending_names: Vec<String> = pending.iter().map(|l| l.name.clone()).collect();
        for local in &pending {
            let depends_on_pending = paths_with_root(&local.expr, "local")
                .iter()
                .any(|path| path.get(1).is_some_and(|name| pending_names.contains(name)));

            if depends_on_pending {
                diags.push(
                    Diagnostic::error(format!("Cyclic local value local.{}", local.name))
                        .with_detail(format!(
                            "The expression depends on other unresolvable locals \
                             ({}); break the reference cycle.",
                            pending_names.join(", ")
                        ))
                        .with_subject(local.range.clone()),
                );
                continue;
            }

            // not a cycle, surface the actual evaluation error
            let ctx = self.eval_context();
            if let Err(errors) = local.expr.evaluate(&ctx) {
                diags.push(
                    Diagnostic::error(format!("Failed to evaluate local.{}", local.name))
                        .with_detail(errors.to_string())
                        .with_subject(local.range.clone()),
                );
            }
        }

        diags
    }

    /// Runs every data source lookup, dependencies first.
    fn evaluate_datasources(&mut self, skip_execution: bool, registry: &Registry) -> Diagnostics {
        let mut diags = Diagnostics::new();
        for ref_ in self.datasources.refs() {
            diags.extend(self.evaluate_datasource(&ref_, skip_execution, registry, 0));
        }
        diags
    }

    fn evaluate_datasource(
        &mut self,
        ref_: &DatasourceRef,
        skip_execution: bool,
        registry: &Registry,
        depth: usize,
    ) -> Diagnostics {
        let mut diags = Diagnostics::new();

        if depth > MAX_DATASOURCE_DEPTH {
            diags.push(
                Diagnostic::error(format!("Dependency loop while evaluating {ref_}"))
                    .with_detail(format!(
                        "Max dependency depth of {MAX_DATASOURCE_DEPTH} reached; check for a \
                         reference cycle between data sources."
                    )),
            );
            return diags;
        }

        let Some(datasource) = self.datasources.get(ref_) else {
            diags.push(Diagnostic::error(format!("Unknown data source {ref_}")).with_detail(
                "The reference does not match any declared data block.",
            ));
            return diags;
        };
        if datasource.value.is_some() {
            return diags;
        }

        let dependencies = datasource.dependencies.clone();
        let range = datasource.range.clone();
        let block_index = datasource.block_index;
        let type_name = datasource.type_name.clone();

        for dependency in &dependencies {
            let more_diags = self.evaluate_datasource(dependency, skip_execution, registry, depth + 1);
            if more_diags.has_errors() {
                diags.extend(more_diags);
                return diags;
            }
            diags.extend(more_diags);
        }

        if skip_execution {
            tracing::debug!(%ref_, "skipping data source execution");
            if let Some(datasource) = self.datasources.get_mut(ref_) {
                datasource.value = Some(Value::Null);
            }
            return diags;
        }

        let mut instance = match registry.start_datasource(&type_name) {
            Ok(instance) => instance,
            Err(err) => {
                diags.push(err.to_diagnostic(&range));
                return diags;
            }
        };

        let ctx = self.eval_context();
        let (_, _, block) = self.files.get_block(block_index);
        let (config, decode_diags) = decode_spec(&block.body, &ctx, &instance.config_spec(), &range);
        diags.extend(decode_diags);
        if diags.has_errors() {
            return diags;
        }

        if let Err(err) = instance.configure(&config) {
            diags.push(
                Diagnostic::error(format!("Failed to configure {ref_}"))
                    .with_detail(format!("{err:#}"))
                    .with_subject(range),
            );
            return diags;
        }

        match instance.execute() {
            Ok(value) => {
                tracing::info!(%ref_, "data source executed");
                if let Some(datasource) = self.datasources.get_mut(ref_) {
                    datasource.value = Some(value);
                }
            }
            Err(err) => diags.push(
                Diagnostic::error(format!("Failed to execute {ref_}"))
                    .with_detail(format!("{err:#}"))
                    .with_subject(range),
            ),
        }

        diags
    }

    /// Flattens all required plugin blocks; see
    /// [crate::required_plugins::plugin_requirements].
    pub fn plugin_requirements(
        &self,
    ) -> (
        Vec<crate::required_plugins::PluginRequirement>,
        Diagnostics,
    ) {
        crate::required_plugins::plugin_requirements(&self.required_plugins)
    }

    /// Expands build × source combinations into runnable builds, applying
    /// the `only`/`except` filters.
    pub fn get_builds(
        &self,
        opts: &GetBuildsOptions,
        registry: &Registry,
    ) -> (Vec<CoreBuild>, Diagnostics) {
        let mut diags = Diagnostics::new();
        let mut builds = vec![];

        if self.builds.is_empty() {
            diags.push(
                Diagnostic::error("Missing build block").with_detail(
                    "A build block with one or more sources is required to get a build.",
                ),
            );
            return (builds, diags);
        }

        let (only, only_diags) = compile_globs(&opts.only, "only");
        let (except, except_diags) = compile_globs(&opts.except, "except");
        diags.extend(only_diags);
        diags.extend(except_diags);
        if diags.has_errors() {
            return (builds, diags);
        }
        let mut only_matched = vec![false; only.len()];
        let mut except_matched = vec![false; except.len()];

        for build in &self.builds {
            let ctx = self.eval_context();

            let build_name = match build.resolved_name(&ctx) {
                Ok(name) => name,
                Err(diag) => {
                    diags.push(diag);
                    continue;
                }
            };

            let communicator = match self.resolve_communicator(build, &ctx) {
                Ok(communicator) => communicator,
                Err(diag) => {
                    diags.push(diag);
                    continue;
                }
            };

            let (uses, source_diags) = build.sources(&ctx);
            diags.extend(source_diags);

            for use_block in uses {
                let Some(source) = self.sources.get(&use_block.source) else {
                    let defined: Vec<String> =
                        self.sources.iter().map(|s| s.ref_().to_string()).collect();
                    diags.push(
                        Diagnostic::error(format!("Unknown source {}", use_block.source))
                            .with_detail(format!("Defined sources: {}.", defined.join(", ")))
                            .with_subject(build.range.clone()),
                    );
                    continue;
                };

                let source_name = format!("{}.{}", source.type_name, use_block.display_name());
                let full_name = match &build_name {
                    Some(prefix) => format!("{prefix}.{source_name}"),
                    None => source_name.clone(),
                };

                if !only.is_empty() {
                    let mut kept = false;
                    for (matcher, matched) in only.iter().zip(only_matched.iter_mut()) {
                        if matcher.is_match(&full_name) {
                            *matched = true;
                            kept = true;
                        }
                    }
                    if !kept {
                        tracing::debug!(name = %full_name, "build filtered out by -only");
                        continue;
                    }
                }
                let mut skipped = false;
                for (matcher, matched) in except.iter().zip(except_matched.iter_mut()) {
                    if matcher.is_match(&full_name) {
                        *matched = true;
                        skipped = true;
                    }
                }
                if skipped {
                    tracing::debug!(name = %full_name, "build filtered out by -except");
                    continue;
                }

                let (core_build, more_diags) = self.start_build(
                    build,
                    source,
                    &use_block,
                    &build_name,
                    full_name,
                    communicator.clone(),
                    &except,
                    &mut except_matched,
                    registry,
                );
                diags.extend(more_diags);
                if let Some(core_build) = core_build {
                    builds.push(core_build);
                }
            }
        }

        for (pattern, matched) in opts.only.iter().zip(only_matched) {
            if !matched {
                diags.push(Diagnostic::warning(format!(
                    "An 'only' option was passed, but {pattern:?} did not match any build."
                )));
            }
        }
        for (pattern, matched) in opts.except.iter().zip(except_matched) {
            if !matched {
                diags.push(Diagnostic::warning(format!(
                    "An 'except' option was passed, but {pattern:?} did not match any build."
                )));
            }
        }

        (builds, diags)
    }

    fn resolve_communicator(
        &self,
        build: &BuildBlock,
        ctx: &Context<'_>,
    ) -> Result<Option<CommunicatorRef>, Diagnostic> {
        let Some(expr) = &build.communicator else {
            return Ok(None);
        };
        let text = match expr.evaluate(ctx) {
            Ok(Value::String(text)) => text,
            Ok(_) => {
                return Err(Diagnostic::error("Invalid communicator reference")
                    .with_detail("The communicator attribute must be a string.")
                    .with_subject(build.range.clone()));
            }
            Err(errors) => {
                return Err(Diagnostic::error("Failed to evaluate communicator reference")
                    .with_detail(errors.to_string())
                    .with_subject(build.range.clone()));
            }
        };

        let ref_ = CommunicatorRef::from_string(&text)
            .map_err(|diag| diag.with_subject(build.range.clone()))?;
        if self.communicators.get(&ref_).is_none() {
            return Err(
                Diagnostic::error(format!("Unknown communicator {ref_}"))
                    .with_detail("The reference does not match any declared communicator block.")
                    .with_subject(build.range.clone()),
            );
        }
        Ok(Some(ref_))
    }

    #[allow(clippy::too_many_arguments)]
    fn start_build(
        &self,
        build: &BuildBlock,
        source: &crate::source::SourceBlock,
        use_block: &SourceUseBlock,
        build_name: &Option<String>,
        full_name: String,
        communicator: Option<CommunicatorRef>,
        except: &[globset::GlobMatcher],
        except_matched: &mut [bool],
        registry: &Registry,
    ) -> (Option<CoreBuild>, Diagnostics) {
        let mut diags = Diagnostics::new();

        let mut builder = match registry.start_builder(&source.type_name) {
            Ok(builder) => builder,
            Err(err) => {
                diags.push(err.to_diagnostic(&source.range));
                return (None, diags);
            }
        };

        let source_name = use_block.display_name().to_string();
        let mut ctx = self.eval_context();
        let mut source_value = hcl::Map::new();
        source_value.insert(
            "type".to_string(),
            Value::String(source.type_name.clone()),
        );
        source_value.insert("name".to_string(), Value::String(source_name.clone()));
        ctx.declare_var("source", Value::Object(source_value));

        let (_, _, block) = self.files.get_block(source.block_index);
        let body = merge_body(&block.body, use_block.body.as_ref());
        let (mut config, decode_diags) =
            decode_spec(&body, &ctx, &builder.config_spec(), &source.range);
        diags.extend(decode_diags);
        if diags.has_errors() {
            return (None, diags);
        }

        // conventional variables every builder receives
        config.values.insert(
            "packer_build_name".to_string(),
            Value::String(source_name.clone()),
        );
        config.values.insert(
            "packer_builder_type".to_string(),
            Value::String(source.type_name.clone()),
        );

        let outcome = match builder.prepare(&config) {
            Ok(outcome) => {
                diags.extend(warnings_to_diagnostics(&outcome.warnings, None, &source.range));
                outcome
            }
            Err(err) => {
                diags.extend(warnings_to_diagnostics(&[], Some(&err), &source.range));
                return (None, diags);
            }
        };

        // Provisioners may reference build.<generated var>; the real values
        // only exist at run time, so placeholders stand in during prepare.
        let mut build_value = hcl::Map::new();
        build_value.insert(
            "name".to_string(),
            Value::String(build_name.clone().unwrap_or_default()),
        );
        for generated in &outcome.generated_vars {
            build_value.insert(
                generated.clone(),
                Value::String(UNKNOWN_PLACEHOLDER.to_string()),
            );
        }
        ctx.declare_var("build", Value::Object(build_value));

        let mut provisioners = vec![];
        for block in &build.provisioners {
            if block.only_except.skip(&format!("{}.{source_name}", source.type_name)) {
                continue;
            }
            let (provisioner, more_diags) = self.start_provisioner(block, &ctx, registry);
            diags.extend(more_diags);
            match provisioner {
                Some(provisioner) => provisioners.push(provisioner),
                None => return (None, diags),
            }
        }

        let error_cleanup_provisioner = match &build.error_cleanup_provisioner {
            Some(block) if !block.only_except.skip(&format!("{}.{source_name}", source.type_name)) => {
                let (provisioner, more_diags) = self.start_provisioner(block, &ctx, registry);
                diags.extend(more_diags);
                match provisioner {
                    Some(provisioner) => Some(provisioner),
                    None => return (None, diags),
                }
            }
            _ => None,
        };

        let mut post_processors = vec![];
        for chain in &build.post_processor_lists {
            let mut core_chain = vec![];
            for block in chain {
                if block
                    .only_except
                    .skip(&format!("{}.{source_name}", source.type_name))
                {
                    continue;
                }

                // -except also filters individual post-processors by name
                let mut skipped = false;
                for (matcher, matched) in except.iter().zip(except_matched.iter_mut()) {
                    if matcher.is_match(block.display_name()) {
                        *matched = true;
                        skipped = true;
                    }
                }
                if skipped {
                    continue;
                }

                let (post_processor, more_diags) =
                    self.start_post_processor(block, &ctx, registry);
                diags.extend(more_diags);
                match post_processor {
                    Some(post_processor) => core_chain.push(post_processor),
                    None => return (None, diags),
                }
            }
            if !core_chain.is_empty() {
                post_processors.push(core_chain);
            }
        }

        (
            Some(CoreBuild {
                name: full_name,
                build_name: build_name.clone(),
                source: use_block.source.clone(),
                builder_type: source.type_name.clone(),
                builder,
                builder_config: config,
                communicator,
                provisioners,
                error_cleanup_provisioner,
                post_processors,
            }),
            diags,
        )
    }

    fn start_provisioner(
        &self,
        block: &ProvisionerBlock,
        ctx: &Context<'_>,
        registry: &Registry,
    ) -> (Option<CoreBuildProvisioner>, Diagnostics) {
        let mut diags = Diagnostics::new();

        let mut provisioner = match registry.start_provisioner(&block.type_name) {
            Ok(provisioner) => provisioner,
            Err(err) => {
                diags.push(err.to_diagnostic(&block.range));
                return (None, diags);
            }
        };

        let (config, decode_diags) =
            decode_spec(&block.body, ctx, &provisioner.config_spec(), &block.range);
        diags.extend(decode_diags);
        if diags.has_errors() {
            return (None, diags);
        }

        match provisioner.prepare(&config) {
            Ok(warnings) => diags.extend(warnings_to_diagnostics(&warnings, None, &block.range)),
            Err(err) => {
                diags.extend(warnings_to_diagnostics(&[], Some(&err), &block.range));
                return (None, diags);
            }
        }

        (
            Some(CoreBuildProvisioner {
                ptype: block.type_name.clone(),
                pname: block.display_name().to_string(),
                provisioner,
                config,
            }),
            diags,
        )
    }

    fn start_post_processor(
        &self,
        block: &PostProcessorBlock,
        ctx: &Context<'_>,
        registry: &Registry,
    ) -> (Option<CoreBuildPostProcessor>, Diagnostics) {
        let mut diags = Diagnostics::new();

        let mut post_processor = match registry.start_post_processor(&block.type_name) {
            Ok(post_processor) => post_processor,
            Err(err) => {
                diags.push(err.to_diagnostic(&block.range));
                return (None, diags);
            }
        };

        let (config, decode_diags) =
            decode_spec(&block.body, ctx, &post_processor.config_spec(), &block.range);
        diags.extend(decode_diags);
        if diags.has_errors() {
            return (None, diags);
        }

        match post_processor.configure(&config) {
            Ok(warnings) => diags.extend(warnings_to_diagnostics(&warnings, None, &block.range)),
            Err(err) => {
                diags.extend(warnings_to_diagnostics(&[], Some(&err), &block.range));
                return (None, diags);
            }
        }

        (
            Some(CoreBuildPostProcessor {
                ptype: block.type_name.clone(),
                pname: block.display_name().to_string(),
                keep_input_artifact: block.keep_input_artifact,
                post_processor,
                config,
            }),
            diags,
        )
    }
}

/// Overlays the build-side override attributes on top of the source block's
/// own body.
fn merge_body(
    base: &hcl_edit::structure::Body,
    overrides: Option<&hcl_edit::structure::Body>,
) -> hcl_edit::structure::Body {
    let mut merged = base.clone();
    let Some(overrides) = overrides else {
        return merged;
    };

    for attribute in overrides.attributes() {
        merged.remove_attribute(attribute.key.as_str());
        merged.push(attribute.clone());
    }
    for block in overrides.blocks() {
        merged.push(block.clone());
    }
    merged
}

fn compile_globs(patterns: &[String], option: &str) -> (Vec<globset::GlobMatcher>, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut matchers = vec![];
    for pattern in patterns {
        match globset::Glob::new(pattern) {
            Ok(glob) => matchers.push(glob.compile_matcher()),
            Err(err) => diags.push(
                Diagnostic::error(format!("Invalid '{option}' pattern {pattern:?}"))
                    .with_detail(err.to_string()),
            ),
        }
    }
    (matchers, diags)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::variables::LocalBlock;
    use pretty_assertions::assert_eq;

    fn expression(source: &str) -> hcl::Expression {
        let expr: hcl_edit::expr::Expression = source.parse().expect("expression must parse");
        expr.into()
    }

    fn empty_config() -> PackerConfig {
        PackerConfig::new("/tmp/project", semver::Version::new(1, 10, 0))
    }

    fn local(name: &str, expr: &str) -> LocalBlock {
        LocalBlock {
            name: name.to_string(),
            expr: expression(expr),
            sensitive: false,
            range: SourceRange::default(),
        }
    }

    #[test]
    fn eval_context_namespaces() {
        let config = empty_config();
        let ctx = config.eval_context();

        let version = expression("packer.version").evaluate(&ctx).unwrap();
        assert_eq!(version, Value::String("1.10.0".into()));

        let root = expression("path.root").evaluate(&ctx).unwrap();
        assert_eq!(root, Value::String("/tmp/project".into()));
    }

    #[test]
    fn locals_resolve_independent_of_declaration_order() {
        let mut config = empty_config();
        // a depends on b, but is declared first
        config.local_blocks = vec![
            local("a", "\"${local.b}-suffix\""),
            local("b", "\"base\""),
        ];

        let diags = config.evaluate_locals();
        assert!(!diags.has_errors(), "{diags}");
        assert_eq!(
            config.local_values.get("a"),
            Some(&Value::String("base-suffix".into()))
        );
    }

    #[test]
    fn local_cycle_is_detected() {
        let mut config = empty_config();
        config.local_blocks = vec![local("a", "local.b"), local("b", "local.a")];

        let diags = config.evaluate_locals();
        assert!(diags.has_errors());
        assert!(diags.to_string().contains("Cyclic local value"));
    }

    #[test]
    fn local_with_unknown_reference_reports_the_eval_error() {
        let mut config = empty_config();
        config.local_blocks = vec![local("a", "var.missing")];

        let diags = config.evaluate_locals();
        assert!(diags.has_errors());
        assert!(diags.to_string().contains("Failed to evaluate local.a"));
    }

    #[test]
    fn communicator_references() {
        let ref_ = CommunicatorRef::from_string("ssh.default").unwrap();
        assert_eq!(ref_, CommunicatorRef::new("ssh", "default"));
        assert!(CommunicatorRef::from_string("ssh").is_err());
    }

    #[test]
    fn merge_body_overrides_win() {
        let base = hcl_edit::parser::parse_body("region = \"us-east-1\"\nretries = 1").unwrap();
        let overrides = hcl_edit::parser::parse_body("region = \"eu-west-1\"").unwrap();

        let merged = merge_body(&base, Some(&overrides));
        let attribute = merged.get_attribute("region").unwrap();
        let expr: hcl::Expression = attribute.value.clone().into();
        let value = expr.evaluate(&Context::new()).unwrap();
        assert_eq!(value, Value::String("eu-west-1".into()));
        assert!(merged.get_attribute("retries").is_some());
    }

    #[test]
    fn get_builds_without_build_blocks_is_an_error() {
        let config = empty_config();
        let registry = crate::plugin::test::test_registry();
        let (builds, diags) = config.get_builds(&GetBuildsOptions::default(), &registry);
        assert!(builds.is_empty());
        assert!(diags.has_errors());
        assert!(diags.to_string().contains("Missing build block"));
    }
}
