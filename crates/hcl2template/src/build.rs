//! `build` blocks
//!
//! A build block ties sources to provisioners and post-processors:
//!
//! ```hcl
//! build {
//!   sources = ["source.amazon-ebs.ubuntu"]
//!
//!   provisioner "shell" {
//!     inline = ["echo hello"]
//!   }
//!
//!   post-processor "manifest" {}
//! }
//! ```
//!
//! The `name`, `description` and `sources` attributes may use expressions, so
//! they are kept unevaluated until builds are materialized with the full
//! variable/local/data context.

use crate::diagnostics::{Diagnostic, Diagnostics, SourceRange};
use crate::plugin::{ComponentKind, Registry};
use crate::source::{SourceRef, SourceUseBlock};
use crate::util::did_you_mean;
use hcl::eval::{Context, Evaluate};
use hcl::Value;

/// Block-level `only`/`except` filters, matched against the
/// `<type>.<name>` of the source being built.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OnlyExcept {
    pub only: Vec<String>,
    pub except: Vec<String>,
}

impl OnlyExcept {
    /// Whether the block should be skipped for `source_name`.
    pub fn skip(&self, source_name: &str) -> bool {
        if !self.only.is_empty() && !self.only.iter().any(|o| o == source_name) {
            return true;
        }
        self.except.iter().any(|e| e == source_name)
    }

    pub fn is_empty(&self) -> bool {
        self.only.is_empty() && self.except.is_empty()
    }
}

/// A `provisioner "type" {}` block inside a build.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionerBlock {
    pub type_name: String,
    /// Optional display name, from the `name` attribute.
    pub name: Option<String>,
    pub only_except: OnlyExcept,
    /// Remaining body, decoded against the plugin's schema later.
    pub body: hcl_edit::structure::Body,
    pub range: SourceRange,
}

impl ProvisionerBlock {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.type_name)
    }
}

/// A `post-processor "type" {}` block inside a build.
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessorBlock {
    pub type_name: String,
    pub name: Option<String>,
    pub keep_input_artifact: Option<bool>,
    pub only_except: OnlyExcept,
    pub body: hcl_edit::structure::Body,
    pub range: SourceRange,
}

impl PostProcessorBlock {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.type_name)
    }
}

/// A decoded `build` block.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BuildBlock {
    pub name: Option<hcl::Expression>,
    pub description: Option<hcl::Expression>,
    /// The `sources = [...]` attribute, unevaluated.
    pub sources_expr: Option<hcl::Expression>,
    /// Reference to a declared `communicator` block, `<type>.<name>`.
    pub communicator: Option<hcl::Expression>,
    /// Nested `source "source.type.name" {}` uses with body overrides.
    pub source_uses: Vec<SourceUseBlock>,
    pub provisioners: Vec<ProvisionerBlock>,
    /// Run only when provisioning fails.
    pub error_cleanup_provisioner: Option<ProvisionerBlock>,
    /// Each inner list is a sequential chain fed the previous artifact.
    pub post_processor_lists: Vec<Vec<PostProcessorBlock>>,
    pub range: SourceRange,
}

impl BuildBlock {
    /// Evaluates the build's name with the given context. An unnamed build
    /// yields `None`.
    pub fn resolved_name(&self, ectx: &Context<'_>) -> Result<Option<String>, Diagnostic> {
        let Some(expr) = &self.name else {
            return Ok(None);
        };
        match expr.clone().evaluate(ectx) {
            Ok(Value::String(name)) => Ok(Some(name)),
            Ok(other) => Err(Diagnostic::error("Invalid build name")
                .with_detail(format!("The build name must be a string, got {other}."))
                .with_subject(self.range.clone())),
            Err(errors) => Err(Diagnostic::error("Failed to evaluate build name")
                .with_detail(errors.to_string())
                .with_subject(self.range.clone())),
        }
    }

    /// All sources this build uses: the evaluated `sources` list first, then
    /// the nested `source` blocks.
    pub fn sources(&self, ectx: &Context<'_>) -> (Vec<SourceUseBlock>, Diagnostics) {
        let mut diags = Diagnostics::new();
        let mut uses = vec![];

        if let Some(expr) = &self.sources_expr {
            match expr.clone().evaluate(ectx) {
                Ok(Value::Array(items)) => {
                    for item in items {
                        let Value::String(text) = item else {
                            diags.push(
                                Diagnostic::error("Invalid sources list")
                                    .with_detail("Every entry must be a source reference string.")
                                    .with_subject(self.range.clone()),
                            );
                            continue;
                        };
                        match SourceRef::from_string(&text) {
                            Ok(ref_) => uses.push(SourceUseBlock::reference(ref_)),
                            Err(diag) => diags.push(diag.with_subject(self.range.clone())),
                        }
                    }
                }
                Ok(_) => diags.push(
                    Diagnostic::error("Invalid sources list")
                        .with_detail("The sources attribute must be a list of strings.")
                        .with_subject(self.range.clone()),
                ),
                Err(errors) => diags.push(
                    Diagnostic::error("Failed to evaluate sources list")
                        .with_detail(errors.to_string())
                        .with_subject(self.range.clone()),
                ),
            }
        }

        uses.extend(self.source_uses.iter().cloned());

        if uses.is_empty() && diags.is_empty() {
            diags.push(
                Diagnostic::error("Missing source reference")
                    .with_detail("A build block must reference at least one source to be built.")
                    .with_subject(self.range.clone()),
            );
        }

        (uses, diags)
    }
}

/// Structurally decodes a `build` block. Nested provisioner and
/// post-processor types are validated against the registry; a bad nested
/// block is dropped while its siblings are kept.
pub fn decode_build_block(
    block: &hcl_edit::structure::Block,
    location: &SourceRange,
    registry: &Registry,
) -> (BuildBlock, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut build = BuildBlock {
        range: location.clone(),
        ..BuildBlock::default()
    };

    for attribute in block.body.attributes() {
        let expr: hcl::Expression = attribute.value.clone().into();
        match attribute.key.as_str() {
            "name" => build.name = Some(expr),
            "description" => build.description = Some(expr),
            "sources" => build.sources_expr = Some(expr),
            "communicator" => build.communicator = Some(expr),
            other => diags.push(
                Diagnostic::error(format!("Unsupported argument {other:?}"))
                    .with_detail(
                        "Valid build arguments are `name`, `description`, `sources` and \
                         `communicator`.",
                    )
                    .with_subject(location.clone()),
            ),
        }
    }

    for nested in block.body.blocks() {
        match nested.ident.as_str() {
            "source" => match decode_build_source(nested, location) {
                Ok(use_block) => build.source_uses.push(use_block),
                Err(diag) => diags.push(diag),
            },
            "provisioner" => {
                let (provisioner, more_diags) =
                    decode_provisioner_block(nested, location, registry);
                diags.extend(more_diags);
                if let Some(provisioner) = provisioner {
                    build.provisioners.push(provisioner);
                }
            }
            "error-cleanup-provisioner" => {
                let (provisioner, more_diags) =
                    decode_provisioner_block(nested, location, registry);
                diags.extend(more_diags);
                let Some(provisioner) = provisioner else {
                    continue;
                };
                if build.error_cleanup_provisioner.is_some() {
                    diags.push(
                        Diagnostic::error("Only one error-cleanup-provisioner is allowed")
                            .with_subject(location.clone()),
                    );
                    continue;
                }
                build.error_cleanup_provisioner = Some(provisioner);
            }
            "post-processor" => {
                let (post_processor, more_diags) =
                    decode_post_processor_block(nested, location, registry);
                diags.extend(more_diags);
                if let Some(post_processor) = post_processor {
                    build.post_processor_lists.push(vec![post_processor]);
                }
            }
            "post-processors" => {
                let mut chain = vec![];
                let mut errored = false;
                for inner in nested.body.blocks() {
                    if inner.ident.as_str() != "post-processor" {
                        diags.push(
                            Diagnostic::error(format!(
                                "Unsupported block {:?}",
                                inner.ident.as_str()
                            ))
                            .with_detail(
                                "A post-processors chain may only contain `post-processor` \
                                 blocks.",
                            )
                            .with_subject(location.clone()),
                        );
                        errored = true;
                        continue;
                    }
                    let (post_processor, more_diags) =
                        decode_post_processor_block(inner, location, registry);
                    diags.extend(more_diags);
                    match post_processor {
                        Some(post_processor) => chain.push(post_processor),
                        None => errored = true,
                    }
                }
                // a chain feeds each artifact forward, a broken link voids it
                if !errored {
                    build.post_processor_lists.push(chain);
                }
            }
            other => diags.push(
                Diagnostic::error(format!("Unsupported block {other:?}"))
                    .with_detail(
                        "Valid nested blocks are `source`, `provisioner`, \
                         `error-cleanup-provisioner`, `post-processor` and `post-processors`.",
                    )
                    .with_subject(location.clone()),
            ),
        }
    }

    (build, diags)
}

/// Decodes a nested `source "source.type.name" {}` use. The `name`
/// attribute sets a local name; everything else overrides the source's own
/// body.
fn decode_build_source(
    block: &hcl_edit::structure::Block,
    location: &SourceRange,
) -> Result<SourceUseBlock, Diagnostic> {
    let Some(label) = block.labels.first().map(|label| label.as_str().to_string()) else {
        return Err(Diagnostic::error("Invalid source reference")
            .with_detail(
                "A nested source block requires a reference label: \
                 `source \"source.type.name\" {}`.",
            )
            .with_subject(location.clone()));
    };

    let source = SourceRef::from_string(&label).map_err(|d| d.with_subject(location.clone()))?;

    let mut body = block.body.clone();
    let local_name = body.remove_attribute("name").and_then(|attribute| {
        let expr: hcl::Expression = attribute.value.clone().into();
        match expr.evaluate(&Context::new()) {
            Ok(Value::String(name)) => Some(name),
            _ => None,
        }
    });

    Ok(SourceUseBlock {
        source,
        local_name,
        body: (!body.is_empty()).then_some(body),
    })
}

pub fn decode_provisioner_block(
    block: &hcl_edit::structure::Block,
    location: &SourceRange,
    registry: &Registry,
) -> (Option<ProvisionerBlock>, Diagnostics) {
    let mut diags = Diagnostics::new();

    let Some(type_name) = block.labels.first().map(|label| label.as_str().to_string()) else {
        diags.push(
            Diagnostic::error("Invalid provisioner block")
                .with_detail("A provisioner block requires a type: `provisioner \"type\" {}`.")
                .with_subject(location.clone()),
        );
        return (None, diags);
    };

    if !registry.has(ComponentKind::Provisioner, &type_name)
        && registry
            .redirect(ComponentKind::Provisioner, &type_name)
            .is_none()
    {
        let known = registry.list(ComponentKind::Provisioner);
        let mut detail = format!("Known provisioner types: {}.", known.join(", "));
        if let Some(suggestion) = did_you_mean(&type_name, known.iter().map(String::as_str)) {
            detail.push_str(&format!(" Did you mean {suggestion:?}?"));
        }
        diags.push(
            Diagnostic::error(format!("Unknown provisioner type {type_name:?}"))
                .with_detail(detail)
                .with_subject(location.clone()),
        );
        return (None, diags);
    }

    let mut body = block.body.clone();
    let name = take_string_attribute(&mut body, "name");
    let (only_except, more_diags) = take_only_except(&mut body, location);
    diags.extend(more_diags);

    (
        Some(ProvisionerBlock {
            type_name,
            name,
            only_except,
            body,
            range: location.clone(),
        }),
        diags,
    )
}

pub fn decode_post_processor_block(
    block: &hcl_edit::structure::Block,
    location: &SourceRange,
    registry: &Registry,
) -> (Option<PostProcessorBlock>, Diagnostics) {
    let mut diags = Diagnostics::new();

    let Some(type_name) = block.labels.first().map(|label| label.as_str().to_string()) else {
        diags.push(
            Diagnostic::error("Invalid post-processor block")
                .with_detail(
                    "A post-processor block requires a type: `post-processor \"type\" {}`.",
                )
                .with_subject(location.clone()),
        );
        return (None, diags);
    };

    if !registry.has(ComponentKind::PostProcessor, &type_name)
        && registry
            .redirect(ComponentKind::PostProcessor, &type_name)
            .is_none()
    {
        let known = registry.list(ComponentKind::PostProcessor);
        let mut detail = format!("Known post-processor types: {}.", known.join(", "));
        if let Some(suggestion) = did_you_mean(&type_name, known.iter().map(String::as_str)) {
            detail.push_str(&format!(" Did you mean {suggestion:?}?"));
        }
        diags.push(
            Diagnostic::error(format!("Unknown post-processor type {type_name:?}"))
                .with_detail(detail)
                .with_subject(location.clone()),
        );
        return (None, diags);
    }

    let mut body = block.body.clone();
    let name = take_string_attribute(&mut body, "name");
    let keep_input_artifact = body.remove_attribute("keep_input_artifact").and_then(|a| {
        let expr: hcl::Expression = a.value.clone().into();
        match expr.evaluate(&Context::new()) {
            Ok(Value::Bool(b)) => Some(b),
            _ => None,
        }
    });
    let (only_except, more_diags) = take_only_except(&mut body, location);
    diags.extend(more_diags);

    (
        Some(PostProcessorBlock {
            type_name,
            name,
            keep_input_artifact,
            only_except,
            body,
            range: location.clone(),
        }),
        diags,
    )
}

fn take_string_attribute(body: &mut hcl_edit::structure::Body, key: &str) -> Option<String> {
    body.remove_attribute(key).and_then(|attribute| {
        let expr: hcl::Expression = attribute.value.clone().into();
        match expr.evaluate(&Context::new()) {
            Ok(Value::String(text)) => Some(text),
            _ => None,
        }
    })
}

fn take_only_except(
    body: &mut hcl_edit::structure::Body,
    location: &SourceRange,
) -> (OnlyExcept, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut only_except = OnlyExcept::default();

    for (key, target) in [("only", 0usize), ("except", 1)] {
        let Some(attribute) = body.remove_attribute(key) else {
            continue;
        };
        let expr: hcl::Expression = attribute.value.clone().into();
        match expr.evaluate(&Context::new()) {
            Ok(Value::Array(items))
                if items.iter().all(|item| matches!(item, Value::String(_))) =>
            {
                let names = items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::String(name) => Some(name),
                        _ => None,
                    })
                    .collect();
                if target == 0 {
                    only_except.only = names;
                } else {
                    only_except.except = names;
                }
            }
            _ => diags.push(
                Diagnostic::error(format!("Invalid {key} filter"))
                    .with_detail(format!(
                        "The {key} attribute must be a list of source name strings."
                    ))
                    .with_subject(location.clone()),
            ),
        }
    }

    (only_except, diags)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plugin::test::test_registry;
    use crate::plugin::{Provisioner, Registry};
    use crate::schema::{ConfigSpec, Decodable, DecodedConfig, SchemaType};
    use pretty_assertions::assert_eq;

    struct ShellProvisioner;

    impl Decodable for ShellProvisioner {
        fn config_spec(&self) -> ConfigSpec {
            ConfigSpec::new().optional("inline", SchemaType::list(SchemaType::String))
        }
    }

    impl Provisioner for ShellProvisioner {
        fn prepare(&mut self, _config: &DecodedConfig) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
    }

    fn registry() -> Registry {
        let mut registry = test_registry();
        registry.register_provisioner("shell", Box::new(|| Box::new(ShellProvisioner)));
        registry
    }

    fn decode(source: &str) -> (BuildBlock, Diagnostics) {
        let body = hcl_edit::parser::parse_body(source).expect("body must parse");
        let block = body.into_blocks().next().expect("one block");
        decode_build_block(&block, &SourceRange::default(), &registry())
    }

    #[test]
    fn full_build_block() {
        let (build, diags) = decode(
            r#"build {
  name    = "web"
  sources = ["source.null.test"]

  provisioner "shell" {
    inline = ["echo hello"]
  }

  post-processor "manifest" {}
}"#,
        );
        // manifest is not registered and has no redirect
        assert!(diags.has_errors());
        assert_eq!(build.provisioners.len(), 1);
        assert_eq!(build.provisioners[0].type_name, "shell");
        assert!(build.post_processor_lists.is_empty());

        let ctx = Context::new();
        assert_eq!(build.resolved_name(&ctx).unwrap(), Some("web".to_string()));
        let (uses, diags) = build.sources(&ctx);
        assert!(!diags.has_errors(), "{diags}");
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].source, SourceRef::new("null", "test"));
    }

    #[test]
    fn build_without_sources_is_an_error() {
        let (build, diags) = decode("build {\n}");
        assert!(!diags.has_errors());
        let (_, diags) = build.sources(&Context::new());
        assert!(diags.has_errors());
        assert!(diags.to_string().contains("Missing source reference"));
    }

    #[test]
    fn nested_source_with_overrides() {
        let (build, diags) = decode(
            r#"build {
  source "source.null.test" {
    name   = "renamed"
    region = "eu-west-1"
  }
}"#,
        );
        assert!(!diags.has_errors(), "{diags}");
        let (uses, _) = build.sources(&Context::new());
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].local_name.as_deref(), Some("renamed"));
        assert!(uses[0].body.is_some());
        assert_eq!(uses[0].display_name(), "renamed");
    }

    #[test]
    fn provisioner_only_except_is_lifted_out_of_the_body() {
        let (build, diags) = decode(
            r#"build {
  sources = ["source.null.test"]

  provisioner "shell" {
    only   = ["null.test"]
    inline = ["echo hello"]
  }
}"#,
        );
        assert!(!diags.has_errors(), "{diags}");
        let provisioner = &build.provisioners[0];
        assert_eq!(provisioner.only_except.only, vec!["null.test"]);
        assert!(!provisioner.only_except.skip("null.test"));
        assert!(provisioner.only_except.skip("null.other"));
        // the filter attributes must not leak into the plugin config
        assert!(provisioner.body.get_attribute("only").is_none());
        assert!(provisioner.body.get_attribute("inline").is_some());
    }

    #[test]
    fn unknown_provisioner_keeps_siblings() {
        let (build, diags) = decode(
            r#"build {
  sources = ["source.null.test"]

  provisioner "ansible" {}
  provisioner "shell" {}
}"#,
        );
        assert!(diags.has_errors());
        assert_eq!(build.provisioners.len(), 1);
        assert_eq!(build.provisioners[0].type_name, "shell");
    }

    #[test]
    fn only_except_skip_rules() {
        let filter = OnlyExcept {
            only: vec![],
            except: vec!["null.skipme".into()],
        };
        assert!(filter.skip("null.skipme"));
        assert!(!filter.skip("null.other"));
    }
}
