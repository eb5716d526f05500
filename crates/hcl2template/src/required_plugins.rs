//! `required_plugins` blocks
//!
//! Explicit plugin requirements are declared inside the `packer` block:
//!
//! ```hcl
//! packer {
//!   required_plugins {
//!     amazon = {
//!       source  = "github.com/hashicorp/amazon"
//!       version = "~> 1.2"
//!     }
//!   }
//! }
//! ```
//!
//! Implicit requirements are synthesized from blocks whose component type is
//! not registered but has a known redirect to a plugin source. The
//! explicit/implicit distinction is preserved because implicit requirements
//! must not satisfy strict "all plugins pinned" validation modes.

use crate::addrs::{is_plugin_part_normalized, parse_plugin_part, parse_plugin_source_string, Plugin};
use crate::diagnostics::{Diagnostic, Diagnostics, SourceRange};
use hcl::eval::{Context, Evaluate};
use hcl::Value;
use indexmap::IndexMap;

/// A version constraint such as `~> 1.2` or `>= 1.0, < 2.0`. `None` means
/// unconstrained, i.e. "latest".
#[derive(Debug, Clone, PartialEq)]
pub struct VersionConstraint {
    pub required: Option<semver::VersionReq>,
    original: String,
}

impl VersionConstraint {
    pub fn latest() -> Self {
        Self {
            required: None,
            original: String::new(),
        }
    }

    /// Parses the constraint grammar, including the `~>` pessimistic
    /// operator.
    pub fn parse(text: &str) -> Result<Self, semver::Error> {
        let translated = text
            .split(',')
            .map(|part| translate_pessimistic(part.trim()))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(Self {
            required: Some(translated.parse()?),
            original: text.to_string(),
        })
    }

    pub fn is_constrained(&self) -> bool {
        self.required.is_some()
    }

    pub fn matches(&self, version: &semver::Version) -> bool {
        match &self.required {
            Some(req) => req.matches(version),
            None => true,
        }
    }
}

/// Pessimistic constraints pin every given segment and allow the next one to
/// float: `~> 1.2` means `>= 1.2, < 2.0.0` while `~> 1.2.3` means
/// `>= 1.2.3, < 1.3.0`. The semver tilde only covers the latter, so
/// two-segment constraints are spelled out as a range.
fn translate_pessimistic(part: &str) -> String {
    let Some(rest) = part.strip_prefix("~>") else {
        return part.to_string();
    };
    let rest = rest.trim_start();

    let segments: Vec<&str> = rest.split('.').collect();
    if segments.len() == 2 {
        if let Ok(major) = segments[0].parse::<u64>() {
            return format!(">={rest}, <{}.0.0", major + 1);
        }
    }
    format!("~{rest}")
}

impl std::fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.original)
    }
}

/// Why a plugin dependency is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginDependencyReason {
    /// Declared in a `required_plugins` block.
    Explicit,
    /// Inferred from a block that uses a redirectable component type.
    Implicit,
}

/// One declared or inferred plugin dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct RequiredPlugin {
    /// Local accessor name, left hand side of the entry.
    pub name: String,
    /// Source exactly as the template wrote it.
    pub source: String,
    pub plugin: Plugin,
    pub requirement: VersionConstraint,
    pub decl_range: SourceRange,
    pub reason: PluginDependencyReason,
}

/// The contents of one `required_plugins` block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequiredPlugins {
    plugins: IndexMap<String, RequiredPlugin>,
    pub decl_range: SourceRange,
}

impl RequiredPlugins {
    /// Adds an entry; a second entry with the same name in the same block is
    /// an error rather than a silent overwrite.
    pub fn insert(&mut self, plugin: RequiredPlugin) -> Result<(), Diagnostic> {
        match self.plugins.get(&plugin.name) {
            Some(previous) => Err(Diagnostic::error(format!(
                "Duplicate required_plugins entry {:?}",
                plugin.name
            ))
            .with_detail(format!("Previously declared at {}.", previous.decl_range))
            .with_subject(plugin.decl_range)),
            None => {
                self.plugins.insert(plugin.name.clone(), plugin);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&RequiredPlugin> {
        self.plugins.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequiredPlugin> {
        self.plugins.values()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Whether any entry resolves to a plugin with this type name. Used to
    /// suppress implicit requirements when a fork of the plugin is already
    /// required under the same type.
    pub fn requires_type(&self, type_name: &str) -> bool {
        self.plugins
            .values()
            .any(|plugin| plugin.plugin.type_name == type_name)
    }
}

/// Synthesizes the single-entry block recording an implicit requirement.
pub fn implicit_required_plugin(plugin: Plugin, decl_range: SourceRange) -> RequiredPlugins {
    let mut block = RequiredPlugins {
        decl_range: decl_range.clone(),
        ..RequiredPlugins::default()
    };
    // name collisions are impossible in a fresh block
    let _ = block.insert(RequiredPlugin {
        name: plugin.type_name.clone(),
        source: plugin.to_string(),
        plugin,
        requirement: VersionConstraint::latest(),
        decl_range,
        reason: PluginDependencyReason::Implicit,
    });
    block
}

/// Decodes one `required_plugins` block body.
pub fn decode_required_plugins_block(
    block: &hcl_edit::structure::Block,
    location: &SourceRange,
) -> (RequiredPlugins, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut plugins = RequiredPlugins {
        decl_range: location.clone(),
        ..RequiredPlugins::default()
    };

    for attribute in block.body.attributes() {
        let name = attribute.key.to_string();

        match is_plugin_part_normalized(&name) {
            Ok(true) => {}
            Ok(false) => {
                // parse_plugin_part cannot fail here, normalization already
                // succeeded above
                let normalized = parse_plugin_part(&name).unwrap_or_default();
                diags.push(
                    Diagnostic::error("Invalid plugin local name")
                        .with_detail(format!(
                            "Plugin names must be normalized. Replace {name:?} with \
                             {normalized:?} to fix this error."
                        ))
                        .with_subject(location.clone()),
                );
                continue;
            }
            Err(err) => {
                diags.push(
                    Diagnostic::error("Invalid plugin local name")
                        .with_detail(format!("{name} is an invalid plugin local name: {err}"))
                        .with_subject(location.clone()),
                );
                continue;
            }
        }

        let expr: hcl::Expression = attribute.value.clone().into();
        let value = match expr.evaluate(&Context::new()) {
            Ok(value) => value,
            Err(errors) => {
                diags.push(
                    Diagnostic::error(format!("Invalid required_plugins entry {name:?}"))
                        .with_detail(errors.to_string())
                        .with_subject(location.clone()),
                );
                continue;
            }
        };

        let entry = match value {
            Value::Object(fields) => fields,
            Value::String(version) => {
                diags.push(
                    Diagnostic::error("Invalid plugin requirement")
                        .with_detail(format!(
                            "'{name} = \"{version}\"' plugin requirement calls are not \
                             possible. You must define a whole block. For example:\n\
                             {name} = {{\n  \
                               source  = \"github.com/hashicorp/{name}\"\n  \
                               version = \"{version}\"\n\
                             }}"
                        ))
                        .with_subject(location.clone()),
                );
                continue;
            }
            _ => {
                diags.push(
                    Diagnostic::error("Invalid required_plugins syntax")
                        .with_detail("required_plugins entries must be objects.")
                        .with_subject(location.clone()),
                );
                continue;
            }
        };

        if let Some(extra) = entry.keys().find(|key| !matches!(key.as_str(), "source" | "version")) {
            diags.push(
                Diagnostic::error("Invalid required_plugins object")
                    .with_detail(format!(
                        "required_plugins objects can only contain \"version\" and \"source\" \
                         attributes; found {extra:?}."
                    ))
                    .with_subject(location.clone()),
            );
            continue;
        }

        let Some(Value::String(version)) = entry.get("version") else {
            diags.push(
                Diagnostic::error("No version constraint was set")
                    .with_detail(
                        "The version field must be specified as a string, for example: \
                         `version = \">= 1.2.0, < 2.0.0\"`.",
                    )
                    .with_subject(location.clone()),
            );
            continue;
        };

        let requirement = match VersionConstraint::parse(version) {
            Ok(requirement) => requirement,
            Err(err) => {
                diags.push(
                    Diagnostic::error("Invalid version constraint")
                        .with_detail(format!(
                            "This string does not use correct version constraint syntax: {err}"
                        ))
                        .with_subject(location.clone()),
                );
                continue;
            }
        };

        let Some(Value::String(source)) = entry.get("source") else {
            diags.push(
                Diagnostic::error("No source was set")
                    .with_detail(
                        "The source field must be specified as a string, for example: \
                         `source = \"github.com/hashicorp/amazon\"`.",
                    )
                    .with_subject(location.clone()),
            );
            continue;
        };

        let plugin = match parse_plugin_source_string(source) {
            Ok(plugin) => plugin,
            Err(err) => {
                diags.push(
                    Diagnostic::error(format!("Invalid plugin source {source:?}"))
                        .with_detail(err.to_string())
                        .with_subject(location.clone()),
                );
                continue;
            }
        };

        let result = plugins.insert(RequiredPlugin {
            name,
            source: source.clone(),
            plugin,
            requirement,
            decl_range: location.clone(),
            reason: PluginDependencyReason::Explicit,
        });
        if let Err(diag) = result {
            diags.push(diag);
        }
    }

    for nested in block.body.blocks() {
        diags.push(
            Diagnostic::error(format!("Unsupported block {:?}", nested.ident.as_str()))
                .with_detail("A required_plugins block may only contain `name = { ... }` entries.")
                .with_subject(location.clone()),
        );
    }

    (plugins, diags)
}

/// A flattened requirement handed to the external plugin installer.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginRequirement {
    /// The local name the template uses for this plugin.
    pub accessor: String,
    pub identifier: Plugin,
    pub version_constraints: VersionConstraint,
    pub reason: PluginDependencyReason,
}

/// Flattens all accumulated blocks into one list, sorted by plugin
/// identifier. The same name requiring two different plugin identities is a
/// hard error; identical redeclarations merge silently.
pub fn plugin_requirements(
    blocks: &[RequiredPlugins],
) -> (Vec<PluginRequirement>, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut uniq: IndexMap<String, &RequiredPlugin> = IndexMap::new();

    for block in blocks {
        for plugin in block.iter() {
            match uniq.get(&plugin.name) {
                Some(previous) if previous.plugin == plugin.plugin => {}
                Some(previous) => {
                    diags.push(
                        Diagnostic::error(format!(
                            "Duplicate required_plugin.{:?} block",
                            plugin.name
                        ))
                        .with_detail(format!(
                            "Block previously seen at {} is already named {:?}. Names at the \
                             left hand side of required_plugins are made available to use in \
                             your HCL2 configurations; two plugins must have different \
                             accessors.",
                            previous.decl_range, plugin.name
                        ))
                        .with_subject(plugin.decl_range.clone()),
                    );
                }
                None => {
                    uniq.insert(plugin.name.clone(), plugin);
                }
            }
        }
    }

    let mut requirements: Vec<PluginRequirement> = uniq
        .into_iter()
        .map(|(accessor, plugin)| PluginRequirement {
            accessor,
            identifier: plugin.plugin.clone(),
            version_constraints: plugin.requirement.clone(),
            reason: plugin.reason,
        })
        .collect();
    requirements.sort_by(|a, b| a.identifier.to_string().cmp(&b.identifier.to_string()));

    (requirements, diags)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn block(source: &str) -> hcl_edit::structure::Block {
        let body = hcl_edit::parser::parse_body(source).expect("body must parse");
        body.into_blocks().next().expect("one block")
    }

    fn decode(source: &str) -> (RequiredPlugins, Diagnostics) {
        decode_required_plugins_block(&block(source), &SourceRange::default())
    }

    #[test]
    fn explicit_requirement() {
        let (plugins, diags) = decode(
            r#"required_plugins {
  amazon = {
    source  = "github.com/hashicorp/amazon"
    version = "~> 1.2"
  }
}"#,
        );
        assert!(!diags.has_errors(), "{diags}");
        let amazon = plugins.get("amazon").unwrap();
        assert_eq!(amazon.plugin.to_string(), "github.com/hashicorp/amazon");
        assert_eq!(amazon.reason, PluginDependencyReason::Explicit);
        assert!(amazon.requirement.is_constrained());
        assert!(amazon
            .requirement
            .matches(&semver::Version::new(1, 3, 0)));
        assert!(!amazon
            .requirement
            .matches(&semver::Version::new(2, 0, 0)));
    }

    #[test]
    fn bare_string_requirement_shows_corrected_example() {
        let (plugins, diags) = decode("required_plugins {\n amazon = \"1.0\"\n}");
        assert!(plugins.is_empty());
        assert!(diags.has_errors());
        let rendered = diags.to_string();
        assert!(rendered.contains("You must define a whole block"), "{rendered}");
        assert!(rendered.contains("source  = \"github.com/hashicorp/amazon\""), "{rendered}");
    }

    #[test]
    fn missing_version_or_source() {
        let (_, diags) = decode(
            "required_plugins {\n amazon = {\n source = \"amazon\"\n }\n}",
        );
        assert!(diags.to_string().contains("No version constraint was set"));

        let (_, diags) = decode(
            "required_plugins {\n amazon = {\n version = \"1.0\"\n }\n}",
        );
        assert!(diags.to_string().contains("No source was set"));
    }

    #[test]
    fn extra_attributes_are_rejected() {
        let (_, diags) = decode(
            "required_plugins {\n amazon = {\n source = \"amazon\"\n version = \"1.0\"\n extra = true\n }\n}",
        );
        assert!(diags.to_string().contains("\"version\" and \"source\""));
    }

    #[test]
    fn non_normalized_name_gets_a_rename_suggestion() {
        let (_, diags) = decode(
            "required_plugins {\n Amazon = {\n source = \"amazon\"\n version = \"1.0\"\n }\n}",
        );
        assert!(diags
            .to_string()
            .contains("Replace \"Amazon\" with \"amazon\""));
    }

    #[test]
    fn duplicate_name_within_one_block_is_flagged() {
        fn entry(source: &str) -> RequiredPlugin {
            RequiredPlugin {
                name: "amazon".to_string(),
                source: source.to_string(),
                plugin: parse_plugin_source_string(source).unwrap(),
                requirement: VersionConstraint::latest(),
                decl_range: SourceRange::default(),
                reason: PluginDependencyReason::Explicit,
            }
        }

        let mut plugins = RequiredPlugins::default();
        plugins.insert(entry("github.com/hashicorp/amazon")).unwrap();

        let err = plugins.insert(entry("github.com/acme/amazon")).unwrap_err();
        assert_eq!(err.summary, "Duplicate required_plugins entry \"amazon\"");

        // first wins
        assert_eq!(plugins.len(), 1);
        assert_eq!(
            plugins.get("amazon").unwrap().source,
            "github.com/hashicorp/amazon"
        );
    }

    #[test]
    fn implicit_requirement_is_unconstrained_and_tagged() {
        let plugin = parse_plugin_source_string("github.com/hashicorp/amazon").unwrap();
        let block = implicit_required_plugin(plugin, SourceRange::default());
        let required = block.get("amazon").unwrap();
        assert_eq!(required.reason, PluginDependencyReason::Implicit);
        assert!(!required.requirement.is_constrained());
        assert!(block.requires_type("amazon"));
    }

    #[test]
    fn flatten_merges_identical_and_rejects_conflicts() {
        let plugin = parse_plugin_source_string("github.com/hashicorp/amazon").unwrap();
        let first = implicit_required_plugin(plugin.clone(), SourceRange::default());
        let second = implicit_required_plugin(plugin, SourceRange::default());

        let (requirements, diags) = plugin_requirements(&[first.clone(), second]);
        assert!(!diags.has_errors(), "{diags}");
        assert_eq!(requirements.len(), 1);
        assert_eq!(requirements[0].accessor, "amazon");

        let fork = parse_plugin_source_string("github.com/acme/amazon").unwrap();
        let conflicting = implicit_required_plugin(fork, SourceRange::default());
        let (requirements, diags) = plugin_requirements(&[first, conflicting]);
        assert!(diags.has_errors());
        assert_eq!(requirements.len(), 1);
    }

    #[test]
    fn constraint_grammar() {
        let constraint = VersionConstraint::parse(">= 1.0, < 2.0").unwrap();
        assert!(constraint.matches(&semver::Version::new(1, 5, 0)));
        assert!(!constraint.matches(&semver::Version::new(2, 0, 0)));
        assert_eq!(constraint.to_string(), ">= 1.0, < 2.0");

        assert!(VersionConstraint::parse("not a version").is_err());
    }

    #[test]
    fn pessimistic_constraints_pin_the_given_segments() {
        // ~> X.Y floats the minor up to the next major
        let minor = VersionConstraint::parse("~> 1.2").unwrap();
        assert!(minor.matches(&semver::Version::new(1, 2, 0)));
        assert!(minor.matches(&semver::Version::new(1, 9, 0)));
        assert!(!minor.matches(&semver::Version::new(2, 0, 0)));
        assert!(!minor.matches(&semver::Version::new(1, 1, 9)));

        // ~> X.Y.Z floats only the patch level
        let patch = VersionConstraint::parse("~> 1.2.3").unwrap();
        assert!(patch.matches(&semver::Version::new(1, 2, 9)));
        assert!(!patch.matches(&semver::Version::new(1, 3, 0)));

        // a zero major must not widen past 1.0
        let zero = VersionConstraint::parse("~> 0.2").unwrap();
        assert!(zero.matches(&semver::Version::new(0, 9, 0)));
        assert!(!zero.matches(&semver::Version::new(1, 0, 0)));
    }
}
