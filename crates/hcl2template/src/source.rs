//! `source` blocks
//!
//! A `source "type" "name" {}` block declares a reusable builder
//! configuration. The block body is not decoded here; it is kept addressable
//! through its document index so a build can re-decode it on demand, with
//! build-specific values merged in.

use crate::diagnostics::{Diagnostic, Diagnostics, SourceRange};
use crate::plugin::{ComponentKind, Registry};
use crate::util::did_you_mean;
use indexmap::IndexMap;

/// Key into the configuration's source table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub type_name: String,
    pub name: String,
}

impl SourceRef {
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
        }
    }

    /// Parses a source reference string as used in a build block's `sources`
    /// list: `source.<type>.<name>` or the shorthand `<type>.<name>`.
    pub fn from_string(text: &str) -> Result<Self, Diagnostic> {
        let trimmed = text.strip_prefix("source.").unwrap_or(text);
        match trimmed.split('.').collect::<Vec<_>>().as_slice() {
            [type_name, name] if !type_name.is_empty() && !name.is_empty() => {
                Ok(Self::new(*type_name, *name))
            }
            _ => Err(Diagnostic::error(format!("Invalid source reference {text:?}"))
                .with_detail(
                    "A source reference has the form `source.<type>.<name>`, for example \
                     `source.amazon-ebs.ubuntu`.",
                )),
        }
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.type_name, self.name)
    }
}

/// A declared `source` block, body left undecoded.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBlock {
    pub type_name: String,
    pub name: String,
    /// Index of the root block in [crate::documents::TemplateFiles].
    pub block_index: usize,
    pub range: SourceRange,
}

impl SourceBlock {
    pub fn ref_(&self) -> SourceRef {
        SourceRef::new(&self.type_name, &self.name)
    }
}

/// How a build block uses a source: by reference, optionally with a local
/// name and body overrides merged over the source's own body.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceUseBlock {
    pub source: SourceRef,
    pub local_name: Option<String>,
    pub body: Option<hcl_edit::structure::Body>,
}

impl SourceUseBlock {
    pub fn reference(source: SourceRef) -> Self {
        Self {
            source,
            local_name: None,
            body: None,
        }
    }

    /// The name this use goes by inside the build, used for
    /// `packer_build_name`.
    pub fn display_name(&self) -> &str {
        self.local_name.as_deref().unwrap_or(&self.source.name)
    }
}

/// Decodes the labels of a `source` block and checks the builder type
/// against the registry. A type the registry can neither start nor redirect
/// to a plugin is an error naming the known types.
pub fn decode_source_block(
    block: &hcl_edit::structure::Block,
    block_index: usize,
    location: &SourceRange,
    registry: &Registry,
) -> (Option<SourceBlock>, Diagnostics) {
    let mut diags = Diagnostics::new();

    let (Some(type_name), Some(name)) = (
        block.labels.first().map(|label| label.as_str().to_string()),
        block.labels.get(1).map(|label| label.as_str().to_string()),
    ) else {
        diags.push(
            Diagnostic::error("Invalid source block")
                .with_detail(
                    "A source block requires a type and a name: `source \"type\" \"name\" {}`.",
                )
                .with_subject(location.clone()),
        );
        return (None, diags);
    };

    if !registry.has(ComponentKind::Builder, &type_name)
        && registry.redirect(ComponentKind::Builder, &type_name).is_none()
    {
        let known = registry.list(ComponentKind::Builder);
        let mut detail = format!("Known builder types: {}.", known.join(", "));
        if let Some(suggestion) = did_you_mean(&type_name, known.iter().map(String::as_str)) {
            detail.push_str(&format!(" Did you mean {suggestion:?}?"));
        }
        diags.push(
            Diagnostic::error(format!("Unknown builder type {type_name:?}"))
                .with_detail(detail)
                .with_subject(location.clone()),
        );
        return (None, diags);
    }

    (
        Some(SourceBlock {
            type_name,
            name,
            block_index,
            range: location.clone(),
        }),
        diags,
    )
}

/// The source table; insertion enforces (type, name) uniqueness.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Sources {
    sources: IndexMap<SourceRef, SourceBlock>,
}

impl Sources {
    /// Registers a source. On a duplicate (type, name) the first declaration
    /// wins and the later one is reported.
    pub fn insert(&mut self, source: SourceBlock) -> Result<(), Diagnostic> {
        let ref_ = source.ref_();
        match self.sources.get(&ref_) {
            Some(previous) => Err(Diagnostic::error(format!(
                "Duplicate source block source.{ref_}"
            ))
            .with_detail(format!("Previously declared at {}.", previous.range))
            .with_subject(source.range)),
            None => {
                self.sources.insert(ref_, source);
                Ok(())
            }
        }
    }

    pub fn get(&self, ref_: &SourceRef) -> Option<&SourceBlock> {
        self.sources.get(ref_)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceBlock> {
        self.sources.values()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plugin::test::test_registry;
    use pretty_assertions::assert_eq;

    fn block(source: &str) -> hcl_edit::structure::Block {
        let body = hcl_edit::parser::parse_body(source).expect("body must parse");
        body.into_blocks().next().expect("one block")
    }

    fn decode(source: &str) -> (Option<SourceBlock>, Diagnostics) {
        decode_source_block(&block(source), 0, &SourceRange::default(), &test_registry())
    }

    #[test]
    fn reference_strings() {
        let ref_ = SourceRef::from_string("source.amazon-ebs.ubuntu").unwrap();
        assert_eq!(ref_, SourceRef::new("amazon-ebs", "ubuntu"));
        assert_eq!(ref_.to_string(), "amazon-ebs.ubuntu");

        // shorthand without the prefix
        assert_eq!(
            SourceRef::from_string("amazon-ebs.ubuntu").unwrap(),
            SourceRef::new("amazon-ebs", "ubuntu")
        );

        assert!(SourceRef::from_string("just-a-type").is_err());
    }

    #[test]
    fn known_builder_type_decodes() {
        let (source, diags) = decode("source \"null\" \"test\" {}");
        assert!(!diags.has_errors(), "{diags}");
        assert_eq!(source.unwrap().ref_(), SourceRef::new("null", "test"));
    }

    #[test]
    fn redirectable_type_decodes_without_a_registered_builder() {
        let (source, diags) = decode("source \"amazon-ebs\" \"ubuntu\" {}");
        assert!(!diags.has_errors(), "{diags}");
        assert!(source.is_some());
    }

    #[test]
    fn unknown_builder_type_names_known_types() {
        let (source, diags) = decode("source \"docker\" \"x\" {}");
        assert!(source.is_none());
        assert!(diags.has_errors());
        assert!(diags.to_string().contains("Known builder types: null."));
    }

    #[test]
    fn typo_gets_a_suggestion() {
        let (_, diags) = decode("source \"nul\" \"x\" {}");
        assert!(diags.to_string().contains("Did you mean \"null\"?"));
    }

    #[test]
    fn duplicates_keep_the_first_declaration() {
        let mut sources = Sources::default();
        let (first, _) = decode("source \"null\" \"x\" {}");
        let (second, _) = decode("source \"null\" \"x\" {}");

        sources.insert(first.unwrap()).unwrap();
        let err = sources.insert(second.unwrap()).unwrap_err();
        assert_eq!(err.summary, "Duplicate source block source.null.x");
        assert_eq!(sources.len(), 1);
    }
}
