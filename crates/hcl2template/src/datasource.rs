//! `data` blocks
//!
//! A `data "type" "name" {}` block declares a lookup executed before builds
//! start. Data sources may reference each other's outputs, so each block
//! records which other data sources its body mentions; evaluation order is
//! derived from those edges.

use crate::diagnostics::{Diagnostic, Diagnostics, SourceRange};
use crate::plugin::{ComponentKind, Registry};
use crate::util::{did_you_mean, is_valid_identifier};
use crate::visit::paths_with_root;
use hcl::Value;
use indexmap::IndexMap;

/// Key into the configuration's data source table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasourceRef {
    pub type_name: String,
    pub name: String,
}

impl DatasourceRef {
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for DatasourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "data.{}.{}", self.type_name, self.name)
    }
}

/// A declared `data` block. `value` is filled in once the lookup has been
/// executed.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasourceBlock {
    pub type_name: String,
    pub name: String,
    pub block_index: usize,
    pub range: SourceRange,
    /// Other data sources this block's body references.
    pub dependencies: Vec<DatasourceRef>,
    pub value: Option<Value>,
}

impl DatasourceBlock {
    pub fn ref_(&self) -> DatasourceRef {
        DatasourceRef::new(&self.type_name, &self.name)
    }
}

/// Decodes the labels of a `data` block and records its dependency edges.
///
/// Both labels must be valid identifiers, stricter than source blocks,
/// because they double as graph-dependency keys.
pub fn decode_data_block(
    block: &hcl_edit::structure::Block,
    block_index: usize,
    location: &SourceRange,
    registry: &Registry,
) -> (Option<DatasourceBlock>, Diagnostics) {
    let mut diags = Diagnostics::new();

    let (Some(type_name), Some(name)) = (
        block.labels.first().map(|label| label.as_str().to_string()),
        block.labels.get(1).map(|label| label.as_str().to_string()),
    ) else {
        diags.push(
            Diagnostic::error("Invalid data block")
                .with_detail(
                    "A data block requires a type and a name: `data \"type\" \"name\" {}`.",
                )
                .with_subject(location.clone()),
        );
        return (None, diags);
    };

    for (label, value) in [("type", &type_name), ("name", &name)] {
        if !is_valid_identifier(value) {
            diags.push(
                Diagnostic::error(format!("Invalid data source {label} {value:?}"))
                    .with_detail(
                        "Data source types and names may only contain letters, digits, \
                         underscores and dashes, and must start with a letter.",
                    )
                    .with_subject(location.clone()),
            );
        }
    }
    if diags.has_errors() {
        return (None, diags);
    }

    if !registry.has(ComponentKind::Datasource, &type_name)
        && registry
            .redirect(ComponentKind::Datasource, &type_name)
            .is_none()
    {
        let known = registry.list(ComponentKind::Datasource);
        let mut detail = format!("Known data source types: {}.", known.join(", "));
        if let Some(suggestion) = did_you_mean(&type_name, known.iter().map(String::as_str)) {
            detail.push_str(&format!(" Did you mean {suggestion:?}?"));
        }
        diags.push(
            Diagnostic::error(format!("Unknown data source type {type_name:?}"))
                .with_detail(detail)
                .with_subject(location.clone()),
        );
        return (None, diags);
    }

    let dependencies = body_data_references(&block.body)
        .into_iter()
        .filter_map(|path| match path.as_slice() {
            [_, type_name, name, ..] => Some(DatasourceRef::new(type_name, name)),
            _ => None,
        })
        .collect();

    (
        Some(DatasourceBlock {
            type_name,
            name,
            block_index,
            range: location.clone(),
            dependencies,
            value: None,
        }),
        diags,
    )
}

/// All `data.*` paths mentioned anywhere in a body, nested blocks included.
pub(crate) fn body_data_references(body: &hcl_edit::structure::Body) -> Vec<Vec<String>> {
    let mut found = vec![];
    for attribute in body.attributes() {
        let expr: hcl::Expression = attribute.value.clone().into();
        found.extend(paths_with_root(&expr, "data"));
    }
    for block in body.blocks() {
        found.extend(body_data_references(&block.body));
    }
    found
}

/// The data source table; insertion enforces (type, name) uniqueness.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Datasources {
    datasources: IndexMap<DatasourceRef, DatasourceBlock>,
}

impl Datasources {
    pub fn insert(&mut self, datasource: DatasourceBlock) -> Result<(), Diagnostic> {
        let ref_ = datasource.ref_();
        match self.datasources.get(&ref_) {
            Some(previous) => Err(Diagnostic::error(format!("Duplicate data block {ref_}"))
                .with_detail(format!("Previously declared at {}.", previous.range))
                .with_subject(datasource.range)),
            None => {
                self.datasources.insert(ref_, datasource);
                Ok(())
            }
        }
    }

    pub fn get(&self, ref_: &DatasourceRef) -> Option<&DatasourceBlock> {
        self.datasources.get(ref_)
    }

    pub fn get_mut(&mut self, ref_: &DatasourceRef) -> Option<&mut DatasourceBlock> {
        self.datasources.get_mut(ref_)
    }

    pub fn refs(&self) -> Vec<DatasourceRef> {
        self.datasources.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DatasourceBlock> {
        self.datasources.values()
    }

    pub fn len(&self) -> usize {
        self.datasources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasources.is_empty()
    }

    /// The `data` namespace value for the evaluation context, built from all
    /// executed lookups: `data.<type>.<name>` holds each output.
    pub fn values(&self) -> hcl::Map<String, Value> {
        let mut by_type: hcl::Map<String, Value> = hcl::Map::new();
        for datasource in self.datasources.values() {
            let Some(value) = &datasource.value else {
                continue;
            };
            let entry = by_type
                .entry(datasource.type_name.clone())
                .or_insert_with(|| Value::Object(hcl::Map::new()));
            if let Value::Object(names) = entry {
                names.insert(datasource.name.clone(), value.clone());
            }
        }
        by_type
    }
}
