//! Template file loading and indexing
//!
//! [TemplateFiles] tracks
//! - the source path of every loaded document
//! - the root blocks
//! - the root attributes
//! and defines a numeric index for each. Once added those indices are stable
//! (removal is not possible), so every later phase can point back at the
//! block it is complaining about.
//!
//! Template files end in `.pkr.hcl` or `.pkr.json`; auto-loaded variable
//! override files end in `.auto.pkrvars.hcl` or `.auto.pkrvars.json`.
//! Directory listings are sorted by file name so repeated identical
//! invocations see the same order.

use crate::diagnostics::SourceRange;
use hcl_edit::structure::{Attribute, Block, Body, Structure};
use hcl_edit::Span;
use std::path::{Path, PathBuf};

pub const TEMPLATE_EXT: &str = ".pkr.hcl";
pub const TEMPLATE_JSON_EXT: &str = ".pkr.json";
pub const AUTO_VAR_EXT: &str = ".auto.pkrvars.hcl";
pub const AUTO_VAR_JSON_EXT: &str = ".auto.pkrvars.json";

pub type Source = Option<PathBuf>;
pub type SourceAttribute<'a> = (usize, &'a Source, &'a Attribute);
pub type SourceBlock<'a> = (usize, &'a Source, &'a Block);

#[derive(Default, Debug)]
pub struct TemplateFiles {
    sources: Vec<Source>,
    root_attributes: Vec<(usize, Attribute)>,
    root_blocks: Vec<(usize, Block)>,
}

impl TemplateFiles {
    /// Inserts and indexes a parsed document
    pub fn insert(&mut self, document: Body, path: impl Into<Source>) {
        let source_index = self.sources.len();
        self.sources.push(path.into());

        for structure in document.into_iter() {
            match structure {
                Structure::Block(block) => self.root_blocks.push((source_index, block)),
                Structure::Attribute(attribute) => {
                    self.root_attributes.push((source_index, attribute))
                }
            }
        }
    }

    pub fn attributes(&self) -> impl Iterator<Item = SourceAttribute<'_>> {
        self.root_attributes
            .iter()
            .enumerate()
            .map(|(index, (source_index, attribute))| {
                (index, &self.sources[*source_index], attribute)
            })
    }

    pub fn get_block(&self, index: usize) -> SourceBlock<'_> {
        let (source_index, block) = &self.root_blocks[index];
        (index, &self.sources[*source_index], block)
    }

    pub fn blocks(&self) -> impl Iterator<Item = SourceBlock<'_>> {
        self.root_blocks
            .iter()
            .enumerate()
            .map(|(index, (source_index, block))| (index, &self.sources[*source_index], block))
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Source location of an indexed root block, for diagnostics.
    pub fn location(&self, index: usize) -> SourceRange {
        let (source_index, block) = &self.root_blocks[index];
        SourceRange::new(self.sources[*source_index].clone(), block.span())
    }
}

impl TemplateFiles {
    pub fn load_file(&mut self, file_path: &Path) -> Result<(), LoadError> {
        let file_path = file_path.canonicalize()?;
        tracing::info!(path=%file_path.display(), "loading template file");

        let file_contents = std::fs::read_to_string(&file_path)?;
        let body = if is_json_path(&file_path) {
            parse_json_template(&file_contents)?
        } else {
            hcl_edit::parser::parse_body(&file_contents)?
        };

        self.insert(body, Some(file_path));
        Ok(())
    }

    /// Loads every template file in `dir_path`, in file name order. A file
    /// that fails to load does not stop the others; its error is returned so
    /// the caller can report all of them at once.
    pub fn load_directory(
        &mut self,
        dir_path: &Path,
    ) -> Result<Vec<(PathBuf, LoadError)>, LoadError> {
        let files = matching_files(dir_path, &[TEMPLATE_EXT, TEMPLATE_JSON_EXT])?;
        if files.is_empty() {
            return Err(LoadError::NoFilesFound {
                directory: dir_path.to_path_buf(),
            });
        }

        let mut failed = vec![];
        for file_path in files {
            if let Err(err) = self.load_file(&file_path) {
                failed.push((file_path, err));
            }
        }

        Ok(failed)
    }
}

pub fn is_json_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// Finds the auto-loaded variable files next to the template files.
///
/// Returns HCL files first, then JSON files, each group in file name order,
/// matching the override precedence: later files win.
pub fn auto_var_files(dir_path: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let mut files = matching_files(dir_path, &[AUTO_VAR_EXT])?;
    files.extend(matching_files(dir_path, &[AUTO_VAR_JSON_EXT])?);
    Ok(files)
}

fn matching_files(dir_path: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>, LoadError> {
    let mut found = vec![];

    let read_dir = std::fs::read_dir(dir_path)?;
    for dir_entry in read_dir {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_file() {
            continue;
        }

        let name = dir_entry.file_name().to_string_lossy().into_owned();
        if extensions.iter().any(|ext| name.ends_with(ext)) {
            found.push(dir_entry.path());
        }
    }

    // read_dir order is platform dependent; sort for a stable phase order.
    found.sort();
    Ok(found)
}

/// Decodes a JSON template document into the same body representation as a
/// native one. Block types are recognized by name; everything else becomes an
/// attribute, so expressions written as `"${...}"` strings keep working.
pub fn parse_json_template(contents: &str) -> Result<Body, LoadError> {
    parse_json(contents, None)
}

/// Decodes a JSON variable file: plain `name: value` entries, no blocks.
pub fn parse_json_varfile(contents: &str) -> Result<Body, LoadError> {
    parse_json(contents, Some("varfile"))
}

fn parse_json(contents: &str, parent: Option<&str>) -> Result<Body, LoadError> {
    let root: serde_json::Value = serde_json::from_str(contents)?;
    let serde_json::Value::Object(object) = root else {
        return Err(LoadError::JsonTemplate {
            detail: "the top level must be a JSON object".to_string(),
        });
    };

    let body = json_object_to_body(&object, parent)?;

    // round-trip through the canonical renderer so JSON documents flow into
    // the same span-carrying representation as native ones
    let rendered = hcl::format::to_string(&body).map_err(|err| LoadError::JsonTemplate {
        detail: err.to_string(),
    })?;
    Ok(hcl_edit::parser::parse_body(&rendered)?)
}

/// Label counts for the block types a JSON document may contain, keyed by the
/// surrounding block type. Anything unlisted decodes as an attribute.
fn block_label_count(parent: Option<&str>, ident: &str) -> Option<usize> {
    match (parent, ident) {
        (None, "packer" | "variables" | "locals" | "build") => Some(0),
        (None, "variable" | "local") => Some(1),
        (None, "source" | "data" | "communicator") => Some(2),
        (Some("packer"), "required_plugins") => Some(0),
        (Some("variable"), "validation") => Some(0),
        (Some("build"), "source" | "provisioner" | "post-processor") => Some(1),
        (Some("build"), "error-cleanup-provisioner") => Some(1),
        (Some("build"), "post-processors") => Some(0),
        (Some("post-processors"), "post-processor") => Some(1),
        _ => None,
    }
}

fn json_object_to_body(
    object: &serde_json::Map<String, serde_json::Value>,
    parent: Option<&str>,
) -> Result<hcl::Body, LoadError> {
    let mut builder = hcl::Body::builder();
    for (key, value) in object {
        match block_label_count(parent, key) {
            Some(depth) => {
                for block in json_blocks(key, depth, vec![], value)? {
                    builder = builder.add_block(block);
                }
            }
            None => {
                let ident = json_identifier(key)?;
                builder =
                    builder.add_attribute(hcl::Attribute::new(ident, json_expression(value)?));
            }
        }
    }
    Ok(builder.build())
}

/// Expands one JSON entry into blocks: `depth` object levels become labels,
/// then an object (or an array of objects, for repeated blocks) becomes the
/// block body.
fn json_blocks(
    ident: &str,
    depth: usize,
    labels: Vec<String>,
    value: &serde_json::Value,
) -> Result<Vec<hcl::Block>, LoadError> {
    if depth > 0 {
        let serde_json::Value::Object(object) = value else {
            return Err(LoadError::JsonTemplate {
                detail: format!("{ident:?} entries must be JSON objects keyed by block label"),
            });
        };

        let mut blocks = vec![];
        for (label, value) in object {
            let mut labels = labels.clone();
            labels.push(label.clone());
            blocks.extend(json_blocks(ident, depth - 1, labels, value)?);
        }
        return Ok(blocks);
    }

    let bodies: Vec<&serde_json::Map<String, serde_json::Value>> = match value {
        serde_json::Value::Object(object) => vec![object],
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::Object(object) => Ok(object),
                _ => Err(LoadError::JsonTemplate {
                    detail: format!("every {ident:?} entry must be a JSON object"),
                }),
            })
            .collect::<Result<_, _>>()?,
        _ => {
            return Err(LoadError::JsonTemplate {
                detail: format!("{ident:?} must be a JSON object"),
            })
        }
    };

    let block_ident = json_identifier(ident)?;
    let mut blocks = vec![];
    for object in bodies {
        let body = json_object_to_body(object, Some(ident))?;
        let mut builder = hcl::Block::builder(block_ident.clone());
        builder = builder.add_labels(labels.iter().cloned());
        builder = builder.add_structures(body.into_iter());
        blocks.push(builder.build());
    }
    Ok(blocks)
}

fn json_identifier(name: &str) -> Result<hcl::Identifier, LoadError> {
    hcl::Identifier::new(name).map_err(|err| LoadError::JsonTemplate {
        detail: format!("invalid name {name:?}: {err}"),
    })
}

fn json_expression(value: &serde_json::Value) -> Result<hcl::Expression, LoadError> {
    Ok(match value {
        serde_json::Value::Null => hcl::Expression::Null,
        serde_json::Value::Bool(b) => hcl::Expression::Bool(*b),
        serde_json::Value::Number(num) => {
            let num = if let Some(n) = num.as_i64() {
                hcl::Number::from(n)
            } else if let Some(n) = num.as_u64() {
                hcl::Number::from(n)
            } else {
                num.as_f64()
                    .and_then(hcl::Number::from_f64)
                    .ok_or_else(|| LoadError::JsonTemplate {
                        detail: format!("unrepresentable number {num}"),
                    })?
            };
            hcl::Expression::Number(num)
        }
        serde_json::Value::String(s) => hcl::Expression::String(s.clone()),
        serde_json::Value::Array(items) => hcl::Expression::Array(
            items
                .iter()
                .map(json_expression)
                .collect::<Result<_, _>>()?,
        ),
        serde_json::Value::Object(object) => {
            let mut map: hcl::Object<hcl::ObjectKey, hcl::Expression> = Default::default();
            for (key, value) in object {
                let key = hcl::ObjectKey::Expression(hcl::Expression::String(key.clone()));
                map.insert(key, json_expression(value)?);
            }
            hcl::Expression::Object(map)
        }
    })
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("No config file found in {directory}. A config file must be suffixed with `.pkr.hcl` or `.pkr.json`.")]
    NoFilesFound { directory: PathBuf },
    #[error("IO error")]
    IoError(#[from] std::io::Error),
    #[error("Unable to parse hcl file")]
    HclParseFailed(#[from] hcl_edit::parser::Error),
    #[error("Unable to parse json file")]
    JsonParseFailed(#[from] serde_json::Error),
    #[error("Invalid json template: {detail}")]
    JsonTemplate { detail: String },
}

impl From<Body> for TemplateFiles {
    fn from(value: Body) -> Self {
        let mut files = TemplateFiles::default();
        files.insert(value, None);
        files
    }
}

/// Utility macro to create [TemplateFiles]
///
/// Create from a single document
/// ```
/// # use hcl2template::template_files;
/// template_files!("variable \"a\" {}");
/// ```
///
/// Create from multiple documents (path required)
/// ```
/// # use hcl2template::template_files;
/// template_files! {
///   "one.pkr.hcl" => "variable \"a\" {}",
///   "two.pkr.hcl" => "variable \"b\" {}"
/// };
/// ```
///
/// # Panic
/// Panics on invalid input
#[macro_export]
macro_rules! template_files {
    // single document without source
    { $expr:expr } => {
        $crate::documents::TemplateFiles::from(hcl_edit::parser::parse_body($expr).expect("body must parse"))
    };
    // multi document with sources
    { $($source:expr => $expr:expr),+ } => {{
        let mut docs = $crate::documents::TemplateFiles::default();
        $(
            docs.insert(hcl_edit::parser::parse_body($expr).expect("body must parse"), Some($source.into()));
        )+

        docs
    }};
}
