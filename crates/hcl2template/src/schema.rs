//! Schema-driven configuration decoding
//!
//! Plugins run out of process, so their configuration layout has to cross the
//! boundary as data rather than as shared compiled types. A component
//! describes its own configuration with a [ConfigSpec]; the generic
//! [decode_decodable] bridge evaluates an untyped block body against that
//! spec and produces a [DecodedConfig]. The parser itself never hard-codes a
//! plugin's field layout.

use crate::diagnostics::{Diagnostic, Diagnostics, SourceRange};
use hcl::eval::{Context, Evaluate};
use hcl::Value;
use indexmap::IndexMap;

/// The semantic type of a configuration attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaType {
    String,
    Number,
    Bool,
    List(Box<SchemaType>),
    Map(Box<SchemaType>),
    Object(IndexMap<String, SchemaType>),
    /// Accepts any value unchanged.
    Any,
}

impl SchemaType {
    pub fn list(element: SchemaType) -> Self {
        SchemaType::List(Box::new(element))
    }

    pub fn map(element: SchemaType) -> Self {
        SchemaType::Map(Box::new(element))
    }

    /// Interprets a type constraint expression such as `string`, `list(number)`
    /// or `object({ name = string })`.
    pub fn from_type_expr(expr: &hcl::Expression) -> Result<Self, TypeExprError> {
        match expr {
            hcl::Expression::Variable(var) => match var.as_str() {
                "string" => Ok(SchemaType::String),
                "number" => Ok(SchemaType::Number),
                "bool" => Ok(SchemaType::Bool),
                "any" => Ok(SchemaType::Any),
                other => Err(TypeExprError::UnknownType(other.to_string())),
            },
            hcl::Expression::FuncCall(call) => {
                let args = &call.args;
                match (call.name.as_str(), args.as_slice()) {
                    ("list", [element]) | ("set", [element]) => {
                        Ok(SchemaType::list(Self::from_type_expr(element)?))
                    }
                    ("map", [element]) => Ok(SchemaType::map(Self::from_type_expr(element)?)),
                    ("object", [hcl::Expression::Object(fields)]) => {
                        let mut object = IndexMap::new();
                        for (key, value) in fields {
                            object.insert(key.to_string(), Self::from_type_expr(value)?);
                        }
                        Ok(SchemaType::Object(object))
                    }
                    (name, _) => Err(TypeExprError::UnknownType(name.to_string())),
                }
            }
            other => Err(TypeExprError::NotAType(format!("{other:?}"))),
        }
    }

    fn describe(&self) -> String {
        match self {
            SchemaType::String => "string".to_string(),
            SchemaType::Number => "number".to_string(),
            SchemaType::Bool => "bool".to_string(),
            SchemaType::List(e) => format!("list({})", e.describe()),
            SchemaType::Map(e) => format!("map({})", e.describe()),
            SchemaType::Object(_) => "object".to_string(),
            SchemaType::Any => "any".to_string(),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TypeExprError {
    #[error("unknown type {0:?}")]
    UnknownType(String),
    #[error("expression is not a type constraint: {0}")]
    NotAType(String),
}

/// One attribute in a [ConfigSpec].
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeSpec {
    pub type_: SchemaType,
    pub required: bool,
}

/// A component's self-description of its configuration shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSpec {
    pub attributes: IndexMap<String, AttributeSpec>,
}

impl ConfigSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, type_: SchemaType) -> Self {
        self.attributes.insert(
            name.into(),
            AttributeSpec {
                type_,
                required: true,
            },
        );
        self
    }

    pub fn optional(mut self, name: impl Into<String>, type_: SchemaType) -> Self {
        self.attributes.insert(
            name.into(),
            AttributeSpec {
                type_,
                required: false,
            },
        );
        self
    }
}

/// Anything that can describe its own decode spec.
///
/// This is the seam between the generic parser and every plugin's bespoke
/// configuration struct.
pub trait Decodable {
    fn config_spec(&self) -> ConfigSpec;
}

/// A validated, typed configuration value produced from a block body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedConfig {
    pub values: IndexMap<String, Value>,
}

impl DecodedConfig {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

/// Decodes a block body against the spec self-declared by `decodable`.
///
/// All failure modes are recoverable: errors are collected per attribute so
/// multiple blocks can be decoded and their problems aggregated before
/// surfacing to the user.
pub fn decode_decodable(
    body: &hcl_edit::structure::Body,
    ectx: &Context<'_>,
    decodable: &dyn Decodable,
    location: &SourceRange,
) -> (DecodedConfig, Diagnostics) {
    decode_spec(body, ectx, &decodable.config_spec(), location)
}

/// Decodes a block body against an explicit [ConfigSpec].
pub fn decode_spec(
    body: &hcl_edit::structure::Body,
    ectx: &Context<'_>,
    spec: &ConfigSpec,
    location: &SourceRange,
) -> (DecodedConfig, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut decoded = DecodedConfig::default();

    for attribute in body.attributes() {
        let name = attribute.key.to_string();

        let Some(attr_spec) = spec.attributes.get(&name) else {
            diags.push(
                Diagnostic::error(format!("Unsupported argument {name:?}"))
                    .with_detail("An argument with this name is not expected here.")
                    .with_subject(location.clone()),
            );
            continue;
        };

        let expr: hcl::Expression = attribute.value.clone().into();
        let value = match expr.evaluate(ectx) {
            Ok(value) => value,
            Err(errors) => {
                diags.push(
                    Diagnostic::error(format!("Failed to evaluate argument {name:?}"))
                        .with_detail(errors.to_string())
                        .with_subject(location.clone()),
                );
                continue;
            }
        };

        match convert_value(value, &attr_spec.type_, &name) {
            Ok(converted) => {
                decoded.values.insert(name, converted);
            }
            Err(err) => {
                diags.push(
                    Diagnostic::error(format!("Invalid value for argument {name:?}"))
                        .with_detail(err.to_string())
                        .with_subject(location.clone()),
                );
            }
        }
    }

    // Nested blocks become lists of objects under the block identifier, so a
    // component can declare repeatable sub-configuration.
    for block in body.blocks() {
        let name = block.ident.to_string();

        let element_type = match spec.attributes.get(&name).map(|spec| &spec.type_) {
            Some(SchemaType::List(element)) => element.as_ref().clone(),
            Some(SchemaType::Any) => SchemaType::Any,
            Some(other) => {
                diags.push(
                    Diagnostic::error(format!("Unexpected block {name:?}"))
                        .with_detail(format!(
                            "{name:?} is declared as {}, not as a repeatable block.",
                            other.describe()
                        ))
                        .with_subject(location.clone()),
                );
                continue;
            }
            None => {
                diags.push(
                    Diagnostic::error(format!("Unsupported block {name:?}"))
                        .with_detail("A block with this name is not expected here.")
                        .with_subject(location.clone()),
                );
                continue;
            }
        };

        let element_spec = match &element_type {
            SchemaType::Object(fields) => ConfigSpec {
                attributes: fields
                    .iter()
                    .map(|(field, type_)| {
                        (
                            field.clone(),
                            AttributeSpec {
                                type_: type_.clone(),
                                required: false,
                            },
                        )
                    })
                    .collect(),
            },
            _ => ConfigSpec::default(),
        };

        let (element, more_diags) = if element_spec.attributes.is_empty() {
            decode_freeform(&block.body, ectx, location)
        } else {
            decode_spec(&block.body, ectx, &element_spec, location)
        };
        diags.extend(more_diags);

        let object = Value::Object(element.values.into_iter().collect());
        match decoded
            .values
            .entry(name)
            .or_insert_with(|| Value::Array(vec![]))
        {
            Value::Array(list) => list.push(object),
            _ => unreachable!("nested blocks always accumulate into an array"),
        }
    }

    for (name, attr_spec) in &spec.attributes {
        if attr_spec.required && !decoded.values.contains_key(name) {
            diags.push(
                Diagnostic::error(format!("Missing required argument {name:?}"))
                    .with_detail(format!(
                        "The argument {name:?} ({}) is required.",
                        attr_spec.type_.describe()
                    ))
                    .with_subject(location.clone()),
            );
        }
    }

    (decoded, diags)
}

// decode a body with no schema: every attribute is accepted as-is
fn decode_freeform(
    body: &hcl_edit::structure::Body,
    ectx: &Context<'_>,
    location: &SourceRange,
) -> (DecodedConfig, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut decoded = DecodedConfig::default();

    for attribute in body.attributes() {
        let name = attribute.key.to_string();
        let expr: hcl::Expression = attribute.value.clone().into();
        match expr.evaluate(ectx) {
            Ok(value) => {
                decoded.values.insert(name, value);
            }
            Err(errors) => {
                diags.push(
                    Diagnostic::error(format!("Failed to evaluate argument {name:?}"))
                        .with_detail(errors.to_string())
                        .with_subject(location.clone()),
                );
            }
        }
    }

    (decoded, diags)
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("{path}: cannot convert value to {wanted}")]
pub struct ConvertError {
    pub path: String,
    pub wanted: String,
}

/// Converts an evaluated value to the wanted [SchemaType], applying the
/// usual lenient HCL conversions (number to string, string to number or
/// bool). The error carries the path of the offending field.
pub fn convert_value(value: Value, wanted: &SchemaType, path: &str) -> Result<Value, ConvertError> {
    let mismatch = |wanted: &SchemaType| ConvertError {
        path: path.to_string(),
        wanted: wanted.describe(),
    };

    match wanted {
        SchemaType::Any => Ok(value),
        SchemaType::String => match value {
            Value::String(_) => Ok(value),
            Value::Number(num) => Ok(Value::String(num.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(mismatch(wanted)),
        },
        SchemaType::Number => match value {
            Value::Number(_) => Ok(value),
            Value::String(s) => s
                .parse::<f64>()
                .ok()
                .and_then(hcl::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| mismatch(wanted)),
            _ => Err(mismatch(wanted)),
        },
        SchemaType::Bool => match value {
            Value::Bool(_) => Ok(value),
            Value::String(s) => match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch(wanted)),
            },
            _ => Err(mismatch(wanted)),
        },
        SchemaType::List(element) => match value {
            Value::Array(items) => {
                let mut converted = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    converted.push(convert_value(item, element, &format!("{path}[{i}]"))?);
                }
                Ok(Value::Array(converted))
            }
            _ => Err(mismatch(wanted)),
        },
        SchemaType::Map(element) => match value {
            Value::Object(entries) => {
                let mut converted = hcl::Map::new();
                for (key, item) in entries {
                    let item = convert_value(item, element, &format!("{path}.{key}"))?;
                    converted.insert(key, item);
                }
                Ok(Value::Object(converted))
            }
            _ => Err(mismatch(wanted)),
        },
        SchemaType::Object(fields) => match value {
            Value::Object(mut entries) => {
                let mut converted = hcl::Map::new();
                for (key, field_type) in fields {
                    if let Some(item) = entries.swap_remove(key) {
                        let item = convert_value(item, field_type, &format!("{path}.{key}"))?;
                        converted.insert(key.clone(), item);
                    }
                }
                if let Some(extra) = entries.keys().next() {
                    return Err(ConvertError {
                        path: format!("{path}.{extra}"),
                        wanted: "a declared object attribute".to_string(),
                    });
                }
                Ok(Value::Object(converted))
            }
            _ => Err(mismatch(wanted)),
        },
    }
}
