//! Parsing traversal expressions into typed references
//!
//! Turns an absolute attribute traversal such as `var.foo`, `local.bar` or
//! `data.amazon-ami.x.id` into a [Reference]. Only the `var`, `local` and
//! `data` roots are handled; anything else is reported as an unhandled
//! reference type. Trailing traversal steps that are not part of the address
//! itself are returned in [Reference::remaining] so the caller can apply them
//! against the resolved value.

use crate::diagnostics::{Diagnostic, SourceRange};
use hcl::{Expression, Traversal, TraversalOperator};

/// An input variable reference, `var.<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputVariable {
    pub name: String,
}

/// A local value reference, `local.<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalValue {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceMode {
    /// A data source lookup, `data.<type>.<name>`.
    Data,
    /// A build-producing block.
    Build,
}

/// Identifies a data source or build-producing block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    pub mode: ResourceMode,
    pub type_name: String,
    pub name: String,
}

impl Resource {
    pub fn equal(&self, other: &Resource) -> bool {
        self == other
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mode {
            ResourceMode::Data => write!(f, "data.{}.{}", self.type_name, self.name),
            ResourceMode::Build => write!(f, "{}.{}", self.type_name, self.name),
        }
    }
}

/// An optional index into a multi-instance resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstanceKey {
    /// The whole resource.
    NoKey,
    Number(u64),
    String(String),
}

/// A [Resource] narrowed down to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceInstance {
    pub resource: Resource,
    pub key: InstanceKey,
}

/// Anything a traversal can resolve to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Referenceable {
    InputVariable(InputVariable),
    LocalValue(LocalValue),
    Resource(Resource),
    ResourceInstance(ResourceInstance),
}

/// Result of parsing a traversal expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub subject: Referenceable,
    pub source_range: SourceRange,
    /// Unconsumed trailing traversal steps, e.g. the `.id` of
    /// `data.amazon-ami.x.id`.
    pub remaining: Vec<TraversalOperator>,
}

/// Parse an absolute traversal into a typed [Reference].
pub fn parse_ref(traversal: &Traversal, range: SourceRange) -> Result<Reference, Diagnostic> {
    let Expression::Variable(root) = &traversal.expr else {
        return Err(Diagnostic::error("Invalid reference")
            .with_detail("A reference must start with a bare identifier.")
            .with_subject(range));
    };

    match root.as_str() {
        "var" => parse_single_attr_ref(traversal, range, |name| {
            Referenceable::InputVariable(InputVariable { name })
        }),
        "local" => parse_single_attr_ref(traversal, range, |name| {
            Referenceable::LocalValue(LocalValue { name })
        }),
        "data" => parse_resource_ref(traversal, range),
        other => Err(Diagnostic::error("Unhandled reference type")
            .with_detail(format!(
                "A reference to {other:?} is not valid here. Only `var`, `local` and `data` references are supported."
            ))
            .with_subject(range)),
    }
}

fn parse_single_attr_ref(
    traversal: &Traversal,
    range: SourceRange,
    build: impl FnOnce(String) -> Referenceable,
) -> Result<Reference, Diagnostic> {
    let root = root_name(traversal);
    let Some(TraversalOperator::GetAttr(name)) = traversal.operators.first() else {
        return Err(Diagnostic::error("Invalid reference")
            .with_detail(format!(
                "The {root:?} object cannot be accessed directly. Instead, access one of its attributes."
            ))
            .with_subject(range));
    };

    Ok(Reference {
        subject: build(name.to_string()),
        source_range: range,
        remaining: traversal.operators[1..].to_vec(),
    })
}

fn parse_resource_ref(traversal: &Traversal, range: SourceRange) -> Result<Reference, Diagnostic> {
    let mut operators = traversal.operators.iter();

    let (Some(TraversalOperator::GetAttr(type_name)), Some(TraversalOperator::GetAttr(name))) =
        (operators.next(), operators.next())
    else {
        return Err(Diagnostic::error("Invalid reference")
            .with_detail(
                "A data source reference requires a type and a name: `data.<type>.<name>`.",
            )
            .with_subject(range));
    };

    let resource = Resource {
        mode: ResourceMode::Data,
        type_name: type_name.to_string(),
        name: name.to_string(),
    };

    let mut consumed = 2;
    let subject = match traversal.operators.get(consumed) {
        Some(TraversalOperator::Index(index_expr)) => {
            consumed += 1;
            let key = parse_instance_key(index_expr).ok_or_else(|| {
                Diagnostic::error("Invalid index value")
                    .with_detail(
                        "A resource instance index must be a non-negative whole number or a string.",
                    )
                    .with_subject(range.clone())
            })?;
            Referenceable::ResourceInstance(ResourceInstance { resource, key })
        }
        Some(TraversalOperator::LegacyIndex(index)) => {
            consumed += 1;
            Referenceable::ResourceInstance(ResourceInstance {
                resource,
                key: InstanceKey::Number(*index),
            })
        }
        _ => Referenceable::Resource(resource),
    };

    Ok(Reference {
        subject,
        source_range: range,
        remaining: traversal.operators[consumed..].to_vec(),
    })
}

fn parse_instance_key(expr: &Expression) -> Option<InstanceKey> {
    match expr {
        Expression::Number(num) => num.as_u64().map(InstanceKey::Number),
        Expression::String(s) => Some(InstanceKey::String(s.clone())),
        _ => None,
    }
}

fn root_name(traversal: &Traversal) -> &str {
    match &traversal.expr {
        Expression::Variable(var) => var.as_str(),
        _ => "",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn traversal(source: &str) -> Traversal {
        let expr: hcl_edit::expr::Expression = source.parse().expect("expression must parse");
        match hcl::Expression::from(expr) {
            Expression::Traversal(t) => *t,
            Expression::Variable(v) => Traversal::new(
                Expression::Variable(v),
                Vec::<hcl::TraversalOperator>::new(),
            ),
            other => panic!("not a traversal: {other:?}"),
        }
    }

    fn parse(source: &str) -> Result<Reference, Diagnostic> {
        parse_ref(&traversal(source), SourceRange::default())
    }

    #[test]
    fn variable_and_local_refs() {
        let reference = parse("var.foo").unwrap();
        assert_eq!(
            reference.subject,
            Referenceable::InputVariable(InputVariable { name: "foo".into() })
        );
        assert!(reference.remaining.is_empty());

        let reference = parse("local.bar.baz").unwrap();
        assert_eq!(
            reference.subject,
            Referenceable::LocalValue(LocalValue { name: "bar".into() })
        );
        assert_eq!(reference.remaining.len(), 1);
    }

    #[test]
    fn bare_root_is_an_error() {
        let err = parse("var").unwrap_err();
        assert!(err.detail.unwrap().contains("cannot be accessed directly"));
    }

    #[test]
    fn data_source_refs() {
        let reference = parse("data.amazon-ami.x.id").unwrap();
        assert_eq!(
            reference.subject,
            Referenceable::Resource(Resource {
                mode: ResourceMode::Data,
                type_name: "amazon-ami".into(),
                name: "x".into(),
            })
        );
        // the `.id` tail is left for the caller
        assert_eq!(
            reference.remaining,
            vec![TraversalOperator::GetAttr("id".into())]
        );
    }

    #[test]
    fn data_source_instance_index() {
        let reference = parse("data.amazon-ami.x[0].id").unwrap();
        match reference.subject {
            Referenceable::ResourceInstance(instance) => {
                assert_eq!(instance.key, InstanceKey::Number(0));
                assert_eq!(instance.resource.name, "x");
            }
            other => panic!("expected instance, got {other:?}"),
        }
        assert_eq!(reference.remaining.len(), 1);
    }

    #[test]
    fn data_source_too_short() {
        let err = parse("data.amazon-ami").unwrap_err();
        assert!(err.detail.unwrap().contains("type and a name"));
    }

    #[test]
    fn unhandled_root() {
        let err = parse("count.index").unwrap_err();
        assert_eq!(err.summary, "Unhandled reference type");
    }

    #[test]
    fn invalid_index_literal_is_a_diagnostic() {
        let err = parse("data.amazon-ami.x[true]").unwrap_err();
        assert_eq!(err.summary, "Invalid index value");
    }
}
