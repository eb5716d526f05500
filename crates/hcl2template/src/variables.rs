//! Input variables and local values
//!
//! Input variables are declared in `variable "name" {}` / `variables {}`
//! blocks and can be overridden from the environment (`PKR_VAR_*`), variable
//! files and explicit command line values. Every override is recorded as a
//! [VariableAssignment] so the effective value (the last assignment) can
//! always be traced back to where it came from.
//!
//! Local values are only declared here; they are evaluated later, in
//! dependency order, once all input variables are resolved.

use crate::diagnostics::{Diagnostic, Diagnostics, SourceRange};
use crate::schema::{convert_value, SchemaType};
use crate::util::did_you_mean;
use hcl::eval::{Context, Evaluate};
use hcl::Value;
use indexmap::IndexMap;

/// Environment variables with this prefix override the matching input
/// variable.
pub const ENV_VAR_PREFIX: &str = "PKR_VAR_";

/// Where a variable assignment came from, in ascending precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AssignmentSource {
    Default,
    Env,
    VarFile,
    CommandLine,
}

impl std::fmt::Display for AssignmentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssignmentSource::Default => f.write_str("default"),
            AssignmentSource::Env => f.write_str("env"),
            AssignmentSource::VarFile => f.write_str("varfile"),
            AssignmentSource::CommandLine => f.write_str("cmd"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableAssignment {
    pub source: AssignmentSource,
    pub value: Value,
}

/// A `validation {}` block inside a variable declaration. The condition is
/// kept as an unevaluated expression; it runs once the variable's final
/// value is known.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub condition: hcl::Expression,
    pub error_message: hcl::Expression,
    pub range: SourceRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub description: Option<String>,
    pub sensitive: bool,
    pub type_: Option<SchemaType>,
    /// Assignments in ascending precedence order; the last one wins.
    pub values: Vec<VariableAssignment>,
    pub validations: Vec<Validation>,
    pub range: SourceRange,
}

impl Variable {
    fn new(name: impl Into<String>, range: SourceRange) -> Self {
        Self {
            name: name.into(),
            description: None,
            sensitive: false,
            type_: None,
            values: vec![],
            validations: vec![],
            range,
        }
    }

    /// The effective value, i.e. the highest-precedence assignment.
    pub fn value(&self) -> Option<&Value> {
        self.values.last().map(|assignment| &assignment.value)
    }

    /// Runs the declared validation blocks against the final value.
    pub fn validate(&self) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let Some(value) = self.value() else {
            return diags;
        };

        let mut ctx = Context::new();
        let mut scope = hcl::Map::new();
        scope.insert(self.name.clone(), value.clone());
        ctx.declare_var("var", Value::Object(scope));

        for validation in &self.validations {
            match validation.condition.clone().evaluate(&ctx) {
                Ok(Value::Bool(true)) => {}
                Ok(_) => {
                    let message = validation
                        .error_message
                        .clone()
                        .evaluate(&ctx)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_else(|| "The condition evaluated to false.".to_string());
                    diags.push(
                        Diagnostic::error(format!("Invalid value for variable {:?}", self.name))
                            .with_detail(message)
                            .with_subject(validation.range.clone()),
                    );
                }
                Err(errors) => {
                    diags.push(
                        Diagnostic::error(format!(
                            "Failed to evaluate validation condition for variable {:?}",
                            self.name
                        ))
                        .with_detail(errors.to_string())
                        .with_subject(validation.range.clone()),
                    );
                }
            }
        }

        diags
    }
}

/// All declared input variables, keyed by name in declaration order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Variables {
    variables: IndexMap<String, Variable>,
}

impl Variables {
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Map of resolved variable values, for the evaluation context.
    pub fn values(&self) -> hcl::Map<String, Value> {
        self.variables
            .iter()
            .filter_map(|(name, variable)| Some((name.clone(), variable.value()?.clone())))
            .collect()
    }

    /// Declares a variable; redeclaration is a hard error and the first
    /// declaration wins.
    pub fn declare(&mut self, variable: Variable) -> Result<(), Diagnostic> {
        match self.variables.get(&variable.name) {
            Some(previous) => Err(Diagnostic::error(format!(
                "Duplicate variable {:?}",
                variable.name
            ))
            .with_detail(format!("Previously declared at {}.", previous.range))
            .with_subject(variable.range)),
            None => {
                self.variables.insert(variable.name.clone(), variable);
                Ok(())
            }
        }
    }

    /// Applies one override value. For [AssignmentSource::Env] an unknown
    /// name is silently skipped (the environment routinely carries unrelated
    /// entries); for var-files and command line values it is a diagnostic.
    pub fn apply(&mut self, name: &str, raw: &str, source: AssignmentSource) -> Diagnostics {
        let Some(variable) = self.variables.get_mut(name) else {
            if source == AssignmentSource::Env {
                tracing::debug!(name, "ignoring environment value for undeclared variable");
                return Diagnostics::new();
            }

            let mut detail = format!(
                "A {source} value was provided for a variable that was never declared."
            );
            if let Some(suggestion) = did_you_mean(name, self.variables.keys().map(String::as_str))
            {
                detail.push_str(&format!(" Did you mean {suggestion:?}?"));
            }
            return Diagnostic::error(format!("Undefined variable {name:?}"))
                .with_detail(detail)
                .into();
        };

        match interpret_raw_value(raw, variable.type_.as_ref(), &variable.name) {
            Ok(value) => {
                variable.values.push(VariableAssignment { source, value });
                Diagnostics::new()
            }
            Err(diag) => diag.into(),
        }
    }

    /// Applies every attribute of a parsed variable file body. Names that
    /// were never declared are warnings (gated by `warn_on_undeclared`)
    /// rather than errors, since var-files are often shared between
    /// templates.
    pub fn apply_varfile_body(
        &mut self,
        body: &hcl_edit::structure::Body,
        path: &std::path::Path,
        warn_on_undeclared: bool,
    ) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let range = SourceRange::new(path.to_path_buf(), None);

        for block in body.blocks() {
            let detail = match block.ident.as_str() {
                "variable" | "variables" => {
                    "Variable files contain variable assignments (`name = value`), not \
                     variable declarations; declare the variable in a .pkr.hcl file instead."
                        .to_string()
                }
                other => format!(
                    "Found a {other:?} block; variable files may only contain `name = value` \
                     assignments."
                ),
            };
            diags.push(
                Diagnostic::error("Blocks are not allowed in variable files")
                    .with_detail(detail)
                    .with_subject(range.clone()),
            );
        }

        for attribute in body.attributes() {
            let name = attribute.key.to_string();
            let expr: hcl::Expression = attribute.value.clone().into();
            if self.get(&name).is_none() {
                if warn_on_undeclared {
                    let mut detail =
                        "A varfile value was provided for a variable that was never declared."
                            .to_string();
                    if let Some(suggestion) =
                        did_you_mean(&name, self.variables.keys().map(String::as_str))
                    {
                        detail.push_str(&format!(" Did you mean {suggestion:?}?"));
                    }
                    diags.push(
                        Diagnostic::warning(format!("Undefined variable {name:?}"))
                            .with_detail(detail)
                            .with_subject(range.clone()),
                    );
                }
                continue;
            }
            diags.extend(self.apply_expression(&name, &expr, AssignmentSource::VarFile, &range));
        }

        diags
    }

    /// Applies one override from an already-parsed expression.
    pub fn apply_expression(
        &mut self,
        name: &str,
        expr: &hcl::Expression,
        source: AssignmentSource,
        range: &SourceRange,
    ) -> Diagnostics {
        let Some(variable) = self.variables.get_mut(name) else {
            let mut detail = format!(
                "A {source} value was provided for a variable that was never declared."
            );
            if let Some(suggestion) = did_you_mean(name, self.variables.keys().map(String::as_str))
            {
                detail.push_str(&format!(" Did you mean {suggestion:?}?"));
            }
            return Diagnostic::error(format!("Undefined variable {name:?}"))
                .with_detail(detail)
                .with_subject(range.clone())
                .into();
        };

        let value = match expr.clone().evaluate(&Context::new()) {
            Ok(value) => value,
            Err(errors) => {
                return Diagnostic::error(format!("Failed to evaluate value for variable {name:?}"))
                    .with_detail(errors.to_string())
                    .with_subject(range.clone())
                    .into();
            }
        };

        let value = match &variable.type_ {
            Some(type_) => match convert_value(value, type_, name) {
                Ok(value) => value,
                Err(err) => {
                    return Diagnostic::error(format!("Invalid value for variable {name:?}"))
                        .with_detail(err.to_string())
                        .with_subject(range.clone())
                        .into();
                }
            },
            None => value,
        };

        variable.values.push(VariableAssignment { source, value });
        Diagnostics::new()
    }

    /// Variables that ended up with no value at all. Each is an error: the
    /// user must supply a value or declare a default.
    pub fn check_all_set(&self) -> Diagnostics {
        let mut diags = Diagnostics::new();
        for variable in self.variables.values() {
            if variable.value().is_none() {
                diags.push(
                    Diagnostic::error(format!("Unset variable {:?}", variable.name))
                        .with_detail(format!(
                            "A value must be set for this variable: give it a `default`, set the \
                             {ENV_VAR_PREFIX}{} environment variable, add it to a var-file or \
                             pass `-var '{}=...'`.",
                            variable.name, variable.name
                        ))
                        .with_subject(variable.range.clone()),
                );
            }
        }
        diags
    }
}

/// Interprets a raw string override (environment or command line). If the
/// variable declares a non-string type the raw text is parsed as an HCL
/// expression first, so `-var 'ports=[80, 443]'` works; otherwise it is
/// taken literally.
fn interpret_raw_value(
    raw: &str,
    type_: Option<&SchemaType>,
    name: &str,
) -> Result<Value, Diagnostic> {
    let type_ = match type_ {
        None | Some(SchemaType::String) => return Ok(Value::String(raw.to_string())),
        Some(type_) => type_,
    };

    let value = raw
        .parse::<hcl_edit::expr::Expression>()
        .ok()
        .and_then(|expr| hcl::Expression::from(expr).evaluate(&Context::new()).ok())
        .unwrap_or_else(|| Value::String(raw.to_string()));

    convert_value(value, type_, name).map_err(|err| {
        Diagnostic::error(format!("Invalid value for variable {name:?}")).with_detail(err.to_string())
    })
}

/// Filters the PKR_VAR_ entries out of an environment listing.
pub fn env_overrides(
    env: impl IntoIterator<Item = (String, String)>,
) -> Vec<(String, String)> {
    env.into_iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(ENV_VAR_PREFIX)
                .map(|name| (name.to_string(), value))
        })
        .collect()
}

/// Decodes a `variable "name" {}` block.
pub fn decode_variable_block(
    block: &hcl_edit::structure::Block,
    location: &SourceRange,
) -> (Option<Variable>, Diagnostics) {
    let mut diags = Diagnostics::new();

    let Some(name) = block.labels.first().map(|label| label.as_str().to_string()) else {
        diags.push(
            Diagnostic::error("Missing variable name")
                .with_detail("A variable block requires exactly one label: `variable \"name\" {}`.")
                .with_subject(location.clone()),
        );
        return (None, diags);
    };

    let mut variable = Variable::new(name.clone(), location.clone());

    for attribute in block.body.attributes() {
        let expr: hcl::Expression = attribute.value.clone().into();
        match attribute.key.as_str() {
            "type" => match SchemaType::from_type_expr(&expr) {
                Ok(type_) => variable.type_ = Some(type_),
                Err(err) => diags.push(
                    Diagnostic::error(format!("Invalid type for variable {name:?}"))
                        .with_detail(err.to_string())
                        .with_subject(location.clone()),
                ),
            },
            "description" => match expr.evaluate(&Context::new()) {
                Ok(Value::String(text)) => variable.description = Some(text),
                _ => diags.push(
                    Diagnostic::error(format!("Invalid description for variable {name:?}"))
                        .with_detail("The description must be a string literal.")
                        .with_subject(location.clone()),
                ),
            },
            "sensitive" => match expr.evaluate(&Context::new()) {
                Ok(Value::Bool(b)) => variable.sensitive = b,
                _ => diags.push(
                    Diagnostic::error(format!("Invalid sensitive flag for variable {name:?}"))
                        .with_detail("The sensitive attribute must be `true` or `false`.")
                        .with_subject(location.clone()),
                ),
            },
            "default" => match expr.evaluate(&Context::new()) {
                Ok(value) => {
                    let value = match &variable.type_ {
                        Some(type_) => match convert_value(value, type_, &name) {
                            Ok(value) => value,
                            Err(err) => {
                                diags.push(
                                    Diagnostic::error(format!(
                                        "Invalid default for variable {name:?}"
                                    ))
                                    .with_detail(err.to_string())
                                    .with_subject(location.clone()),
                                );
                                continue;
                            }
                        },
                        None => value,
                    };
                    variable.values.push(VariableAssignment {
                        source: AssignmentSource::Default,
                        value,
                    });
                }
                Err(errors) => diags.push(
                    Diagnostic::error(format!("Invalid default for variable {name:?}"))
                        .with_detail(errors.to_string())
                        .with_subject(location.clone()),
                ),
            },
            other => diags.push(
                Diagnostic::error(format!("Unsupported argument {other:?}"))
                    .with_detail(
                        "Valid variable arguments are `type`, `default`, `description` and \
                         `sensitive`.",
                    )
                    .with_subject(location.clone()),
            ),
        }
    }

    // `default` may precede `type` in the source; convert late declarations
    if let Some(type_) = variable.type_.clone() {
        for assignment in &mut variable.values {
            match convert_value(assignment.value.clone(), &type_, &name) {
                Ok(value) => assignment.value = value,
                Err(err) => diags.push(
                    Diagnostic::error(format!("Invalid default for variable {name:?}"))
                        .with_detail(err.to_string())
                        .with_subject(location.clone()),
                ),
            }
        }
    }

    for nested in block.body.blocks() {
        if nested.ident.as_str() != "validation" {
            diags.push(
                Diagnostic::error(format!("Unsupported block {:?}", nested.ident.as_str()))
                    .with_detail("Only `validation` blocks are allowed inside a variable block.")
                    .with_subject(location.clone()),
            );
            continue;
        }

        let (validation, more_diags) = decode_validation_block(nested, location);
        diags.extend(more_diags);
        if let Some(validation) = validation {
            variable.validations.push(validation);
        }
    }

    (Some(variable), diags)
}

fn decode_validation_block(
    block: &hcl_edit::structure::Block,
    location: &SourceRange,
) -> (Option<Validation>, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut condition = None;
    let mut error_message = None;

    for attribute in block.body.attributes() {
        let expr: hcl::Expression = attribute.value.clone().into();
        match attribute.key.as_str() {
            "condition" => condition = Some(expr),
            "error_message" => error_message = Some(expr),
            other => diags.push(
                Diagnostic::error(format!("Unsupported argument {other:?}"))
                    .with_detail(
                        "A validation block takes `condition` and `error_message` arguments.",
                    )
                    .with_subject(location.clone()),
            ),
        }
    }

    // a literal error message must read like a sentence
    if let Some(expr) = &error_message {
        if let Ok(Value::String(text)) = expr.evaluate(&Context::new()) {
            let starts_upper = text.chars().next().is_some_and(|c| c.is_uppercase());
            let ends_punctuated = text.ends_with(['.', '?', '!']);
            if !starts_upper || !ends_punctuated {
                diags.push(
                    Diagnostic::error("Invalid validation error message")
                        .with_detail(
                            "The validation error message must be at least one full sentence \
                             starting with an uppercase letter and ending with a period, \
                             question mark, or exclamation point.",
                        )
                        .with_subject(location.clone()),
                );
            }
        }
    }

    match (condition, error_message) {
        (Some(condition), Some(error_message)) => (
            Some(Validation {
                condition,
                error_message,
                range: location.clone(),
            }),
            diags,
        ),
        (condition, _) => {
            let missing = if condition.is_none() {
                "condition"
            } else {
                "error_message"
            };
            diags.push(
                Diagnostic::error(format!("Missing {missing:?} in validation block"))
                    .with_detail(
                        "A validation block requires both `condition` and `error_message`.",
                    )
                    .with_subject(location.clone()),
            );
            (None, diags)
        }
    }
}

/// Decodes a `variables {}` block, where every attribute declares one
/// variable with its default value.
pub fn decode_variables_block(
    block: &hcl_edit::structure::Block,
    location: &SourceRange,
) -> (Vec<Variable>, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut variables = vec![];

    for attribute in block.body.attributes() {
        let name = attribute.key.to_string();
        let expr: hcl::Expression = attribute.value.clone().into();
        match expr.evaluate(&Context::new()) {
            Ok(value) => {
                let mut variable = Variable::new(name, location.clone());
                variable.values.push(VariableAssignment {
                    source: AssignmentSource::Default,
                    value,
                });
                variables.push(variable);
            }
            Err(errors) => diags.push(
                Diagnostic::error(format!("Invalid default for variable {name:?}"))
                    .with_detail(errors.to_string())
                    .with_subject(location.clone()),
            ),
        }
    }

    for nested in block.body.blocks() {
        diags.push(
            Diagnostic::error(format!("Unsupported block {:?}", nested.ident.as_str()))
                .with_detail("A variables block may only contain `name = value` assignments.")
                .with_subject(location.clone()),
        );
    }

    (variables, diags)
}

/// A single local value declaration, not yet evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalBlock {
    pub name: String,
    pub expr: hcl::Expression,
    pub sensitive: bool,
    pub range: SourceRange,
}

/// Decodes a `locals {}` block (every attribute is one local) or a
/// `local "name" {}` block (single local, allows `sensitive`).
pub fn decode_local_block(
    block: &hcl_edit::structure::Block,
    location: &SourceRange,
) -> (Vec<LocalBlock>, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut locals = vec![];

    match block.ident.as_str() {
        "locals" => {
            for attribute in block.body.attributes() {
                locals.push(LocalBlock {
                    name: attribute.key.to_string(),
                    expr: attribute.value.clone().into(),
                    sensitive: false,
                    range: location.clone(),
                });
            }
            for nested in block.body.blocks() {
                diags.push(
                    Diagnostic::error(format!("Unsupported block {:?}", nested.ident.as_str()))
                        .with_detail(
                            "A locals block may only contain `name = expression` assignments.",
                        )
                        .with_subject(location.clone()),
                );
            }
        }
        "local" => {
            let Some(name) = block.labels.first().map(|label| label.as_str().to_string())
            else {
                diags.push(
                    Diagnostic::error("Missing local name")
                        .with_detail(
                            "A local block requires exactly one label: `local \"name\" {}`.",
                        )
                        .with_subject(location.clone()),
                );
                return (locals, diags);
            };

            let mut expr = None;
            let mut sensitive = false;
            for attribute in block.body.attributes() {
                match attribute.key.as_str() {
                    "expression" => expr = Some(attribute.value.clone().into()),
                    "sensitive" => {
                        let value: hcl::Expression = attribute.value.clone().into();
                        match value.evaluate(&Context::new()) {
                            Ok(Value::Bool(b)) => sensitive = b,
                            _ => diags.push(
                                Diagnostic::error(format!(
                                    "Invalid sensitive flag for local {name:?}"
                                ))
                                .with_detail("The sensitive attribute must be `true` or `false`.")
                                .with_subject(location.clone()),
                            ),
                        }
                    }
                    other => diags.push(
                        Diagnostic::error(format!("Unsupported argument {other:?}"))
                            .with_detail(
                                "A local block takes `expression` and `sensitive` arguments.",
                            )
                            .with_subject(location.clone()),
                    ),
                }
            }

            match expr {
                Some(expr) => locals.push(LocalBlock {
                    name,
                    expr,
                    sensitive,
                    range: location.clone(),
                }),
                None => diags.push(
                    Diagnostic::error(format!("Missing expression for local {name:?}"))
                        .with_detail("A local block requires an `expression` argument.")
                        .with_subject(location.clone()),
                ),
            }
        }
        other => {
            diags.push(
                Diagnostic::error(format!("Not a local block: {other:?}"))
                    .with_subject(location.clone()),
            );
        }
    }

    (locals, diags)
}
