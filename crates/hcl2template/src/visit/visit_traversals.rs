use super::Visit;
use hcl::{
    template::{Directive, Element},
    Body, Expression, Operation, Structure, Template, Traversal, TraversalOperator,
};

/// Recursively visit all [hcl::Traversal]s immutably
pub trait VisitTraversals {
    fn visit_traversals(&self, visitor: &mut dyn Visit<Traversal>);
}

impl VisitTraversals for Body {
    fn visit_traversals(&self, visitor: &mut dyn Visit<Traversal>) {
        for structure in self.iter() {
            match structure {
                Structure::Attribute(attr) => attr.expr.visit_traversals(visitor),
                Structure::Block(block) => block.body.visit_traversals(visitor),
            }
        }
    }
}

impl VisitTraversals for Expression {
    fn visit_traversals(&self, visitor: &mut dyn Visit<Traversal>) {
        match self {
            Expression::Variable(variable) => {
                // a standalone variable is a traversal with no operators...kind of
                let traversal = Traversal::new(
                    Expression::Variable(variable.clone()),
                    Vec::<TraversalOperator>::new(),
                );
                visitor.visit(&traversal);
            }
            Expression::Traversal(traversal) => {
                visitor.visit(traversal);
                // a plain variable root is already part of the visited
                // traversal; recursing would report it twice
                if !matches!(traversal.expr, Expression::Variable(_)) {
                    traversal.expr.visit_traversals(visitor);
                }
            }
            Expression::Array(array) => {
                for expr in array {
                    expr.visit_traversals(visitor);
                }
            }
            Expression::Object(object) => {
                for value in object.values() {
                    value.visit_traversals(visitor);
                }
            }
            Expression::TemplateExpr(template_expr) => {
                // templates that do not round-trip are simply skipped
                if let Ok(template) = Template::from_expr(template_expr) {
                    template.visit_traversals(visitor);
                }
            }
            Expression::FuncCall(call) => {
                for arg in &call.args {
                    arg.visit_traversals(visitor);
                }
            }
            Expression::Parenthesis(expr) => {
                expr.visit_traversals(visitor);
            }
            Expression::Conditional(cond) => {
                cond.cond_expr.visit_traversals(visitor);
                cond.true_expr.visit_traversals(visitor);
                cond.false_expr.visit_traversals(visitor);
            }
            Expression::Operation(operation) => match operation.as_ref() {
                Operation::Binary(binop) => {
                    binop.rhs_expr.visit_traversals(visitor);
                    binop.lhs_expr.visit_traversals(visitor);
                }
                Operation::Unary(unop) => {
                    unop.expr.visit_traversals(visitor);
                }
            },
            Expression::ForExpr(forexpr) => {
                forexpr
                    .cond_expr
                    .iter()
                    .for_each(|e| e.visit_traversals(visitor));
                forexpr
                    .key_expr
                    .iter()
                    .for_each(|e| e.visit_traversals(visitor));
                forexpr.value_expr.visit_traversals(visitor);
                forexpr.collection_expr.visit_traversals(visitor);
            }
            _ => {}
        }
    }
}

impl VisitTraversals for Template {
    fn visit_traversals(&self, visitor: &mut dyn Visit<Traversal>) {
        for element in self.elements() {
            match element {
                Element::Interpolation(interpolation) => {
                    interpolation.expr.visit_traversals(visitor);
                }
                Element::Directive(directive) => match directive {
                    Directive::If(ifdir) => {
                        ifdir.cond_expr.visit_traversals(visitor);
                        ifdir.true_template.visit_traversals(visitor);
                        ifdir
                            .false_template
                            .iter()
                            .for_each(|t| t.visit_traversals(visitor));
                    }
                    Directive::For(fordir) => {
                        fordir.template.visit_traversals(visitor);
                        fordir.collection_expr.visit_traversals(visitor);
                    }
                },
                Element::Literal(_) => {}
            }
        }
    }
}
