//! visitor pattern helpers
mod visit_traversals;
pub use visit_traversals::VisitTraversals;

use hcl::{Expression, Traversal, TraversalOperator};

/// Visitor that inspects its subjects immutably
pub trait Visit<T> {
    fn visit(&mut self, value: &T);
}

// blanket impl for FnMut
impl<T, F> Visit<T> for F
where
    F: FnMut(&T),
{
    fn visit(&mut self, value: &T) {
        self(value)
    }
}

/// Longest dotted prefix of a traversal, root first.
///
/// Stops at the first operator that is not a plain attribute access, so
/// `data.amazon-ami.x[0].id` yields `["data", "amazon-ami", "x"]`.
pub fn traversal_path(traversal: &Traversal) -> Vec<String> {
    let Expression::Variable(var) = &traversal.expr else {
        return vec![];
    };

    let mut path = vec![var.as_str().to_string()];
    for operator in &traversal.operators {
        let TraversalOperator::GetAttr(ident) = operator else {
            break;
        };

        path.push(ident.as_str().to_string());
    }

    path
}

/// Collects the dotted paths of every traversal in an expression whose root
/// matches `root`, e.g. all `data.*` or `local.*` references.
pub fn paths_with_root(expr: &Expression, root: &str) -> Vec<Vec<String>> {
    let mut found = vec![];
    expr.visit_traversals(&mut |traversal: &Traversal| {
        let path = traversal_path(traversal);
        if path.first().map(String::as_str) == Some(root) {
            found.push(path);
        }
    });
    found
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn expression(source: &str) -> Expression {
        let expr: hcl_edit::expr::Expression = source.parse().expect("expression must parse");
        expr.into()
    }

    #[test]
    fn traversal_path_stops_at_index() {
        let Expression::Traversal(traversal) = expression("data.amazon-ami.x[0].id") else {
            panic!("not a traversal");
        };
        assert_eq!(traversal_path(&traversal), vec!["data", "amazon-ami", "x"]);
    }

    #[test]
    fn collects_matching_roots() {
        let expr = expression(r#"join("-", [local.prefix, data.amazon-ami.x.id, var.other])"#);
        let data_refs = paths_with_root(&expr, "data");
        assert_eq!(data_refs, vec![vec!["data", "amazon-ami", "x", "id"]]);

        let local_refs = paths_with_root(&expr, "local");
        assert_eq!(local_refs, vec![vec!["local", "prefix"]]);
    }

    #[test]
    fn traversal_roots_are_counted_once() {
        let expr = expression("data.amazon-ami.x.id");
        assert_eq!(
            paths_with_root(&expr, "data"),
            vec![vec!["data", "amazon-ami", "x", "id"]]
        );
    }
}
