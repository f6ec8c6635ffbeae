//! SQL text accumulator with positional argument numbering.

use super::expr::Expr;
use super::value::Value;

/// Accumulates statement text and the arguments bound to its `$n`
/// placeholders. Placeholders are numbered in emission order.
#[derive(Debug, Default)]
pub struct StatementBuilder {
    sql: String,
    args: Vec<Value>,
}

impl StatementBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_str(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    /// Bind `value` to the next placeholder and write it.
    pub fn write_arg(&mut self, value: Value) {
        self.args.push(value);
        self.sql.push('$');
        self.sql.push_str(&self.args.len().to_string());
    }

    /// Write `items` separated by `sep`, rendering each with `f`.
    pub fn write_list<T>(&mut self, items: &[T], sep: &str, mut f: impl FnMut(&mut Self, &T)) {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(sep);
            }
            f(self, item);
        }
    }

    /// Render an expression tree.
    pub fn write_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Column(col) => self.write_str(&col.qualified()),
            Expr::Arg(v) => self.write_arg(v.clone()),
            Expr::Const(c) => self.write_str(&c.to_string()),
            Expr::Now => self.write_str("NOW()"),
            Expr::Coalesce(value, fallback) => {
                self.write_str("COALESCE(");
                self.write_expr(value);
                self.write_str(", ");
                self.write_expr(fallback);
                self.write_str(")");
            }
            Expr::Add(lhs, rhs) => {
                self.write_expr(lhs);
                match rhs.as_ref() {
                    Expr::Const(c) if *c < 0 => {
                        self.write_str(" - ");
                        self.write_str(&c.unsigned_abs().to_string());
                    }
                    other => {
                        self.write_str(" + ");
                        self.write_expr(other);
                    }
                }
            }
            Expr::ArrayCat(lhs, rhs) => {
                self.write_str("array_cat(");
                self.write_expr(lhs);
                self.write_str(", ");
                self.write_expr(rhs);
                self.write_str(")");
            }
            Expr::ArrayRemove(array, item) => {
                self.write_str("array_remove(");
                self.write_expr(array);
                self.write_str(", ");
                self.write_expr(item);
                self.write_str(")");
            }
            Expr::DistinctArray(inner) => {
                self.write_str("ARRAY(SELECT DISTINCT unnest(");
                self.write_expr(inner);
                self.write_str("))");
            }
            Expr::Group(inner) => {
                self.write_str("(");
                self.write_expr(inner);
                self.write_str(")");
            }
            Expr::Excluded(name) => {
                self.write_str("EXCLUDED.");
                self.write_str(name);
            }
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn finish(self) -> (String, Vec<Value>) {
        (self.sql, self.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::expr::Table;
    use crate::sql::mutation::Mutation;

    fn render(m: &Mutation) -> (String, Vec<Value>) {
        let mut b = StatementBuilder::new();
        b.write_str(m.column().name());
        b.write_str(" = ");
        b.write_expr(&m.to_expr());
        b.finish()
    }

    fn col(name: &str) -> crate::sql::expr::Column {
        Table::new("", "users").column(name)
    }

    #[test]
    fn test_placeholders_numbered_in_emission_order() {
        let mut b = StatementBuilder::new();
        b.write_arg(Value::Int(1));
        b.write_str(", ");
        b.write_arg(Value::Int(2));
        assert_eq!(b.sql(), "$1, $2");
        assert_eq!(b.args().len(), 2);
    }

    #[test]
    fn test_render_add_recovery_codes() {
        let (sql, args) = render(&Mutation::array_append(
            col("recovery_codes"),
            vec!["code3".into()],
        ));
        assert_eq!(
            sql,
            "recovery_codes = (ARRAY(SELECT DISTINCT unnest(array_cat(COALESCE(users.recovery_codes, $1), $2))))"
        );
        assert_eq!(
            args,
            vec![
                Value::TextArray(vec![]),
                Value::TextArray(vec!["code3".into()])
            ]
        );
    }

    #[test]
    fn test_render_remove_recovery_code() {
        let (sql, args) = render(&Mutation::array_remove(col("recovery_codes"), "code3"));
        assert_eq!(sql, "recovery_codes = (array_remove(users.recovery_codes, $1))");
        assert_eq!(args, vec![Value::Text("code3".into())]);
    }

    #[test]
    fn test_render_replace_all() {
        let (sql, args) = render(&Mutation::array_replace(col("recovery_codes"), vec![]));
        assert_eq!(sql, "recovery_codes = $1");
        assert_eq!(args, vec![Value::TextArray(vec![])]);
    }

    #[test]
    fn test_render_increment() {
        let (sql, args) = render(&Mutation::increment(
            col("recovery_code_failed_attempts"),
            0i64,
            1,
        ));
        assert_eq!(
            sql,
            "recovery_code_failed_attempts = COALESCE(users.recovery_code_failed_attempts, $1) + 1"
        );
        assert_eq!(args, vec![Value::Int(0)]);
    }

    #[test]
    fn test_render_negative_increment() {
        let (sql, _) = render(&Mutation::increment(col("n"), 0i64, -2));
        assert_eq!(sql, "n = COALESCE(users.n, $1) - 2");
    }

    #[test]
    fn test_render_coalesce_default() {
        let (sql, args) = render(&Mutation::coalesce_default(col("n"), 7i64));
        assert_eq!(sql, "n = COALESCE(users.n, $1)");
        assert_eq!(args, vec![Value::Int(7)]);
    }

    #[test]
    fn test_render_now() {
        let (sql, args) = render(&Mutation::now(col("change_date")));
        assert_eq!(sql, "change_date = NOW()");
        assert!(args.is_empty());
    }

    #[test]
    fn test_write_list() {
        let mut b = StatementBuilder::new();
        b.write_list(&["a", "b", "c"], ", ", |b, s| b.write_str(s));
        assert_eq!(b.sql(), "a, b, c");
    }
}
