//! Parses a candidate statement and derives the policy facts reported back to
//! callers.

use std::{collections::BTreeSet, ops::ControlFlow};

use serde::Serialize;
use sqlparser::{
    ast::{
        Expr, ObjectName, Query, SelectItem, SetExpr, Statement, TableFactor, Value, Visit,
        Visitor,
    },
    parser::Parser,
};
use tracing::debug;

use crate::dialect::Dialect;

/// Policy facts about one candidate statement. Produced once per validation
/// call; every flag is `false` when the statement does not parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub parse_ok: bool,
    pub select_only: bool,
    pub no_star: bool,
    pub limit_ok: bool,
    pub tables_ok: bool,
    /// Lowercase table names referenced anywhere in the statement, sorted.
    pub tables_used: BTreeSet<String>,
}

impl ValidationReport {
    /// True when every policy predicate holds.
    pub fn passes(&self) -> bool {
        self.parse_ok && self.select_only && self.no_star && self.limit_ok && self.tables_ok
    }
}

/// Contract for the validation stage of the compile pipeline.
pub trait SqlValidator: Send + Sync {
    fn validate(
        &self,
        sql: &str,
        dialect: Dialect,
        allowed_tables: &BTreeSet<String>,
        limit_max: u64,
    ) -> ValidationReport;
}

/// Validator backed by the `sqlparser` AST.
#[derive(Debug, Default, Clone, Copy)]
pub struct AstValidator;

impl SqlValidator for AstValidator {
    fn validate(
        &self,
        sql: &str,
        dialect: Dialect,
        allowed_tables: &BTreeSet<String>,
        limit_max: u64,
    ) -> ValidationReport {
        validate_sql(sql, dialect, allowed_tables, limit_max)
    }
}

/// Parses `sql` under `dialect` and evaluates the policy predicates.
///
/// `limit_max` is the inclusive upper bound for the top-level `LIMIT`. Parse
/// errors, empty input and multi-statement scripts all produce a report with
/// `parse_ok = false`; nothing is raised to the caller.
pub fn validate_sql(
    sql: &str,
    dialect: Dialect,
    allowed_tables: &BTreeSet<String>,
    limit_max: u64,
) -> ValidationReport {
    let parser_dialect = dialect.parser_dialect();
    let mut statements = match Parser::parse_sql(parser_dialect.as_ref(), sql) {
        Ok(statements) => statements,
        Err(err) => {
            debug!(%dialect, error = %err, "statement failed to parse");
            return ValidationReport::default();
        }
    };
    if statements.len() != 1 {
        debug!(%dialect, count = statements.len(), "expected exactly one statement");
        return ValidationReport::default();
    }
    let statement = statements.remove(0);

    let mut facts = TreeFacts::default();
    let _ = statement.visit(&mut facts);

    let allowed: BTreeSet<String> = allowed_tables
        .iter()
        .map(|table| table.to_lowercase())
        .collect();
    let limit_ok = matches!(top_level_limit(&statement), Some(value) if value > 0 && value <= limit_max);

    ValidationReport {
        parse_ok: true,
        select_only: is_read_only(&statement),
        no_star: !facts.has_star,
        limit_ok,
        tables_ok: facts.tables.is_subset(&allowed),
        tables_used: facts.tables,
    }
}

/// Facts collected while walking every node of the statement, nested
/// queries included.
#[derive(Debug, Default)]
struct TreeFacts {
    tables: BTreeSet<String>,
    has_star: bool,
}

impl Visitor for TreeFacts {
    type Break = ();

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        if let Some(table) = relation.0.last() {
            self.tables.insert(table.value.to_lowercase());
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        if let Statement::Query(query) = statement {
            self.note_query(query);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        if let TableFactor::Derived { subquery, .. } = factor {
            self.note_query(subquery);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Subquery(query)
            | Expr::ArraySubquery(query)
            | Expr::InSubquery { subquery: query, .. }
            | Expr::Exists { subquery: query, .. } => self.note_query(query),
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

impl TreeFacts {
    fn note_query(&mut self, query: &Query) {
        if query_projects_wildcard(query) {
            self.has_star = true;
        }
    }
}

/// Whether any projection of `query`, its CTE bodies, or its parenthesized
/// and set-operation branches selects `*` or `t.*`. Wildcards inside
/// function arguments such as `COUNT(*)` are not projections.
fn query_projects_wildcard(query: &Query) -> bool {
    let in_ctes = query
        .with
        .as_ref()
        .is_some_and(|with| with.cte_tables.iter().any(|cte| query_projects_wildcard(&cte.query)));
    in_ctes || projects_wildcard(&query.body)
}

fn projects_wildcard(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.projection.iter().any(|item| {
            matches!(
                item,
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _)
            )
        }),
        SetExpr::Query(query) => query_projects_wildcard(query),
        SetExpr::SetOperation { left, right, .. } => {
            projects_wildcard(left) || projects_wildcard(right)
        }
        _ => false,
    }
}

fn is_read_only(statement: &Statement) -> bool {
    match statement {
        Statement::Query(query) => matches!(
            query.body.as_ref(),
            SetExpr::Select(_) | SetExpr::Query(_) | SetExpr::SetOperation { .. }
        ),
        _ => false,
    }
}

fn top_level_limit(statement: &Statement) -> Option<u64> {
    let Statement::Query(query) = statement else {
        return None;
    };
    match query.limit.as_ref()? {
        Expr::Value(Value::Number(literal, _)) => literal.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT_MAX: u64 = 200;

    fn allow(tables: &[&str]) -> BTreeSet<String> {
        tables.iter().map(|t| t.to_string()).collect()
    }

    fn used(tables: &[&str]) -> BTreeSet<String> {
        allow(tables)
    }

    #[test]
    fn clean_select_passes_every_check() {
        let report = validate_sql(
            "SELECT id, name FROM customers WHERE id > 3 LIMIT 10",
            Dialect::MySql,
            &allow(&["customers"]),
            LIMIT_MAX,
        );
        assert!(report.passes());
        assert_eq!(report.tables_used, used(&["customers"]));
    }

    #[test]
    fn wildcard_projection_is_flagged() {
        let report = validate_sql("SELECT * FROM t LIMIT 10", Dialect::Generic, &allow(&["t"]), LIMIT_MAX);
        assert!(report.parse_ok);
        assert!(report.select_only);
        assert!(!report.no_star);
        assert!(report.limit_ok);
        assert!(report.tables_ok);
    }

    #[test]
    fn qualified_and_nested_wildcards_are_flagged() {
        let qualified = validate_sql("SELECT t.* FROM t LIMIT 5", Dialect::Postgres, &allow(&["t"]), LIMIT_MAX);
        assert!(!qualified.no_star);

        let nested = validate_sql(
            "SELECT a FROM (SELECT * FROM t) AS sub LIMIT 5",
            Dialect::Postgres,
            &allow(&["t"]),
            LIMIT_MAX,
        );
        assert!(!nested.no_star);
    }

    #[test]
    fn wildcards_in_predicate_subqueries_and_ctes_are_flagged() {
        let tables = allow(&["t", "u", "recent"]);
        for sql in [
            "SELECT a FROM t WHERE a IN (SELECT * FROM u) LIMIT 5",
            "SELECT a FROM t WHERE EXISTS (SELECT * FROM u WHERE u.a = t.a) LIMIT 5",
            "SELECT a, (SELECT * FROM u LIMIT 1) AS b FROM t LIMIT 5",
            "WITH recent AS (SELECT * FROM t) SELECT a FROM recent LIMIT 5",
            "SELECT a FROM t UNION (SELECT * FROM u) LIMIT 5",
        ] {
            let report = validate_sql(sql, Dialect::Postgres, &tables, LIMIT_MAX);
            assert!(report.parse_ok, "{sql}");
            assert!(!report.no_star, "{sql}");
        }
    }

    #[test]
    fn star_inside_aggregates_is_not_a_projection_wildcard() {
        let report = validate_sql(
            "SELECT COUNT(*) FROM t WHERE a IN (SELECT COUNT(*) FROM u) LIMIT 1",
            Dialect::MySql,
            &allow(&["t", "u"]),
            LIMIT_MAX,
        );
        assert!(report.no_star);
        assert!(report.passes());
    }

    #[test]
    fn tables_outside_allow_list_fail() {
        let report = validate_sql(
            "SELECT a FROM t1 JOIN t2 ON t1.id = t2.id",
            Dialect::Postgres,
            &allow(&["t1"]),
            LIMIT_MAX,
        );
        assert!(report.parse_ok);
        assert_eq!(report.tables_used, used(&["t1", "t2"]));
        assert!(!report.tables_ok);
        assert!(!report.limit_ok);
    }

    #[test]
    fn table_names_compare_case_insensitively() {
        let report = validate_sql(
            "select id from Sales.ORDERS limit 5",
            Dialect::MySql,
            &allow(&["Orders"]),
            LIMIT_MAX,
        );
        assert_eq!(report.tables_used, used(&["orders"]));
        assert!(report.tables_ok);
    }

    #[test]
    fn subquery_tables_are_collected() {
        let report = validate_sql(
            "SELECT name FROM customers WHERE id IN (SELECT customer_id FROM orders) LIMIT 20",
            Dialect::Generic,
            &allow(&["customers", "orders"]),
            LIMIT_MAX,
        );
        assert_eq!(report.tables_used, used(&["customers", "orders"]));
        assert!(report.passes());
    }

    #[test]
    fn limit_must_be_positive_and_bounded() {
        let tables = allow(&["t"]);
        let check = |sql: &str| validate_sql(sql, Dialect::MySql, &tables, LIMIT_MAX).limit_ok;

        assert!(check("SELECT a FROM t LIMIT 1"));
        assert!(check("SELECT a FROM t LIMIT 200"));
        assert!(!check("SELECT a FROM t LIMIT 201"));
        assert!(!check("SELECT a FROM t LIMIT 0"));
        assert!(!check("SELECT a FROM t"));
        assert!(!check("SELECT a FROM t LIMIT ALL"));
    }

    #[test]
    fn limit_bound_comes_from_the_caller() {
        let tables = allow(&["t"]);
        let sql = "SELECT a FROM t LIMIT 50";
        assert!(validate_sql(sql, Dialect::Generic, &tables, 50).limit_ok);
        assert!(!validate_sql(sql, Dialect::Generic, &tables, 49).limit_ok);
    }

    #[test]
    fn set_operations_are_read_only() {
        let report = validate_sql(
            "SELECT a FROM t UNION SELECT a FROM u LIMIT 5",
            Dialect::Postgres,
            &allow(&["t", "u"]),
            LIMIT_MAX,
        );
        assert!(report.select_only);
        assert!(report.limit_ok);
    }

    #[test]
    fn writes_are_not_select_only() {
        let report = validate_sql("DELETE FROM t WHERE a = 1", Dialect::Postgres, &allow(&["t"]), LIMIT_MAX);
        assert!(report.parse_ok);
        assert!(!report.select_only);
        assert!(!report.limit_ok);
    }

    #[test]
    fn unparseable_input_yields_default_report() {
        let tables = allow(&["t"]);
        for sql in ["I am not sure what you mean.", "", "SELECT 1; SELECT 2;"] {
            let report = validate_sql(sql, Dialect::MySql, &tables, LIMIT_MAX);
            assert_eq!(report, ValidationReport::default(), "input: {sql}");
        }
    }

    #[test]
    fn trailing_terminator_is_accepted() {
        let report = validate_sql("SELECT a FROM t LIMIT 10;", Dialect::MySql, &allow(&["t"]), LIMIT_MAX);
        assert!(report.passes());
    }

    #[test]
    fn report_serializes_with_stable_field_names() {
        let report = validate_sql("SELECT a FROM t LIMIT 10", Dialect::Generic, &allow(&["t"]), LIMIT_MAX);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "parse_ok": true,
                "select_only": true,
                "no_star": true,
                "limit_ok": true,
                "tables_ok": true,
                "tables_used": ["t"]
            })
        );
    }
}
