use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{
    Expr, Function, LimitClause, Query, SelectItem, SetExpr, Statement, Value, Visit, Visitor,
};
use sqlparser::dialect::Dialect;
use sqlparser::parser::{Parser, ParserError};
use std::ops::ControlFlow;

/// Functions whose presence in the top-level projection bounds the result size.
const AGGREGATE_FUNCTIONS: &[&str] = &[
    // standard
    "COUNT", "SUM", "AVG", "MIN", "MAX", "ANY", "ANY_VALUE",
    // cardinality sketches
    "HLL_UNION_AGG", "HLL_RAW_AGG", "HLL_UNION", "HLL_CARDINALITY", "BITMAP_UNION",
    "BITMAP_UNION_COUNT", "BITMAP_UNION_INT", "BITMAP_INTERSECT", "BITMAP_AGG",
    "APPROX_COUNT_DISTINCT", "NDV",
    // percentiles and collections
    "PERCENTILE", "PERCENTILE_APPROX", "PERCENTILE_ARRAY", "PERCENTILE_CONT", "PERCENTILE_DISC",
    "COLLECT_LIST", "COLLECT_SET", "GROUP_CONCAT", "GROUP_BIT_AND", "GROUP_BIT_OR",
    "GROUP_BIT_XOR", "GROUPING", "GROUPING_ID",
    // statistics
    "STDDEV", "STDDEV_POP", "STDDEV_SAMP", "STD", "VARIANCE", "VAR_POP", "VAR_SAMP",
    "COVAR_POP", "COVAR_SAMP", "CORR",
    // analytic functions that collapse like aggregates
    "FIRST_VALUE", "LAST_VALUE", "LAG", "LEAD", "ROW_NUMBER", "RANK", "DENSE_RANK", "NTILE",
    "CUME_DIST", "PERCENT_RANK",
];

static MAP_ACCESS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\s*'[^']*'\s*\]").unwrap());
static AS_STRING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bAS\s+STRING\b").unwrap());
static TIME_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$__timeGroup\s*\([^)]*\)").unwrap());
static FILTER_MACRO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$__(timeFilter|unixEpochFilter)\s*\([^)]*\)").unwrap());
static BOUND_MACRO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$__(timeFrom|timeTo|unixEpochFrom|unixEpochTo)\s*\(\s*\)").unwrap());
static INTERVAL_MACRO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$__interval(_ms)?\b").unwrap());

/// Classification of a single SQL statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlAnalysis {
    pub is_select_like: bool,
    pub has_top_level_aggregate: bool,
    pub limit: Option<u64>,
}

/// Outcome of [`needs_row_count_check`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowCountDecision {
    pub needs_probe: bool,
    pub direct_reject: bool,
    pub reason: String,
}

impl RowCountDecision {
    fn probe() -> Self {
        Self {
            needs_probe: true,
            ..Default::default()
        }
    }

    fn pass() -> Self {
        Self::default()
    }
}

/// Rewrites constructs the parser does not understand into neutral equivalents.
///
/// Map subscripts are dropped, `AS STRING` casts become `AS CHAR`, and dashboard
/// macros are replaced with placeholders of the same syntactic category.
pub fn preprocess(sql: &str) -> String {
    let sql = MAP_ACCESS.replace_all(sql, "");
    let sql = AS_STRING.replace_all(&sql, "AS CHAR");
    let sql = TIME_GROUP.replace_all(&sql, "ts");
    let sql = FILTER_MACRO.replace_all(&sql, "1=1");
    let sql = BOUND_MACRO.replace_all(&sql, "0");
    INTERVAL_MACRO.replace_all(&sql, "60").into_owned()
}

pub fn analyze_sql(sql: &str, dialect: &dyn Dialect) -> Result<SqlAnalysis, ParserError> {
    let statements = Parser::parse_sql(dialect, &preprocess(sql))?;
    match statements.as_slice() {
        [Statement::Query(query)] => Ok(analyze_query(query)),
        [_] => Ok(SqlAnalysis::default()),
        _ => Err(ParserError::ParserError(format!(
            "expected a single statement, found {}",
            statements.len()
        ))),
    }
}

/// Decides whether `sql` must be probed with a row count before running.
///
/// Unparseable input is probed rather than rejected.
pub fn needs_row_count_check(sql: &str, max_rows: u64, dialect: &dyn Dialect) -> RowCountDecision {
    let analysis = match analyze_sql(sql, dialect) {
        Ok(analysis) => analysis,
        Err(_) => return RowCountDecision::probe(),
    };

    if !analysis.is_select_like || analysis.has_top_level_aggregate {
        return RowCountDecision::pass();
    }
    match analysis.limit {
        Some(limit) if limit <= max_rows => RowCountDecision::pass(),
        _ => RowCountDecision::probe(),
    }
}

/// Wraps `sql` into the count query used for probing.
///
/// The statement is kept verbatim apart from trailing semicolons. A trailing line
/// comment gets a newline so it cannot swallow the closing parenthesis.
pub fn probe_sql(sql: &str) -> String {
    let body = sql.trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    let last_line = body.rsplit('\n').next().unwrap_or(body);
    let newline = if has_line_comment(last_line) { "\n" } else { "" };
    format!(
        "SELECT COUNT(*) as count FROM ({}{}) AS subquery",
        body.trim_start(),
        newline
    )
}

/// `--` or a MySQL `#` comment. `#>` and `#>>` are Postgres jsonb operators.
fn has_line_comment(line: &str) -> bool {
    line.contains("--")
        || line
            .match_indices('#')
            .any(|(at, _)| !line[at + 1..].starts_with('>'))
}

fn analyze_query(query: &Query) -> SqlAnalysis {
    let (is_select_like, has_top_level_aggregate) = analyze_body(&query.body);
    SqlAnalysis {
        is_select_like,
        has_top_level_aggregate,
        limit: constant_limit(query),
    }
}

fn analyze_body(body: &SetExpr) -> (bool, bool) {
    match body {
        SetExpr::Select(select) => (true, projection_has_aggregate(&select.projection)),
        SetExpr::Query(inner) => {
            let inner = analyze_query(inner);
            (inner.is_select_like, inner.has_top_level_aggregate)
        }
        SetExpr::SetOperation { left, right, .. } => {
            let (left_select, left_agg) = analyze_body(left);
            let (right_select, right_agg) = analyze_body(right);
            (left_select && right_select, left_agg && right_agg)
        }
        _ => (false, false),
    }
}

fn constant_limit(query: &Query) -> Option<u64> {
    match query.limit_clause.as_ref()? {
        LimitClause::LimitOffset { limit, .. } => limit.as_ref().and_then(constant_u64),
        LimitClause::OffsetCommaLimit { limit, .. } => constant_u64(limit),
    }
}

fn constant_u64(expr: &Expr) -> Option<u64> {
    match expr {
        Expr::Value(value) => match &value.value {
            Value::Number(number, _) => number.parse().ok(),
            _ => None,
        },
        Expr::Nested(inner) => constant_u64(inner),
        _ => None,
    }
}

fn projection_has_aggregate(projection: &[SelectItem]) -> bool {
    let mut finder = AggregateFinder::default();
    for item in projection {
        let expr = match item {
            SelectItem::UnnamedExpr(expr) => expr,
            SelectItem::ExprWithAlias { expr, .. } => expr,
            _ => continue,
        };
        if expr.visit(&mut finder).is_break() {
            return true;
        }
    }
    false
}

/// Stops at the first aggregate call that is not nested inside a subquery.
#[derive(Default)]
struct AggregateFinder {
    query_depth: usize,
}

impl Visitor for AggregateFinder {
    type Break = ();

    fn pre_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.query_depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.query_depth = self.query_depth.saturating_sub(1);
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if self.query_depth == 0 {
            if let Expr::Function(function) = expr {
                if is_aggregate(function) {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }
}

fn is_aggregate(function: &Function) -> bool {
    let name = function.name.to_string();
    let last = name.rsplit('.').next().unwrap_or(&name);
    let last = last.trim_matches(|c| c == '`' || c == '"').to_uppercase();
    AGGREGATE_FUNCTIONS.contains(&last.as_str())
        || last.starts_with("HLL_")
        || last.starts_with("BITMAP_")
        || last.starts_with("STDDEV")
}
