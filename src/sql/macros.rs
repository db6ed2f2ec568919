use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::dialect::SqlDialect;
use super::split::split_statements;
use crate::datasource::{DatasourceError, DsResult};

static MACRO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$__(\w+)(?:\(([^)]*)\))?").unwrap());

/// Time window a macro expansion refers to, in Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroWindow {
    pub from: i64,
    pub to: i64,
    pub interval: i64,
}

/// Expands `$__` dashboard macros into `dialect` SQL.
///
/// Scripts holding more than one statement are rejected.
pub fn expand_macros(sql: &str, window: MacroWindow, dialect: SqlDialect) -> DsResult<String> {
    if split_statements(sql).len() > 1 {
        return Err(DatasourceError::query(
            "multiple statements are not allowed in a single query",
        ));
    }

    let mut output = String::with_capacity(sql.len());
    let mut last = 0;
    for captures in MACRO.captures_iter(sql) {
        let whole = captures.get(0).map_or(0..0, |m| m.range());
        output.push_str(&sql[last..whole.start]);
        output.push_str(&expand_one(&captures, window, dialect)?);
        last = whole.end;
    }
    output.push_str(&sql[last..]);
    Ok(output)
}

fn expand_one(
    captures: &Captures<'_>,
    window: MacroWindow,
    dialect: SqlDialect,
) -> DsResult<String> {
    let name = &captures[1];
    let args: Vec<&str> = captures
        .get(2)
        .map(|m| m.as_str().split(',').map(str::trim).filter(|a| !a.is_empty()).collect())
        .unwrap_or_default();
    let column = || {
        args.first()
            .copied()
            .ok_or_else(|| DatasourceError::query(format!("macro $__{} needs a column", name)))
    };

    Ok(match name {
        "timeFilter" => format!(
            "{} BETWEEN {} AND {}",
            column()?,
            time_literal(window.from, dialect),
            time_literal(window.to, dialect)
        ),
        "timeGroup" => {
            let column = column()?;
            let interval = match args.get(1) {
                Some(raw) => parse_interval(raw, window.interval)?,
                None => window.interval.max(1),
            };
            time_group(column, interval, dialect)
        }
        "timeFrom" => time_literal(window.from, dialect),
        "timeTo" => time_literal(window.to, dialect),
        "unixEpochFilter" => format!(
            "{} >= {} AND {} <= {}",
            column()?,
            window.from,
            column()?,
            window.to
        ),
        "unixEpochFrom" => window.from.to_string(),
        "unixEpochTo" => window.to.to_string(),
        "interval" => window.interval.to_string(),
        "interval_ms" => (window.interval * 1000).to_string(),
        other => {
            return Err(DatasourceError::query(format!("unknown macro $__{}", other)));
        }
    })
}

/// SQL expression for a Unix timestamp in `dialect`.
fn time_literal(seconds: i64, dialect: SqlDialect) -> String {
    match dialect {
        SqlDialect::MySql | SqlDialect::Doris if seconds < 0 => format!(
            "DATE_ADD(FROM_UNIXTIME(0), INTERVAL {} SECOND)",
            seconds
        ),
        SqlDialect::MySql | SqlDialect::Doris => format!("FROM_UNIXTIME({})", seconds),
        SqlDialect::Postgres => format!("to_timestamp({})", seconds),
        SqlDialect::ClickHouse if seconds < 0 => {
            format!("addSeconds(toDateTime(0), {})", seconds)
        }
        SqlDialect::ClickHouse => format!("toDateTime({})", seconds),
    }
}

fn time_group(column: &str, seconds: i64, dialect: SqlDialect) -> String {
    match dialect {
        SqlDialect::MySql | SqlDialect::Doris => {
            format!("UNIX_TIMESTAMP({}) DIV {} * {}", column, seconds, seconds)
        }
        SqlDialect::Postgres => format!(
            "floor(extract(epoch from {}) / {}) * {}",
            column, seconds, seconds
        ),
        SqlDialect::ClickHouse => format!(
            "intDiv(toUInt32({}), {}) * {}",
            column, seconds, seconds
        ),
    }
}

/// Parses `'5m'`-style durations. `$__interval` resolves to the query interval.
fn parse_interval(raw: &str, default_interval: i64) -> DsResult<i64> {
    let raw = raw.trim().trim_matches(|c| c == '\'' || c == '"');
    if raw == "$__interval" {
        return Ok(default_interval.max(1));
    }
    let invalid = || DatasourceError::query(format!("invalid interval '{}' in $__timeGroup", raw));

    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let number: i64 = number.parse().map_err(|_| invalid())?;
    let multiplier = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return Err(invalid()),
    };
    if number <= 0 {
        return Err(invalid());
    }
    Ok(number * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: MacroWindow = MacroWindow {
        from: 1700000000,
        to: 1700003600,
        interval: 60,
    };

    #[test]
    fn test_time_filter_per_dialect() {
        let sql = "SELECT * FROM t WHERE $__timeFilter(ts)";
        assert_eq!(
            expand_macros(sql, WINDOW, SqlDialect::MySql).unwrap(),
            "SELECT * FROM t WHERE ts BETWEEN FROM_UNIXTIME(1700000000) \
             AND FROM_UNIXTIME(1700003600)"
        );
        assert_eq!(
            expand_macros(sql, WINDOW, SqlDialect::Postgres).unwrap(),
            "SELECT * FROM t WHERE ts BETWEEN to_timestamp(1700000000) AND to_timestamp(1700003600)"
        );
        assert!(
            expand_macros(sql, WINDOW, SqlDialect::ClickHouse)
                .unwrap()
                .contains("toDateTime(1700000000)")
        );
    }

    #[test]
    fn test_time_group() {
        let sql = "SELECT $__timeGroup(ts, '5m') AS time, count(*) FROM t GROUP BY time";
        assert_eq!(
            expand_macros(sql, WINDOW, SqlDialect::Doris).unwrap(),
            "SELECT UNIX_TIMESTAMP(ts) DIV 300 * 300 AS time, count(*) FROM t GROUP BY time"
        );
        let sql = "SELECT $__timeGroup(ts, $__interval) FROM t";
        assert_eq!(
            expand_macros(sql, WINDOW, SqlDialect::MySql).unwrap(),
            "SELECT UNIX_TIMESTAMP(ts) DIV 60 * 60 FROM t"
        );
        assert!(
            expand_macros("SELECT $__timeGroup(ts, '5w') FROM t", WINDOW, SqlDialect::MySql)
                .is_err()
        );
    }

    #[test]
    fn test_negative_epoch() {
        let window = MacroWindow {
            from: -30,
            to: 10,
            interval: 60,
        };
        let out = expand_macros("$__timeFilter(ts)", window, SqlDialect::MySql).unwrap();
        assert_eq!(
            out,
            "ts BETWEEN DATE_ADD(FROM_UNIXTIME(0), INTERVAL -30 SECOND) AND FROM_UNIXTIME(10)"
        );
    }

    #[test]
    fn test_scalar_macros() {
        let sql = "SELECT * FROM t WHERE $__unixEpochFilter(ts) AND bucket = $__interval";
        assert_eq!(
            expand_macros(sql, WINDOW, SqlDialect::MySql).unwrap(),
            "SELECT * FROM t WHERE ts >= 1700000000 AND ts <= 1700003600 AND bucket = 60"
        );
        assert_eq!(
            expand_macros(
                "$__unixEpochFrom() $__unixEpochTo() $__interval_ms",
                WINDOW,
                SqlDialect::Postgres
            )
            .unwrap(),
            "1700000000 1700003600 60000"
        );
    }

    #[test]
    fn test_rejects_multiple_statements_and_unknown_macros() {
        assert!(expand_macros("SELECT 1; SELECT 2", WINDOW, SqlDialect::MySql).is_err());
        assert!(expand_macros("SELECT $__nope(x)", WINDOW, SqlDialect::MySql).is_err());
        // a trailing separator is still a single statement
        assert!(expand_macros("SELECT 1;", WINDOW, SqlDialect::MySql).is_ok());
    }
}
