use sqlparser::dialect::{ClickHouseDialect, Dialect, MySqlDialect, PostgreSqlDialect};

pub const TYPE_LONG: &str = "long";
pub const TYPE_FLOAT: &str = "float";
pub const TYPE_TEXT: &str = "text";
pub const TYPE_DATE: &str = "date";
pub const TYPE_BOOL: &str = "bool";

const BASE_BANNED_OPS: &[&str] = &[
    "CREATE", "INSERT", "ALTER", "REVOKE", "DROP", "RENAME", "ATTACH", "DETACH", "OPTIMIZE",
    "TRUNCATE", "SET",
];

const GENERIC_BANNED_OPS: &[&str] = &[
    "CREATE", "INSERT", "ALTER", "REVOKE", "DROP", "RENAME", "ATTACH", "DETACH", "OPTIMIZE",
    "TRUNCATE", "SET", "UPDATE", "DELETE",
];

const CLICKHOUSE_BANNED_OPS: &[&str] = &[
    "CREATE", "INSERT", "ALTER", "REVOKE", "DROP", "RENAME", "ATTACH", "DETACH", "OPTIMIZE",
    "TRUNCATE", "SET", "UPDATE", "DELETE", "GRANT", "KILL", "SYSTEM",
];

const DORIS_BANNED_OPS: &[&str] = &[
    "CREATE", "INSERT", "ALTER", "REVOKE", "DROP", "RENAME", "ATTACH", "DETACH", "OPTIMIZE",
    "TRUNCATE", "SET", "UPDATE", "DELETE", "GRANT", "KILL", "LOAD", "EXPORT",
];

/// SQL flavour spoken by a facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlDialect {
    MySql,
    Doris,
    Postgres,
    ClickHouse,
}

impl SqlDialect {
    pub fn name(&self) -> &'static str {
        match self {
            SqlDialect::MySql => "mysql",
            SqlDialect::Doris => "doris",
            SqlDialect::Postgres => "postgres",
            SqlDialect::ClickHouse => "clickhouse",
        }
    }

    /// Leading keywords rejected before a query reaches the driver.
    pub fn banned_ops(&self) -> &'static [&'static str] {
        match self {
            SqlDialect::MySql | SqlDialect::Postgres => GENERIC_BANNED_OPS,
            SqlDialect::ClickHouse => CLICKHOUSE_BANNED_OPS,
            SqlDialect::Doris => DORIS_BANNED_OPS,
        }
    }

    pub fn parser_dialect(&self) -> Box<dyn Dialect> {
        match self {
            SqlDialect::MySql | SqlDialect::Doris => Box::new(MySqlDialect {}),
            SqlDialect::Postgres => Box::new(PostgreSqlDialect {}),
            SqlDialect::ClickHouse => Box::new(ClickHouseDialect {}),
        }
    }

    pub fn show_databases_sql(&self) -> &'static str {
        match self {
            SqlDialect::MySql | SqlDialect::Doris => "SHOW DATABASES",
            SqlDialect::Postgres => {
                "SELECT datname FROM pg_database WHERE datistemplate = false ORDER BY datname"
            }
            SqlDialect::ClickHouse => "SELECT name FROM system.databases",
        }
    }

    pub fn show_tables_sql(&self, database: &str) -> String {
        match self {
            SqlDialect::MySql => format!("SHOW TABLES FROM `{}`", database),
            SqlDialect::Doris => format!("SHOW TABLES FROM {}", database),
            SqlDialect::Postgres => "SELECT table_schema || '.' || table_name AS table_name \
                 FROM information_schema.tables \
                 WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
                 ORDER BY table_schema, table_name"
                .to_string(),
            SqlDialect::ClickHouse => format!(
                "SELECT name FROM system.tables WHERE database = '{}'",
                database
            ),
        }
    }

    /// Query listing `(name, type)` for every column of `table`.
    ///
    /// Postgres tables are addressed as `schema.table`; a bare name means `public`.
    pub fn desc_table_sql(&self, database: &str, table: &str) -> String {
        match self {
            SqlDialect::MySql => format!("DESCRIBE `{}`.`{}`", database, table),
            SqlDialect::Doris => format!("DESCRIBE {}.{}", database, table),
            SqlDialect::Postgres => {
                let (schema, table) = table.split_once('.').unwrap_or(("public", table));
                format!(
                    "SELECT column_name, data_type FROM information_schema.columns \
                     WHERE table_schema = '{}' AND table_name = '{}' ORDER BY ordinal_position",
                    schema, table
                )
            }
            SqlDialect::ClickHouse => format!(
                "SELECT name, type FROM system.columns WHERE database = '{}' AND table = '{}'",
                database, table
            ),
        }
    }

    pub fn select_rows_sql(&self, database: &str, table: &str, filter: &str) -> String {
        let target = match self {
            SqlDialect::MySql => format!("`{}`.`{}`", database, table),
            SqlDialect::Postgres => table.to_string(),
            SqlDialect::Doris | SqlDialect::ClickHouse => format!("{}.{}", database, table),
        };
        if filter.trim().is_empty() {
            format!("SELECT * FROM {}", target)
        } else {
            format!("SELECT * FROM {} WHERE {}", target, filter)
        }
    }

    /// Maps a native column type to `(type2, indexable)`.
    pub fn column_type(&self, native: &str) -> (String, bool) {
        match self {
            SqlDialect::Doris => doris_column_type(native),
            SqlDialect::ClickHouse => clickhouse_column_type(native),
            SqlDialect::MySql | SqlDialect::Postgres => generic_column_type(native),
        }
    }
}

fn mapped(type2: &str, indexable: bool) -> (String, bool) {
    (type2.to_string(), indexable)
}

fn generic_column_type(native: &str) -> (String, bool) {
    let lower = native.to_lowercase();
    let starts = |prefixes: &[&str]| prefixes.iter().any(|p| lower.starts_with(p));

    if starts(&[
        "int", "tinyint", "smallint", "mediumint", "bigint", "serial", "bigserial",
    ]) {
        return mapped(TYPE_LONG, true);
    }
    if starts(&[
        "varchar", "text", "char", "tinytext", "mediumtext", "longtext", "character varying",
        "nvarchar", "nchar",
    ]) {
        return mapped(TYPE_TEXT, true);
    }
    if starts(&["float", "double", "decimal", "numeric", "real"]) {
        return mapped(TYPE_FLOAT, true);
    }
    if starts(&["date", "datetime", "timestamp", "time", "smalldatetime"]) {
        return mapped(TYPE_DATE, false);
    }
    if starts(&["boolean", "bit"]) {
        return mapped(TYPE_BOOL, false);
    }
    (lower, false)
}

fn doris_column_type(native: &str) -> (String, bool) {
    let lower = native.to_lowercase();
    match lower.as_str() {
        "double" => mapped(TYPE_FLOAT, true),
        "datetime" | "date" => mapped(TYPE_DATE, false),
        "text" => mapped(TYPE_TEXT, true),
        _ if lower.contains("int") => mapped(TYPE_LONG, true),
        _ if lower.starts_with("date") => mapped(TYPE_DATE, false),
        _ if lower.starts_with("varchar") || lower.starts_with("char") => mapped(TYPE_TEXT, true),
        _ if lower.starts_with("decimal") => mapped(TYPE_FLOAT, true),
        _ => (native.to_string(), false),
    }
}

fn clickhouse_column_type(native: &str) -> (String, bool) {
    let mut inner = native.trim();
    for wrapper in ["Nullable(", "LowCardinality("] {
        if let Some(rest) = inner.strip_prefix(wrapper) {
            inner = rest.strip_suffix(')').unwrap_or(rest);
        }
    }
    // a second pass catches LowCardinality(Nullable(String))
    if let Some(rest) = inner.strip_prefix("Nullable(") {
        inner = rest.strip_suffix(')').unwrap_or(rest);
    }

    let lower = inner.to_lowercase();
    if lower.starts_with("int") || lower.starts_with("uint") {
        mapped(TYPE_LONG, true)
    } else if lower.starts_with("float") || lower.starts_with("decimal") {
        mapped(TYPE_FLOAT, true)
    } else if lower.starts_with("string")
        || lower.starts_with("fixedstring")
        || lower.starts_with("enum")
        || lower.starts_with("uuid")
    {
        mapped(TYPE_TEXT, true)
    } else if lower.starts_with("date") {
        mapped(TYPE_DATE, false)
    } else if lower.starts_with("bool") {
        mapped(TYPE_BOOL, false)
    } else {
        (lower, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_types() {
        let d = SqlDialect::MySql;
        assert_eq!(d.column_type("BIGINT(20)"), ("long".to_string(), true));
        assert_eq!(d.column_type("varchar(255)"), ("text".to_string(), true));
        assert_eq!(d.column_type("decimal(10,2)"), ("float".to_string(), true));
        assert_eq!(d.column_type("datetime"), ("date".to_string(), false));
        assert_eq!(d.column_type("boolean"), ("bool".to_string(), false));
        assert_eq!(d.column_type("JSON"), ("json".to_string(), false));
    }

    #[test]
    fn test_doris_types() {
        let d = SqlDialect::Doris;
        assert_eq!(d.column_type("LARGEINT"), ("long".to_string(), true));
        assert_eq!(d.column_type("DATETIMEV2(3)"), ("date".to_string(), false));
        assert_eq!(d.column_type("DECIMALV3(9,2)"), ("float".to_string(), true));
        assert_eq!(d.column_type("VARIANT"), ("VARIANT".to_string(), false));
    }

    #[test]
    fn test_clickhouse_types() {
        let d = SqlDialect::ClickHouse;
        assert_eq!(d.column_type("Nullable(UInt64)"), ("long".to_string(), true));
        assert_eq!(
            d.column_type("LowCardinality(Nullable(String))"),
            ("text".to_string(), true)
        );
        assert_eq!(d.column_type("DateTime64(3)"), ("date".to_string(), false));
        assert_eq!(d.column_type("Float64"), ("float".to_string(), true));
    }

    #[test]
    fn test_banned_sets_extend_base() {
        for dialect in [
            SqlDialect::MySql,
            SqlDialect::Doris,
            SqlDialect::Postgres,
            SqlDialect::ClickHouse,
        ] {
            for op in BASE_BANNED_OPS {
                assert!(dialect.banned_ops().contains(op), "{} misses {}", dialect.name(), op);
            }
        }
    }

    #[test]
    fn test_schema_queries() {
        assert_eq!(
            SqlDialect::ClickHouse.show_tables_sql("db1"),
            "SELECT name FROM system.tables WHERE database = 'db1'"
        );
        assert!(
            SqlDialect::Postgres
                .desc_table_sql("db", "metrics.cpu")
                .contains("table_schema = 'metrics' AND table_name = 'cpu'")
        );
        assert_eq!(
            SqlDialect::Doris.select_rows_sql("db", "t", "a > 1"),
            "SELECT * FROM db.t WHERE a > 1"
        );
    }
}
