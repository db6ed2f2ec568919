//! SQL plumbing shared by the relational adapters: statement analysis, macros,
//! dialect tables, the read-only driver facade and its connectors.

use crate::datasource::{DatasourceError, DsResult};

pub mod analyzer;
pub mod clickhouse;
pub mod dialect;
pub mod facade;
pub mod macros;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod split;

pub use analyzer::{RowCountDecision, SqlAnalysis, analyze_sql, needs_row_count_check, probe_sql};
pub use dialect::SqlDialect;
pub use facade::{
    ConnectionPool, HandlePool, SqlConn, SqlConnector, SqlFacade, SqlShard, conn_key, shared_pool,
};
pub use macros::{MacroWindow, expand_macros};
pub use split::split_statements;

/// Splits `host:port`, applying `default_port` when the port is missing.
pub fn split_host_port(addr: &str, default_port: u16) -> DsResult<(String, u16)> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(DatasourceError::config("empty address"));
    }
    match addr.rsplit_once(':') {
        // bracketed IPv6 without a port
        Some((_, tail)) if tail.ends_with(']') => Ok((addr.to_string(), default_port)),
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| DatasourceError::config(format!("invalid port in address {}", addr)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), default_port)),
    }
}

#[cfg(any(feature = "mysql", feature = "postgres"))]
pub(crate) fn datetime_value(datetime: chrono::NaiveDateTime) -> serde_json::Value {
    serde_json::Value::from(datetime.and_utc().to_rfc3339())
}

#[cfg(any(feature = "mysql", feature = "postgres"))]
pub(crate) fn decimal_value(decimal: rust_decimal::Decimal) -> serde_json::Value {
    use num_traits::ToPrimitive;
    decimal
        .to_f64()
        .map(serde_json::Value::from)
        .unwrap_or_else(|| serde_json::Value::from(decimal.to_string()))
}
