use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use std::sync::Arc;
use tracing::debug;

use super::facade::{SqlConn, SqlConnector, SqlShard};
use super::{datetime_value, decimal_value, split_host_port};
use crate::datasource::DsResult;
use crate::format::Row;

/// Opens sqlx MySQL pools. Serves MySQL, Doris, and the ClickHouse MySQL interface.
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    default_port: u16,
}

impl MySqlConnector {
    pub fn new(default_port: u16) -> Self {
        Self { default_port }
    }
}

impl Default for MySqlConnector {
    fn default() -> Self {
        Self::new(3306)
    }
}

#[async_trait]
impl SqlConnector for MySqlConnector {
    async fn open(&self, shard: &SqlShard, database: &str) -> DsResult<Arc<dyn SqlConn>> {
        let (host, port) = split_host_port(&shard.addr, self.default_port)?;
        // Doris and ClickHouse reject the session variables sqlx sets by default
        let mut options = MySqlConnectOptions::new()
            .host(&host)
            .port(port)
            .username(&shard.user)
            .password(&shard.password)
            .charset("utf8mb4")
            .pipes_as_concat(false)
            .no_engine_substitution(false)
            .timezone(None::<String>);
        if !database.is_empty() {
            options = options.database(database);
        }

        let mut pool_options = MySqlPoolOptions::new().acquire_timeout(shard.effective_timeout());
        if shard.max_open_conns > 0 {
            pool_options = pool_options.max_connections(shard.max_open_conns);
        }
        if !shard.conn_max_lifetime.is_zero() {
            pool_options = pool_options.max_lifetime(shard.conn_max_lifetime);
        }
        if let Some(idle) = shard.retained_idle_conns() {
            pool_options = pool_options.min_connections(idle);
        }
        let pool = pool_options.connect_with(options).await?;
        Ok(Arc::new(MySqlConn { pool }))
    }
}

#[derive(Debug)]
pub struct MySqlConn {
    pool: MySqlPool,
}

#[async_trait]
impl SqlConn for MySqlConn {
    async fn fetch_rows(&self, sql: &str) -> DsResult<Vec<Row>> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }
}

fn decode_row(row: &MySqlRow) -> DsResult<Row> {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), decode_cell(row, index)?);
    }
    Ok(out)
}

fn decode_cell(row: &MySqlRow, index: usize) -> DsResult<Value> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();

    let value = match type_name.as_str() {
        "BOOLEAN" => Value::from(row.try_get::<bool, _>(index)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            Value::from(row.try_get::<i64, _>(index)?)
        }
        name if name.ends_with("UNSIGNED") => Value::from(row.try_get::<u64, _>(index)?),
        "FLOAT" => Value::from(row.try_get::<f32, _>(index)? as f64),
        "DOUBLE" => Value::from(row.try_get::<f64, _>(index)?),
        "DECIMAL" => decimal_value(row.try_get(index)?),
        "DATETIME" | "TIMESTAMP" => datetime_value(row.try_get(index)?),
        "DATE" => Value::from(row.try_get::<chrono::NaiveDate, _>(index)?.to_string()),
        "JSON" => row.try_get::<Value, _>(index)?,
        _ => match row.try_get::<String, _>(index) {
            Ok(text) => Value::from(text),
            Err(_) => match row.try_get::<Vec<u8>, _>(index) {
                Ok(bytes) => Value::from(String::from_utf8_lossy(&bytes).into_owned()),
                Err(err) => {
                    debug!(
                        column = index,
                        type_name = %type_name,
                        error = %err,
                        "Undecodable MySQL cell"
                    );
                    Value::Null
                }
            },
        },
    };
    Ok(value)
}
