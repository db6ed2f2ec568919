use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use std::sync::Arc;
use tracing::debug;

use super::facade::{SqlConn, SqlConnector, SqlShard};
use super::{datetime_value, decimal_value, split_host_port};
use crate::datasource::DsResult;
use crate::format::Row;

#[derive(Debug, Clone, Default)]
pub struct PostgresConnector;

#[async_trait]
impl SqlConnector for PostgresConnector {
    async fn open(&self, shard: &SqlShard, database: &str) -> DsResult<Arc<dyn SqlConn>> {
        let (host, port) = split_host_port(&shard.addr, 5432)?;
        let mut options = PgConnectOptions::new()
            .host(&host)
            .port(port)
            .username(&shard.user)
            .password(&shard.password);
        if !database.is_empty() {
            options = options.database(database);
        }

        let mut pool_options = PgPoolOptions::new().acquire_timeout(shard.effective_timeout());
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
        Ok(Arc::new(PostgresConn { pool }))
    }
}

#[derive(Debug)]
pub struct PostgresConn {
    pool: PgPool,
}

#[async_trait]
impl SqlConn for PostgresConn {
    async fn fetch_rows(&self, sql: &str) -> DsResult<Vec<Row>> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }
}

fn decode_row(row: &PgRow) -> DsResult<Row> {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), decode_cell(row, index)?);
    }
    Ok(out)
}

fn decode_cell(row: &PgRow, index: usize) -> DsResult<Value> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();

    let value = match type_name.as_str() {
        "BOOL" => Value::from(row.try_get::<bool, _>(index)?),
        "INT2" => Value::from(row.try_get::<i16, _>(index)?),
        "INT4" => Value::from(row.try_get::<i32, _>(index)?),
        "INT8" => Value::from(row.try_get::<i64, _>(index)?),
        "FLOAT4" => Value::from(row.try_get::<f32, _>(index)? as f64),
        "FLOAT8" => Value::from(row.try_get::<f64, _>(index)?),
        "NUMERIC" => decimal_value(row.try_get(index)?),
        "TIMESTAMP" => datetime_value(row.try_get(index)?),
        "TIMESTAMPTZ" => Value::from(
            row.try_get::<chrono::DateTime<chrono::Utc>, _>(index)?
                .to_rfc3339(),
        ),
        "DATE" => Value::from(row.try_get::<chrono::NaiveDate, _>(index)?.to_string()),
        "JSON" | "JSONB" => row.try_get::<Value, _>(index)?,
        "BYTEA" => {
            let bytes: Vec<u8> = row.try_get(index)?;
            Value::from(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => match row.try_get::<String, _>(index) {
            Ok(text) => Value::from(text),
            Err(err) => {
                debug!(
                    column = index,
                    type_name = %type_name,
                    error = %err,
                    "Undecodable Postgres cell"
                );
                Value::Null
            }
        },
    };
    Ok(value)
}
