//! Query handling shared by the SQL-backed adapters.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::datasource::{
    ColumnProperty, DataResp, DatasourceError, DsResult, Keys, LogPage, decode_query, set_field,
};
use crate::sql::facade::default_max_query_rows;
use crate::sql::{MacroWindow, SqlDialect, SqlFacade, SqlShard, expand_macros};

pub const DEFAULT_INTERVAL: i64 = 60;

/// One entry of `mysql.shards` / `pgsql.shards`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlShardSettings {
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, alias = "database")]
    pub db: String,
    /// Seconds
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub max_query_rows: u64,
    #[serde(default)]
    pub max_idle_conns: u32,
    #[serde(default)]
    pub max_open_conns: u32,
    /// Seconds
    #[serde(default)]
    pub conn_max_lifetime: u64,
}

impl SqlShardSettings {
    pub fn to_shard(&self) -> SqlShard {
        SqlShard {
            addr: self.addr.trim().to_string(),
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.db.clone(),
            timeout: Duration::from_secs(self.timeout),
            max_query_rows: if self.max_query_rows > 0 {
                self.max_query_rows
            } else {
                default_max_query_rows()
            },
            max_idle_conns: self.max_idle_conns,
            max_open_conns: self.max_open_conns,
            conn_max_lifetime: Duration::from_secs(self.conn_max_lifetime),
        }
    }

    /// Address and user must be present.
    pub fn validate(&self, kind: &str) -> DsResult<()> {
        if self.addr.trim().is_empty() {
            return Err(DatasourceError::config(format!(
                "{} addr is invalid, please check datasource setting",
                kind
            )));
        }
        if self.user.trim().is_empty() {
            return Err(DatasourceError::config(format!(
                "{} user is invalid, please check datasource setting",
                kind
            )));
        }
        Ok(())
    }
}

/// First shard, the only one queried.
pub(crate) fn first_shard<'a>(
    shards: &'a [SqlShardSettings],
    kind: &str,
) -> DsResult<&'a SqlShardSettings> {
    shards.first().ok_or_else(|| {
        DatasourceError::config(format!("not found {} addr, please check datasource config", kind))
    })
}

/// Time-series and log query over a SQL backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlQueryParam {
    #[serde(default, rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub sql: String,
    #[serde(default)]
    pub keys: Keys,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub from: i64,
    #[serde(default)]
    pub to: i64,
    /// Seconds
    #[serde(default)]
    pub interval: i64,
    /// Seconds both bounds are shifted back by.
    #[serde(default)]
    pub offset: i64,
}

impl SqlQueryParam {
    pub fn interval(&self) -> i64 {
        if self.interval > 0 {
            self.interval
        } else {
            DEFAULT_INTERVAL
        }
    }

    /// Time-series window: the given bounds, else the last interval before `now`.
    pub fn ts_window(&mut self, now: i64) {
        if self.from == 0 || self.to == 0 {
            self.to = now;
            self.from = now - self.interval();
        }
        self.from -= self.offset;
        self.to -= self.offset;
    }

    /// Log window: filled in only when nothing but an interval was given.
    pub fn log_window(&mut self, now: i64) {
        if self.from == 0 && self.to == 0 && self.interval != 0 {
            self.to = now;
            self.from = now - self.interval;
        }
        self.from -= self.offset;
        self.to -= self.offset;
    }

    /// The statement with `$__` macros expanded for `dialect`.
    pub fn expanded_sql(&self, dialect: SqlDialect) -> DsResult<String> {
        if !self.sql.contains("$__") {
            return Ok(self.sql.clone());
        }
        let window = MacroWindow {
            from: self.from,
            to: self.to,
            interval: self.interval(),
        };
        expand_macros(&self.sql, window, dialect)
    }
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Sets the `[start, end]` window of a SQL query. Event tags are left to the statement.
pub(crate) fn make_query(mut query: Value, start: i64, end: i64) -> DsResult<Value> {
    set_field(&mut query, "from", Value::from(start))?;
    set_field(&mut query, "to", Value::from(end))?;
    Ok(query)
}

pub(crate) fn client<'a>(facade: &'a Option<SqlFacade>, kind: &str) -> DsResult<&'a SqlFacade> {
    facade
        .as_ref()
        .ok_or_else(|| DatasourceError::config(format!("{} client is not initialized", kind)))
}

/// Runs a time-series query and labels the series with the query ref.
pub async fn query_timeseries(
    facade: &SqlFacade,
    mut param: SqlQueryParam,
    now: i64,
) -> DsResult<Vec<DataResp>> {
    if param.keys.value.trim().is_empty() {
        return Err(DatasourceError::query("valueKey is required"));
    }
    param.ts_window(now);
    let sql = param.expanded_sql(facade.dialect())?;
    let series = facade
        .query_timeseries(&param.database, &sql, &param.keys, false)
        .await
        .inspect_err(|err| {
            warn!(
                dialect = facade.dialect().name(),
                sql,
                error = %err,
                "Time-series query failed"
            )
        })?;
    debug!(dialect = facade.dialect().name(), series = series.len(), "Time-series query done");
    Ok(series
        .into_iter()
        .map(|series| DataResp::from_series(&param.reference, series))
        .collect())
}

pub async fn query_log(
    facade: &SqlFacade,
    mut param: SqlQueryParam,
    now: i64,
) -> DsResult<LogPage> {
    param.log_window(now);
    let sql = param.expanded_sql(facade.dialect())?;
    let rows = facade.query(&param.database, &sql).await?;
    Ok(LogPage::counted(rows.into_iter().map(Value::Object).collect()))
}

pub async fn describe_table(facade: &SqlFacade, query: &Value) -> DsResult<Vec<ColumnProperty>> {
    let param: SqlQueryParam = decode_query(query)?;
    if param.table.is_empty() {
        return Err(DatasourceError::query("table is required"));
    }
    facade.desc_table(&param.database, &param.table).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{HandlePool, SqlShard};
    use crate::test_utils::{FakeConn, FakeConnector};
    use serde_json::json;
    use std::sync::Arc;

    fn facade(conn: Arc<FakeConn>) -> SqlFacade {
        SqlFacade::with_pool(
            SqlDialect::MySql,
            SqlShard {
                addr: "db:3306".to_string(),
                max_query_rows: 500,
                ..Default::default()
            },
            Arc::new(FakeConnector::new(conn)),
            Arc::new(HandlePool::new()),
        )
    }

    #[test]
    fn test_windows() {
        let mut param = SqlQueryParam {
            offset: 30,
            ..Default::default()
        };
        param.ts_window(1000);
        assert_eq!((param.from, param.to), (910, 970));

        let mut param = SqlQueryParam::default();
        param.log_window(1000);
        assert_eq!((param.from, param.to), (0, 0));
    }

    #[tokio::test]
    async fn test_timeseries_requires_value_key() {
        let conn = Arc::new(FakeConn::new());
        let err = query_timeseries(&facade(conn), SqlQueryParam::default(), 0)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "valueKey is required");
    }

    #[tokio::test]
    async fn test_timeseries_expands_macros() {
        let conn = Arc::new(FakeConn::new());
        conn.push_rows(vec![json!({"t": 1700000000, "v": 2, "host": "a"})]);
        let param: SqlQueryParam = serde_json::from_value(json!({
            "ref": "A",
            "sql": "select count(*) as v, host, t from m where $__timeFilter(ts) group by host, t",
            "keys": {"valueKey": "v", "labelKey": "host", "timeKey": "t"},
            "from": 1700000000,
            "to": 1700000060,
        }))
        .unwrap();

        let series = query_timeseries(&facade(conn.clone()), param, 0).await.unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].reference, "A");
        assert_eq!(series[0].labels, "host=a");
        assert!(
            conn.executed()[0]
                .contains("BETWEEN FROM_UNIXTIME(1700000000) AND FROM_UNIXTIME(1700000060)")
        );
    }

    #[tokio::test]
    async fn test_log_rows() {
        let conn = Arc::new(FakeConn::new());
        conn.push_rows(vec![json!({"msg": "a"}), json!({"msg": "b"})]);
        let param = SqlQueryParam {
            sql: "select msg from logs limit 10".to_string(),
            ..Default::default()
        };
        let page = query_log(&facade(conn), param, 0).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.rows[1]["msg"], "b");
    }
}
