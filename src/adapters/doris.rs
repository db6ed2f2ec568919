use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::any::Any;
use std::time::Duration;

use super::sqlbase::{self, SqlQueryParam};
use crate::datasource::{
    ColumnProperty, DataResp, Datasource, DatasourceError, DsResult, LogPage, Plugin,
    TableDescriber, decode_query, downcast,
};
use crate::sql::{SqlFacade, SqlShard, split_statements};

/// Port of the Doris FE MySQL protocol endpoint.
pub const FE_QUERY_PORT: u16 = 9030;

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_max_idle_conns() -> u32 {
    10
}

fn default_max_open_conns() -> u32 {
    100
}

fn default_conn_max_lifetime() -> u64 {
    14_400
}

fn default_max_query_rows() -> u64 {
    500
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DorisSettings {
    /// FE MySQL endpoint
    #[serde(default, rename = "doris.addr")]
    pub addr: String,
    /// FE HTTP endpoint
    #[serde(default, rename = "doris.fe_addr")]
    pub fe_addr: String,
    #[serde(default, rename = "doris.user")]
    pub user: String,
    #[serde(default, rename = "doris.password")]
    pub password: String,
    /// Milliseconds
    #[serde(default = "default_timeout_ms", rename = "doris.timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_idle_conns", rename = "doris.max_idle_conns")]
    pub max_idle_conns: u32,
    #[serde(default = "default_max_open_conns", rename = "doris.max_open_conns")]
    pub max_open_conns: u32,
    /// Seconds
    #[serde(default = "default_conn_max_lifetime", rename = "doris.conn_max_lifetime")]
    pub conn_max_lifetime: u64,
    #[serde(default = "default_max_query_rows", rename = "doris.max_query_rows")]
    pub max_query_rows: u64,
    #[serde(default, rename = "doris.cluster_name")]
    pub cluster_name: String,
}

impl DorisSettings {
    fn to_shard(&self) -> SqlShard {
        SqlShard {
            addr: self.addr.trim().to_string(),
            user: self.user.clone(),
            password: self.password.clone(),
            database: String::new(),
            timeout: Duration::from_millis(self.timeout),
            max_query_rows: self.max_query_rows,
            max_idle_conns: self.max_idle_conns,
            max_open_conns: self.max_open_conns,
            conn_max_lifetime: Duration::from_secs(self.conn_max_lifetime),
        }
    }
}

#[derive(Debug)]
pub struct Doris {
    settings: DorisSettings,
    facade: Option<SqlFacade>,
}

impl Doris {
    pub fn with_facade(mut self, facade: SqlFacade) -> Self {
        self.facade = Some(facade);
        self
    }

    fn facade(&self) -> DsResult<&SqlFacade> {
        sqlbase::client(&self.facade, Self::KIND)
    }
}

/// Doris runs one statement per request.
fn single_statement(param: &SqlQueryParam) -> DsResult<()> {
    if split_statements(&param.sql).len() > 1 {
        return Err(DatasourceError::query(
            "multiple statements are not allowed in a single query",
        ));
    }
    Ok(())
}

impl Plugin for Doris {
    const KIND: &'static str = "doris";
    type Settings = DorisSettings;

    fn init(settings: DorisSettings) -> DsResult<Self> {
        Ok(Self {
            settings,
            facade: None,
        })
    }
}

#[async_trait]
impl Datasource for Doris {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn init_client(&mut self) -> DsResult<()> {
        if self.settings.addr.trim().is_empty() {
            return Err(DatasourceError::config(
                "not found doris addr, please check datasource config",
            ));
        }
        let facade = open_facade(self.settings.to_shard())?;
        facade.new_conn("").await?;
        self.facade = Some(facade);
        Ok(())
    }

    fn validate(&self) -> DsResult<()> {
        if self.settings.addr.trim().is_empty() {
            return Err(DatasourceError::config(
                "doris addr is invalid, please check datasource setting",
            ));
        }
        if self.settings.user.trim().is_empty() {
            return Err(DatasourceError::config(
                "doris user is invalid, please check datasource setting",
            ));
        }
        Ok(())
    }

    fn equal(&self, other: &dyn Datasource) -> bool {
        downcast::<Doris>(other).is_some_and(|other| self.settings == other.settings)
    }

    fn make_ts_query(&self, query: Value, _: &[String], start: i64, end: i64) -> DsResult<Value> {
        sqlbase::make_query(query, start, end)
    }

    fn make_log_query(&self, query: Value, _: &[String], start: i64, end: i64) -> DsResult<Value> {
        sqlbase::make_query(query, start, end)
    }

    async fn query_data(&self, query: &Value) -> DsResult<Vec<DataResp>> {
        let param: SqlQueryParam = decode_query(query)?;
        single_statement(&param)?;
        sqlbase::query_timeseries(self.facade()?, param, sqlbase::now()).await
    }

    async fn query_log(&self, query: &Value) -> DsResult<LogPage> {
        let param: SqlQueryParam = decode_query(query)?;
        single_statement(&param)?;
        sqlbase::query_log(self.facade()?, param, sqlbase::now()).await
    }

    fn table_describer(&self) -> Option<&dyn TableDescriber> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl TableDescriber for Doris {
    async fn describe_table(&self, query: &Value) -> DsResult<Vec<ColumnProperty>> {
        sqlbase::describe_table(self.facade()?, query).await
    }
}

#[cfg(feature = "mysql")]
fn open_facade(shard: SqlShard) -> DsResult<SqlFacade> {
    Ok(SqlFacade::new(
        crate::sql::SqlDialect::Doris,
        shard,
        std::sync::Arc::new(crate::sql::mysql::MySqlConnector::new(FE_QUERY_PORT)),
    ))
}

#[cfg(not(feature = "mysql"))]
fn open_facade(_: SqlShard) -> DsResult<SqlFacade> {
    Err(DatasourceError::config(
        "doris datasource requires the `mysql` feature",
    ))
}
