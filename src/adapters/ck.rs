use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::sqlbase::{self, SqlQueryParam};
use crate::datasource::{
    ColumnProperty, DataResp, Datasource, DatasourceError, DsResult, LogPage, Plugin,
    TableDescriber, decode_query, downcast,
};
use crate::sql::clickhouse::{ClickHouseConnector, resolve_transport};
use crate::sql::facade;
use crate::sql::{SqlDialect, SqlFacade, SqlShard};

fn default_timeout() -> u64 {
    facade::default_timeout().as_secs()
}

fn default_max_query_rows() -> u64 {
    facade::default_max_query_rows()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClickHouseSettings {
    #[serde(default, rename = "ck.nodes")]
    pub nodes: Vec<String>,
    #[serde(default, rename = "ck.user")]
    pub user: String,
    #[serde(default, rename = "ck.password")]
    pub password: String,
    /// Seconds
    #[serde(default = "default_timeout", rename = "ck.timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_query_rows", rename = "ck.max_query_rows")]
    pub max_query_rows: u64,
    /// `http`, `https` or `native`; empty probes the HTTP interface.
    #[serde(default, rename = "ck.protocol")]
    pub protocol: String,
    #[serde(default, rename = "ck.skip_ssl")]
    pub skip_ssl: bool,
    #[serde(default, rename = "ck.max_idle_conns")]
    pub max_idle_conns: u32,
    #[serde(default, rename = "ck.max_open_conns")]
    pub max_open_conns: u32,
    /// Seconds
    #[serde(default, rename = "ck.conn_max_lifetime")]
    pub conn_max_lifetime: u64,
}

impl ClickHouseSettings {
    fn first_node(&self) -> Option<&str> {
        self.nodes
            .first()
            .map(|node| node.trim())
            .filter(|node| !node.is_empty())
    }

    fn to_shard(&self, addr: &str) -> SqlShard {
        SqlShard {
            addr: addr.to_string(),
            user: self.user.clone(),
            password: self.password.clone(),
            database: String::new(),
            timeout: Duration::from_secs(self.timeout),
            max_query_rows: if self.max_query_rows > 0 {
                self.max_query_rows
            } else {
                facade::default_max_query_rows()
            },
            max_idle_conns: self.max_idle_conns,
            max_open_conns: self.max_open_conns,
            conn_max_lifetime: Duration::from_secs(self.conn_max_lifetime),
        }
    }
}

#[derive(Debug)]
pub struct ClickHouse {
    settings: ClickHouseSettings,
    facade: Option<SqlFacade>,
}

impl ClickHouse {
    pub fn with_facade(mut self, facade: SqlFacade) -> Self {
        self.facade = Some(facade);
        self
    }

    fn facade(&self) -> DsResult<&SqlFacade> {
        sqlbase::client(&self.facade, Self::KIND)
    }
}

impl Plugin for ClickHouse {
    const KIND: &'static str = "ck";
    type Settings = ClickHouseSettings;

    fn init(settings: ClickHouseSettings) -> DsResult<Self> {
        Ok(Self {
            settings,
            facade: None,
        })
    }
}

#[async_trait]
impl Datasource for ClickHouse {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn init_client(&mut self) -> DsResult<()> {
        let addr = self.settings.first_node().ok_or_else(|| {
            DatasourceError::config("not found ck addr, please check datasource config")
        })?;
        let transport = resolve_transport(&self.settings.protocol, addr).await?;
        info!(addr, ?transport, "Initializing ClickHouse client");
        let facade = SqlFacade::new(
            SqlDialect::ClickHouse,
            self.settings.to_shard(addr),
            Arc::new(ClickHouseConnector::new(transport).skip_tls_verify(self.settings.skip_ssl)),
        );
        facade.new_conn("").await?;
        self.facade = Some(facade);
        Ok(())
    }

    fn validate(&self) -> DsResult<()> {
        if self.settings.first_node().is_none() {
            return Err(DatasourceError::config(
                "ck addr is invalid, please check datasource setting",
            ));
        }
        if self.settings.user.trim().is_empty() {
            return Err(DatasourceError::config(
                "ck user is invalid, please check datasource setting",
            ));
        }
        Ok(())
    }

    /// Only the first node takes part; the rest are standby addresses.
    fn equal(&self, other: &dyn Datasource) -> bool {
        let Some(other) = downcast::<ClickHouse>(other) else {
            return false;
        };
        let (a, b) = (&self.settings, &other.settings);
        a.first_node() == b.first_node()
            && a.user == b.user
            && a.password == b.password
            && a.timeout == b.timeout
            && a.max_query_rows == b.max_query_rows
            && a.protocol == b.protocol
            && a.skip_ssl == b.skip_ssl
    }

    fn make_ts_query(&self, query: Value, _: &[String], start: i64, end: i64) -> DsResult<Value> {
        sqlbase::make_query(query, start, end)
    }

    fn make_log_query(&self, query: Value, _: &[String], start: i64, end: i64) -> DsResult<Value> {
        sqlbase::make_query(query, start, end)
    }

    async fn query_data(&self, query: &Value) -> DsResult<Vec<DataResp>> {
        let param: SqlQueryParam = decode_query(query)?;
        sqlbase::query_timeseries(self.facade()?, param, sqlbase::now()).await
    }

    async fn query_log(&self, query: &Value) -> DsResult<LogPage> {
        let param: SqlQueryParam = decode_query(query)?;
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
impl TableDescriber for ClickHouse {
    async fn describe_table(&self, query: &Value) -> DsResult<Vec<ColumnProperty>> {
        sqlbase::describe_table(self.facade()?, query).await
    }
}
