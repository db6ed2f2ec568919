use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::any::Any;

use super::sqlbase::{self, SqlQueryParam, SqlShardSettings, first_shard};
use crate::datasource::{
    ColumnProperty, DataResp, Datasource, DsResult, LogPage, Plugin, TableDescriber, decode_query,
    downcast,
};
use crate::sql::SqlFacade;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MySqlSettings {
    #[serde(default, rename = "mysql.shards")]
    pub shards: Vec<SqlShardSettings>,
}

#[derive(Debug)]
pub struct MySql {
    settings: MySqlSettings,
    facade: Option<SqlFacade>,
}

impl MySql {
    /// Replaces the driver facade built by `init_client`.
    pub fn with_facade(mut self, facade: SqlFacade) -> Self {
        self.facade = Some(facade);
        self
    }

    pub fn settings(&self) -> &MySqlSettings {
        &self.settings
    }

    fn facade(&self) -> DsResult<&SqlFacade> {
        sqlbase::client(&self.facade, Self::KIND)
    }
}

impl Plugin for MySql {
    const KIND: &'static str = "mysql";
    type Settings = MySqlSettings;

    fn init(settings: MySqlSettings) -> DsResult<Self> {
        Ok(Self {
            settings,
            facade: None,
        })
    }
}

#[async_trait]
impl Datasource for MySql {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn init_client(&mut self) -> DsResult<()> {
        let shard = first_shard(&self.settings.shards, Self::KIND)?.to_shard();
        let facade = open_facade(shard)?;
        facade.new_conn("").await?;
        self.facade = Some(facade);
        Ok(())
    }

    fn validate(&self) -> DsResult<()> {
        first_shard(&self.settings.shards, Self::KIND)?.validate(Self::KIND)
    }

    fn equal(&self, other: &dyn Datasource) -> bool {
        let Some(other) = downcast::<MySql>(other) else {
            return false;
        };
        match (self.settings.shards.first(), other.settings.shards.first()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
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
impl TableDescriber for MySql {
    async fn describe_table(&self, query: &Value) -> DsResult<Vec<ColumnProperty>> {
        sqlbase::describe_table(self.facade()?, query).await
    }
}

#[cfg(feature = "mysql")]
fn open_facade(shard: crate::sql::SqlShard) -> DsResult<SqlFacade> {
    Ok(SqlFacade::new(
        crate::sql::SqlDialect::MySql,
        shard,
        std::sync::Arc::new(crate::sql::mysql::MySqlConnector::default()),
    ))
}

#[cfg(not(feature = "mysql"))]
fn open_facade(_: crate::sql::SqlShard) -> DsResult<SqlFacade> {
    Err(crate::datasource::DatasourceError::config(
        "mysql datasource requires the `mysql` feature",
    ))
}
