use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

use crate::datasource::{
    DataResp, Datasource, DatasourceError, DsResult, LogPage, Plugin, decode_query, downcast,
    set_field,
};
use crate::format::{Row, format_metric_values};
use crate::mongo::{BaseQuery, DocumentStore, MongoQuery, MongoShard, build_find, build_pipeline};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MongoSettings {
    #[serde(default, rename = "mongodb.shards")]
    pub shards: Vec<MongoShard>,
}

#[derive(Debug)]
pub struct MongoDb {
    settings: MongoSettings,
    store: Option<Arc<dyn DocumentStore>>,
}

impl MongoDb {
    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn first_shard(&self) -> DsResult<&MongoShard> {
        self.settings.shards.first().ok_or_else(|| {
            DatasourceError::config("not found mongodb shard, please check datasource config")
        })
    }

    fn store(&self) -> DsResult<&Arc<dyn DocumentStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| DatasourceError::config("mongodb client is not initialized"))
    }

    /// Aggregates when the query carries any option, else a plain find.
    async fn fetch(&self, query: &BaseQuery) -> DsResult<Vec<Row>> {
        if query.collection.is_empty() {
            return Err(DatasourceError::query("collection is required"));
        }
        let store = self.store()?;
        if query.wants_aggregate() {
            store
                .aggregate(&query.database, &query.collection, build_pipeline(query))
                .await
        } else {
            store
                .find(&query.database, &query.collection, build_find(query))
                .await
        }
    }
}

#[cfg(feature = "mongodb")]
async fn open_store(shard: &MongoShard) -> DsResult<Arc<dyn DocumentStore>> {
    let store = crate::mongo::driver::MongoStore::connect(shard).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "mongodb"))]
async fn open_store(_: &MongoShard) -> DsResult<Arc<dyn DocumentStore>> {
    Err(DatasourceError::config(
        "mongodb datasource requires the `mongodb` feature",
    ))
}

fn make_query(mut query: Value, start: i64, end: i64) -> DsResult<Value> {
    set_field(&mut query, "from", Value::from(start))?;
    set_field(&mut query, "to", Value::from(end))?;
    Ok(query)
}

impl Plugin for MongoDb {
    const KIND: &'static str = "mongodb";
    type Settings = MongoSettings;

    fn init(settings: MongoSettings) -> DsResult<Self> {
        Ok(Self {
            settings,
            store: None,
        })
    }
}

#[async_trait]
impl Datasource for MongoDb {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn init_client(&mut self) -> DsResult<()> {
        let store = open_store(self.first_shard()?).await?;
        self.store = Some(store);
        Ok(())
    }

    fn validate(&self) -> DsResult<()> {
        let valid = self
            .settings
            .shards
            .first()
            .is_some_and(|shard| shard.connection_uri().is_ok());
        if !valid {
            return Err(DatasourceError::config(
                "mongodb uri is invalid, please check datasource setting",
            ));
        }
        Ok(())
    }

    fn equal(&self, other: &dyn Datasource) -> bool {
        let Some(other) = downcast::<MongoDb>(other) else {
            return false;
        };
        match (self.settings.shards.first(), other.settings.shards.first()) {
            (Some(a), Some(b)) => {
                a.uri == b.uri
                    && a.hosts == b.hosts
                    && a.user == b.user
                    && a.password == b.password
                    && a.auth_source == b.auth_source
                    && a.replica_set == b.replica_set
                    && a.database == b.database
                    && a.timeout == b.timeout
                    && a.max_pool_size == b.max_pool_size
                    && a.tls_enable == b.tls_enable
                    && a.tls_skip_verify == b.tls_skip_verify
                    && a.normalized_params() == b.normalized_params()
            }
            (None, None) => true,
            _ => false,
        }
    }

    fn make_ts_query(&self, query: Value, _: &[String], start: i64, end: i64) -> DsResult<Value> {
        make_query(query, start, end)
    }

    fn make_log_query(&self, query: Value, _: &[String], start: i64, end: i64) -> DsResult<Value> {
        make_query(query, start, end)
    }

    async fn query_data(&self, query: &Value) -> DsResult<Vec<DataResp>> {
        let query: MongoQuery = decode_query(query)?;
        if query.base.collection.is_empty() {
            return Err(DatasourceError::query("collection is required"));
        }
        if query.keys.value.trim().is_empty() {
            return Err(DatasourceError::query("valueKey is required"));
        }
        let rows = self.fetch(&query.base).await?;
        debug!(
            collection = %query.base.collection,
            rows = rows.len(),
            "MongoDB time-series query done"
        );
        Ok(format_metric_values(&query.keys, &rows, true)
            .into_iter()
            .map(|series| DataResp::from_series(&query.reference, series))
            .collect())
    }

    async fn query_log(&self, query: &Value) -> DsResult<LogPage> {
        let query: BaseQuery = decode_query(query)?;
        let rows = self.fetch(&query).await?;
        Ok(LogPage::counted(rows.into_iter().map(Value::Object).collect()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
