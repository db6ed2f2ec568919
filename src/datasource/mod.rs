use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;

pub mod error;
pub mod registry;
pub mod types;

pub use error::DatasourceError;
pub use registry::{Plugin, Registry};
pub use types::{
    AuthSettings, ColumnProperty, DataResp, DatasourceInfo, HttpSettings, Keys, LogPage,
    METRIC_NAME_LABEL, MetricValues, TlsSettings, fingerprint,
};

pub type DsResult<T> = std::result::Result<T, DatasourceError>;

/// Capability set every backend adapter implements.
///
/// Instances are built by [`Plugin::init`] without I/O, then brought online by
/// [`Datasource::init_client`]. The instance cache only ever hands out instances
/// whose `init_client` returned `Ok`.
#[async_trait]
pub trait Datasource: Send + Sync + Debug {
    /// Registry kind this instance was built for.
    fn kind(&self) -> &'static str;

    /// Builds and checks the underlying driver handle. May take seconds.
    async fn init_client(&mut self) -> DsResult<()>;

    /// Checks that mandatory configuration is present.
    fn validate(&self) -> DsResult<()>;

    /// True when every connection-affecting field matches `other`.
    /// Client handles and other transient state are ignored.
    fn equal(&self, other: &dyn Datasource) -> bool;

    /// Adds event-tag conditions and the `[start, end]` window to a time-series query.
    fn make_ts_query(
        &self,
        query: Value,
        event_tags: &[String],
        start: i64,
        end: i64,
    ) -> DsResult<Value>;

    /// Adds event-tag conditions and the `[start, end]` window to a log query.
    fn make_log_query(
        &self,
        query: Value,
        event_tags: &[String],
        start: i64,
        end: i64,
    ) -> DsResult<Value>;

    /// Runs a time-series query. Zero rows is an empty, successful result.
    async fn query_data(&self, query: &Value) -> DsResult<Vec<DataResp>>;

    async fn query_log(&self, query: &Value) -> DsResult<LogPage>;

    fn table_describer(&self) -> Option<&dyn TableDescriber> {
        None
    }

    fn map_querier(&self) -> Option<&dyn MapDataQuerier> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Optional capability: column listing for a `{database, table}` query.
#[async_trait]
pub trait TableDescriber: Send + Sync {
    async fn describe_table(&self, query: &Value) -> DsResult<Vec<ColumnProperty>>;
}

/// Optional capability: first matching document as a flat string map.
#[async_trait]
pub trait MapDataQuerier: Send + Sync {
    async fn query_map_data(&self, query: &Value) -> DsResult<Vec<BTreeMap<String, String>>>;
}

pub async fn describe_table(
    datasource: &dyn Datasource,
    query: &Value,
) -> DsResult<Vec<ColumnProperty>> {
    match datasource.table_describer() {
        Some(describer) => describer.describe_table(query).await,
        None => Err(DatasourceError::Unsupported),
    }
}

pub async fn query_map_data(
    datasource: &dyn Datasource,
    query: &Value,
) -> DsResult<Vec<BTreeMap<String, String>>> {
    match datasource.map_querier() {
        Some(querier) => querier.query_map_data(query).await,
        None => Err(DatasourceError::Unsupported),
    }
}

/// Downcasts `other` to the concrete adapter type, for `equal` implementations.
pub fn downcast<T: 'static>(other: &dyn Datasource) -> Option<&T> {
    other.as_any().downcast_ref::<T>()
}

/// Decodes a query object, ignoring unknown keys.
pub fn decode_query<T: DeserializeOwned>(query: &Value) -> DsResult<T> {
    Ok(T::deserialize(query)?)
}

/// Splits `k=v` event tags. Tags without `=` are dropped.
pub fn split_event_tags(event_tags: &[String]) -> Vec<(&str, &str)> {
    event_tags
        .iter()
        .filter_map(|tag| tag.split_once('='))
        .collect()
}

/// Writes `value` under `key` when `query` is an object.
pub(crate) fn set_field(query: &mut Value, key: &str, value: Value) -> DsResult<()> {
    match query.as_object_mut() {
        Some(object) => {
            object.insert(key.to_string(), value);
            Ok(())
        }
        None => Err(DatasourceError::query("query must be a JSON object")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_event_tags() {
        let tags = vec![
            "host=h1".to_string(),
            "broken".to_string(),
            "expr=a=b".to_string(),
        ];
        assert_eq!(
            split_event_tags(&tags),
            vec![("host", "h1"), ("expr", "a=b")]
        );
    }

    #[test]
    fn test_set_field_requires_object() {
        let mut query = json!({"sql": "select 1"});
        set_field(&mut query, "from", json!(10)).unwrap();
        assert_eq!(query["from"], 10);

        let mut not_object = json!([1, 2]);
        assert!(set_field(&mut not_object, "from", json!(10)).is_err());
    }
}
