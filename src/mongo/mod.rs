//! Document-store access: query shapes, pipeline building and result normalization.
//!
//! Pipelines and filters are built as extended JSON so they can be inspected
//! and tested without a server; the driver-backed [`DocumentStore`] converts
//! them to BSON at the edge.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use crate::datasource::{DatasourceError, DsResult, Keys};
use crate::format::Row;

#[cfg(feature = "mongodb")]
pub mod driver;

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// One MongoDB endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MongoShard {
    #[serde(default, rename = "mongodb.uri")]
    pub uri: String,
    #[serde(default, rename = "mongodb.hosts")]
    pub hosts: Vec<String>,
    #[serde(default, rename = "mongodb.user")]
    pub user: String,
    #[serde(default, rename = "mongodb.password")]
    pub password: String,
    #[serde(default, rename = "mongodb.auth_source")]
    pub auth_source: String,
    #[serde(default, rename = "mongodb.replica_set")]
    pub replica_set: String,
    #[serde(default, rename = "mongodb.database")]
    pub database: String,
    /// Seconds
    #[serde(default, rename = "mongodb.timeout")]
    pub timeout: u64,
    #[serde(default, rename = "mongodb.max_pool_size")]
    pub max_pool_size: u32,
    #[serde(default, rename = "mongodb.tls_enable")]
    pub tls_enable: bool,
    #[serde(default, rename = "mongodb.tls_skip_verify")]
    pub tls_skip_verify: bool,
    #[serde(default, rename = "mongodb.params")]
    pub params: HashMap<String, String>,
}

impl MongoShard {
    /// The configured URI, else one assembled from the host list.
    pub fn connection_uri(&self) -> DsResult<String> {
        if !self.uri.is_empty() {
            return Ok(self.uri.clone());
        }
        if self.hosts.is_empty() {
            return Err(DatasourceError::config("empty mongodb uri or hosts"));
        }
        Ok(format!("mongodb://{}", self.hosts.join(",")))
    }

    pub fn client_key(&self) -> DsResult<String> {
        Ok([
            self.connection_uri()?.as_str(),
            &self.user,
            &self.password,
            &self.auth_source,
            &self.replica_set,
        ]
        .join("|"))
    }

    pub fn effective_timeout(&self) -> Duration {
        Duration::from_secs(if self.timeout > 0 {
            self.timeout
        } else {
            DEFAULT_TIMEOUT_SECONDS
        })
    }

    /// Params with lower-cased keys, for comparison.
    pub fn normalized_params(&self) -> HashMap<String, String> {
        self.params
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect()
    }
}

/// Common part of time-series and log queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseQuery {
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub collection: String,
    #[serde(default)]
    pub pipeline: Vec<Map<String, Value>>,
    #[serde(default)]
    pub filter: Map<String, Value>,
    #[serde(default)]
    pub projection: Map<String, Value>,
    #[serde(default)]
    pub sort: Map<String, Value>,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub skip: i64,
    #[serde(default)]
    pub time_field: String,
    #[serde(default)]
    pub from: i64,
    #[serde(default)]
    pub to: i64,
}

impl BaseQuery {
    /// Any option beyond a bare collection scan routes through `aggregate`.
    pub fn wants_aggregate(&self) -> bool {
        !self.pipeline.is_empty()
            || !self.filter.is_empty()
            || !self.sort.is_empty()
            || !self.projection.is_empty()
            || self.limit > 0
            || self.skip > 0
            || !self.time_field.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MongoQuery {
    #[serde(flatten)]
    pub base: BaseQuery,
    #[serde(default, rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub keys: Keys,
}

/// Parameters of a `find` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindRequest {
    pub filter: Map<String, Value>,
    pub sort: Option<Value>,
    pub projection: Option<Value>,
    pub limit: Option<i64>,
    pub skip: Option<u64>,
}

/// Driver seam: runs pipelines and finds against one shard.
#[async_trait]
pub trait DocumentStore: Send + Sync + Debug {
    async fn ping(&self) -> DsResult<()>;

    async fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: Vec<Value>,
    ) -> DsResult<Vec<Row>>;

    async fn find(
        &self,
        database: &str,
        collection: &str,
        request: FindRequest,
    ) -> DsResult<Vec<Row>>;
}

/// Epoch seconds, or milliseconds above `1e12`, as an extended-JSON date.
fn epoch_to_date(ts: i64) -> Value {
    let millis = if ts > 1_000_000_000_000 { ts } else { ts * 1000 };
    json!({"$date": {"$numberLong": millis.to_string()}})
}

/// Adds the `[from, to]` range on `time_field` to `filter`.
pub fn merge_time_filter(mut filter: Map<String, Value>, query: &BaseQuery) -> Map<String, Value> {
    if query.time_field.is_empty() {
        return filter;
    }
    let mut range = Map::new();
    if query.from > 0 {
        range.insert("$gte".to_string(), epoch_to_date(query.from));
    }
    if query.to > 0 {
        range.insert("$lte".to_string(), epoch_to_date(query.to));
    }
    if range.is_empty() {
        return filter;
    }
    match filter.get_mut(&query.time_field) {
        Some(Value::Object(existing)) => existing.extend(range),
        _ => {
            filter.insert(query.time_field.clone(), Value::Object(range));
        }
    }
    filter
}

/// The raw pipeline if given, else `$match`, `$sort`, `$skip`, `$limit`, `$project` stages.
pub fn build_pipeline(query: &BaseQuery) -> Vec<Value> {
    if !query.pipeline.is_empty() {
        return query
            .pipeline
            .iter()
            .map(|stage| normalize_value(Value::Object(stage.clone())))
            .collect();
    }

    let matched = merge_time_filter(query.filter.clone(), query);
    let mut stages = vec![json!({"$match": normalize_value(Value::Object(matched))})];
    if !query.sort.is_empty() {
        stages.push(json!({"$sort": normalize_value(Value::Object(query.sort.clone()))}));
    }
    if query.skip > 0 {
        stages.push(json!({"$skip": query.skip}));
    }
    if query.limit > 0 {
        stages.push(json!({"$limit": query.limit}));
    }
    if !query.projection.is_empty() {
        stages.push(json!({"$project": normalize_value(Value::Object(query.projection.clone()))}));
    }
    stages
}

pub fn build_find(query: &BaseQuery) -> FindRequest {
    let merged = merge_time_filter(query.filter.clone(), query);
    let filter = match normalize_value(Value::Object(merged)) {
        Value::Object(filter) => filter,
        _ => Map::new(),
    };
    let non_empty = |map: &Map<String, Value>| {
        (!map.is_empty()).then(|| normalize_value(Value::Object(map.clone())))
    };
    FindRequest {
        filter,
        sort: non_empty(&query.sort),
        projection: non_empty(&query.projection),
        limit: (query.limit > 0).then_some(query.limit),
        skip: u64::try_from(query.skip).ok().filter(|skip| *skip > 0),
    }
}

/// Epoch milliseconds of an extended-JSON `$date` payload.
fn date_millis(payload: &Value) -> Option<i64> {
    match payload {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => chrono::DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|parsed| parsed.timestamp_millis()),
        Value::Object(long) => long.get("$numberLong")?.as_str()?.parse().ok(),
        _ => None,
    }
}

/// Whole floats become integers, recursively.
pub fn normalize_value(value: Value) -> Value {
    normalize(value, false)
}

/// Like [`normalize_value`], and result cells given as extended JSON are
/// flattened: `{"$date": ..}` to epoch milliseconds, `{"$oid": ..}` to the hex string.
pub fn normalize_rows(rows: Vec<Row>) -> Vec<Row> {
    rows.into_iter()
        .map(|row| match normalize(Value::Object(row), true) {
            Value::Object(row) => row,
            _ => Map::new(),
        })
        .collect()
}

fn normalize(value: Value, flatten_extended: bool) -> Value {
    match value {
        Value::Object(map) if flatten_extended && map.len() == 1 => {
            let flat = match map.iter().next() {
                Some((key, Value::String(hex))) if key == "$oid" => Some(Value::from(hex.as_str())),
                Some((key, payload)) if key == "$date" => date_millis(payload).map(Value::from),
                _ => None,
            };
            flat.unwrap_or_else(|| normalize_map(map, flatten_extended))
        }
        Value::Object(map) => normalize_map(map, flatten_extended),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| normalize(item, flatten_extended))
                .collect(),
        ),
        Value::Number(number) if number.is_f64() => match number.as_f64() {
            Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                Value::from(f as i64)
            }
            _ => Value::Number(number),
        },
        other => other,
    }
}

fn normalize_map(map: Map<String, Value>, flatten_extended: bool) -> Value {
    Value::Object(
        map.into_iter()
            .map(|(k, v)| (k, normalize(v, flatten_extended)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(value: Value) -> BaseQuery {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_pipeline_from_find_options() {
        let q = query(json!({
            "collection": "events",
            "filter": {"level": "err", "ts": {"$exists": true}},
            "sort": {"ts": -1.0},
            "projection": {"_id": 0},
            "limit": 10,
            "skip": 5,
            "time_field": "ts",
            "from": 1700000000,
            "to": 1700000060000i64,
        }));
        let stages = build_pipeline(&q);
        assert_eq!(stages.len(), 5);
        let matched = &stages[0]["$match"];
        assert_eq!(matched["level"], "err");
        assert_eq!(matched["ts"]["$exists"], true);
        assert_eq!(matched["ts"]["$gte"]["$date"]["$numberLong"], "1700000000000");
        assert_eq!(matched["ts"]["$lte"]["$date"]["$numberLong"], "1700000060000");
        assert_eq!(stages[1]["$sort"]["ts"], json!(-1));
        assert_eq!(stages[2]["$skip"], 5);
        assert_eq!(stages[3]["$limit"], 10);
        assert!(stages[4]["$project"].is_object());
    }

    #[test]
    fn test_raw_pipeline_wins() {
        let q = query(json!({
            "pipeline": [{"$match": {"level": "err"}}, {"$limit": 3.0}],
            "filter": {"ignored": true},
        }));
        assert_eq!(
            build_pipeline(&q),
            vec![json!({"$match": {"level": "err"}}), json!({"$limit": 3})]
        );
        assert!(q.wants_aggregate());
        assert!(!query(json!({"collection": "c"})).wants_aggregate());
    }

    #[test]
    fn test_normalize_value() {
        assert_eq!(normalize_value(json!(3.0)), json!(3));
        assert_eq!(normalize_value(json!(3.5)), json!(3.5));
        assert_eq!(normalize_value(json!({"a": [1.0, "x"]})), json!({"a": [1, "x"]}));
    }

    #[test]
    fn test_normalize_rows_flattens_extended_json() {
        let rows = normalize_rows(vec![
            json!({
                "_id": {"$oid": "6553f1a0c0ffee0000000001"},
                "ts": {"$date": "2023-11-14T22:13:20Z"},
                "legacy": {"$date": {"$numberLong": "1700000000000"}},
                "range": {"$date": "x", "other": 1.0},
            })
            .as_object()
            .cloned()
            .unwrap(),
        ]);
        assert_eq!(rows[0]["_id"], "6553f1a0c0ffee0000000001");
        assert_eq!(rows[0]["ts"], 1_700_000_000_000_i64);
        assert_eq!(rows[0]["legacy"], 1_700_000_000_000_i64);
        assert_eq!(rows[0]["range"]["other"], 1);

        // query documents keep their extended JSON
        let filter = json!({"ts": {"$gte": {"$date": {"$numberLong": "1"}}}});
        assert_eq!(normalize_value(filter.clone()), filter);
    }

    #[test]
    fn test_shard_uri_and_key() {
        let shard = MongoShard {
            hosts: vec!["a:27017".to_string(), "b:27017".to_string()],
            user: "u".to_string(),
            ..Default::default()
        };
        assert_eq!(shard.connection_uri().unwrap(), "mongodb://a:27017,b:27017");
        assert_eq!(shard.client_key().unwrap(), "mongodb://a:27017,b:27017|u|||");
        assert!(MongoShard::default().connection_uri().is_err());
        assert_eq!(shard.effective_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_find_request() {
        let request = build_find(&query(json!({"collection": "c", "skip": -1})));
        assert!(request.filter.is_empty());
        assert_eq!(request.skip, None);
        assert_eq!(request.limit, None);
    }
}
