//! Query handling shared by the Elasticsearch and OpenSearch adapters.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use crate::datasource::{DataResp, DatasourceError, DsResult, LogPage, decode_query};
use crate::eslike::builder::group_name;
use crate::eslike::{
    DEFAULT_INTERVAL, DEFAULT_MAX_SHARD, EsQuery, Flavor, SearchClient, build_log_search,
    build_ts_search, collect_series, transfer_data,
};

/// Seconds added to a map-data window so a slow previous run leaves no gap.
pub const MAP_DATA_SLACK: i64 = 30;

/// Per-datasource fallbacks for fields a query leaves unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchDefaults {
    pub timeout_ms: i64,
    pub max_shard: i64,
}

impl SearchDefaults {
    fn timeout_seconds(&self, query: &EsQuery) -> i64 {
        if query.timeout > 0 {
            query.timeout
        } else {
            self.timeout_ms / 1000
        }
    }

    fn max_shard(&self, query: &EsQuery) -> i64 {
        if query.max_shard > 0 {
            query.max_shard
        } else if self.max_shard > 0 {
            self.max_shard
        } else {
            DEFAULT_MAX_SHARD
        }
    }
}

pub(crate) fn client<'a>(
    client: &'a Option<SearchClient>,
    kind: &str,
) -> DsResult<&'a SearchClient> {
    client
        .as_ref()
        .ok_or_else(|| DatasourceError::config(format!("{} client is not initialized", kind)))
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Aggregation names from the outermost grouping inwards, then the metric field.
fn bucket_keys(query: &EsQuery) -> Vec<String> {
    let mut keys: Vec<String> = query
        .group_by
        .iter()
        .rev()
        .map(|group| group_name(group).to_string())
        .collect();
    if query.metric_aggr.func != "count" {
        keys.push(query.metric_aggr.field.clone());
    }
    keys
}

pub async fn query_timeseries(
    client: &SearchClient,
    flavor: Flavor,
    defaults: SearchDefaults,
    query: &Value,
    now: i64,
) -> DsResult<Vec<DataResp>> {
    let mut param: EsQuery = decode_query(query)?;
    if param.interval <= 0 {
        param.interval = DEFAULT_INTERVAL;
    }
    let body = build_ts_search(&param, flavor, now)?;
    let response = client
        .search(
            &param.indices(),
            &body,
            defaults.timeout_seconds(&param),
            defaults.max_shard(&param),
        )
        .await?;

    let Some(ts) = response.get("aggregations").and_then(|aggs| aggs.get("ts")) else {
        debug!(index = %param.index, "Search response carries no ts aggregation");
        return Ok(Vec::new());
    };
    let func = param.metric_aggr.func.as_str();
    let series = collect_series(ts, &bucket_keys(&param), func);
    let metric = format!("{}_{}", param.metric_aggr.field, func);
    Ok(transfer_data(&metric, &param.reference, series))
}

/// `hits.total` is a number before ES 7 and `{value, relation}` after.
fn total_hits(hits: &Value) -> i64 {
    match hits.get("total") {
        Some(Value::Number(total)) => total.as_i64().unwrap_or_default(),
        Some(total) => total
            .get("value")
            .and_then(Value::as_i64)
            .unwrap_or_default(),
        None => 0,
    }
}

/// Leaves of `source` as dotted paths, each wrapped in a one-element array.
fn flatten_fields(source: &Map<String, Value>, prefix: &str, fields: &mut Map<String, Value>) {
    for (key, value) in source {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Object(inner) => flatten_fields(inner, &path, fields),
            leaf => {
                fields.insert(path, Value::Array(vec![leaf.clone()]));
            }
        }
    }
}

async fn search_hits(
    client: &SearchClient,
    flavor: Flavor,
    defaults: SearchDefaults,
    param: &EsQuery,
    now: i64,
) -> DsResult<LogPage> {
    let body = build_log_search(param, now);
    let response = client
        .search(
            &param.indices(),
            &body,
            defaults.timeout_seconds(param),
            defaults.max_shard(param),
        )
        .await?;

    let hits = response.get("hits").cloned().unwrap_or(Value::Null);
    let total = total_hits(&hits);
    let mut rows = match hits.get("hits") {
        Some(Value::Array(rows)) => rows.clone(),
        _ => Vec::new(),
    };
    if flavor == Flavor::Es6 {
        for row in rows.iter_mut().filter_map(Value::as_object_mut) {
            let Some(Value::Object(source)) = row.get("_source") else {
                continue;
            };
            let mut fields = match row.get("fields") {
                Some(Value::Object(fields)) => fields.clone(),
                _ => Map::new(),
            };
            flatten_fields(source, "", &mut fields);
            row.insert("fields".to_string(), Value::Object(fields));
        }
    }
    debug!(index = %param.index, rows = rows.len(), total, "Log search done");
    Ok(LogPage { rows, total })
}

pub async fn query_log(
    client: &SearchClient,
    flavor: Flavor,
    defaults: SearchDefaults,
    query: &Value,
    now: i64,
) -> DsResult<LogPage> {
    let param: EsQuery = decode_query(query)?;
    search_hits(client, flavor, defaults, &param, now).await
}

/// First matching document's source with every value stringified.
pub async fn query_map_data(
    client: &SearchClient,
    flavor: Flavor,
    defaults: SearchDefaults,
    query: &Value,
    now: i64,
) -> DsResult<Vec<BTreeMap<String, String>>> {
    let mut param: EsQuery = decode_query(query)?;
    param.interval += MAP_DATA_SLACK;
    let page = search_hits(client, flavor, defaults, &param, now).await?;

    let first = page
        .rows
        .iter()
        .find_map(|hit| hit.get("_source").and_then(Value::as_object));
    Ok(first
        .map(|source| {
            source
                .iter()
                .map(|(key, value)| {
                    let text = match value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), text)
                })
                .collect()
        })
        .into_iter()
        .collect())
}
