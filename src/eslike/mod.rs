//! Shared Elasticsearch / OpenSearch query translation.
//!
//! Both engines speak the same search DSL; they differ in the date-histogram
//! interval key and in how log hits are shaped. The adapters hold a
//! [`SearchClient`] and a [`Flavor`] and delegate everything else here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::datasource::{DsResult, decode_query};

pub mod buckets;
pub mod builder;
pub mod client;

pub use buckets::{collect_series, transfer_data};
pub use builder::{build_log_search, build_ts_search};
pub use client::{SearchClient, SearchTarget};

pub const DEFAULT_DATE_FIELD: &str = "@timestamp";
pub const DEFAULT_INTERVAL: i64 = 60;
pub const DEFAULT_MAX_SHARD: i64 = 5;
pub const DEFAULT_LOG_LIMIT: i64 = 10;
pub const DEFAULT_TERMS_SIZE: i64 = 300;

/// Engine dialect of the search DSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// Elasticsearch 6: `interval` on date histograms, flattened `fields` on hits.
    Es6,
    /// Elasticsearch 7
    Es7,
    OpenSearch,
}

impl Flavor {
    pub fn for_es_version(version: &str) -> Self {
        if version.starts_with('6') {
            Flavor::Es6
        } else {
            Flavor::Es7
        }
    }

    pub fn histogram_interval_key(&self) -> &'static str {
        match self {
            Flavor::Es6 => "interval",
            Flavor::Es7 | Flavor::OpenSearch => "fixed_interval",
        }
    }
}

/// Leaf metric of a time-series query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricAggr {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub func: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupByCate {
    #[default]
    Terms,
    #[serde(alias = "histgram")]
    Histogram,
    Filters,
}

/// Named query of a `filters` grouping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterParam {
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupBy {
    #[serde(default)]
    pub cate: GroupByCate,
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub min_doc_count: i64,
    #[serde(default)]
    pub order: String,
    #[serde(default)]
    pub order_by: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub params: Vec<FilterParam>,
    #[serde(default)]
    pub interval: i64,
}

/// Time-series and log query over one or more indices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EsQuery {
    #[serde(default, rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub index: String,
    #[serde(default)]
    pub filter: String,
    #[serde(default, rename = "value")]
    pub metric_aggr: MetricAggr,
    #[serde(default)]
    pub group_by: Vec<GroupBy>,
    #[serde(default)]
    pub date_field: String,
    #[serde(default)]
    pub interval: i64,
    #[serde(default)]
    pub start: i64,
    #[serde(default)]
    pub end: i64,
    #[serde(default)]
    pub page: i64,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub ascending: bool,
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub max_shard: i64,
    /// Seconds subtracted from both bounds, for late-arriving data.
    #[serde(default)]
    pub delay: i64,
}

impl EsQuery {
    pub fn indices(&self) -> Vec<String> {
        self.index
            .split(',')
            .map(str::trim)
            .filter(|index| !index.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn date_field(&self) -> &str {
        if self.date_field.is_empty() {
            DEFAULT_DATE_FIELD
        } else {
            &self.date_field
        }
    }

    /// `[start, end]` in seconds, aligned down to the interval when both are set.
    pub fn window(&self, interval: i64, now: i64) -> (i64, i64) {
        let (start, end) = if self.start != 0 && self.end != 0 {
            if interval > 0 {
                (
                    self.start - self.start.rem_euclid(interval),
                    self.end - self.end.rem_euclid(interval),
                )
            } else {
                (self.start, self.end)
            }
        } else {
            (now - interval, now)
        };
        (start - self.delay, end - self.delay)
    }
}

/// Appends `k=v` event tags as `k:v` conjunctions and sets the window.
pub fn make_query(query: Value, event_tags: &[String], start: i64, end: i64) -> DsResult<Value> {
    let mut param: EsQuery = decode_query(&query)?;
    let tags: Vec<String> = event_tags
        .iter()
        .map(|tag| tag.replacen('=', ":", 1))
        .collect();
    if !tags.is_empty() {
        let joined = tags.join(" AND ");
        param.filter = if param.filter.is_empty() {
            joined
        } else {
            format!("{} AND {}", param.filter, joined)
        };
    }
    param.start = start;
    param.end = end;
    Ok(serde_json::to_value(param)?)
}
