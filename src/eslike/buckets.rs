use chrono::DateTime;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::datasource::{DataResp, METRIC_NAME_LABEL};

/// Points per compound label string, in first-seen order.
#[derive(Debug, Default)]
struct SeriesAccumulator {
    order: Vec<String>,
    points: HashMap<String, Vec<[f64; 2]>>,
}

impl SeriesAccumulator {
    fn push(&mut self, labels: &str, ts_millis: i64, value: f64) {
        let points = self.points.entry(labels.to_string()).or_insert_with(|| {
            self.order.push(labels.to_string());
            Vec::new()
        });
        points.push([(ts_millis / 1000) as f64, value]);
    }

    fn into_series(mut self) -> Vec<(String, Vec<[f64; 2]>)> {
        self.order
            .into_iter()
            .map(|labels| {
                let points = self.points.remove(&labels).unwrap_or_default();
                (labels, points)
            })
            .collect()
    }
}

/// Walks the `ts` date-histogram aggregation of a search response.
///
/// `keys` lists the nested aggregation names from the outermost grouping
/// inwards, ending with the metric name unless `func` is a document count.
pub fn collect_series(
    ts_aggregation: &Value,
    keys: &[String],
    func: &str,
) -> Vec<(String, Vec<[f64; 2]>)> {
    let mut acc = SeriesAccumulator::default();
    if let Some(buckets) = ts_aggregation.get("buckets") {
        walk("", keys, buckets, &mut acc, "", 0, func);
    }
    acc.into_series()
}

/// Buckets are arrays, except for keyed `filters` aggregations.
fn bucket_entries(buckets: &Value) -> Vec<(Option<Value>, &Map<String, Value>)> {
    match buckets {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_object)
            .map(|bucket| (bucket.get("key").cloned(), bucket))
            .collect(),
        Value::Object(named) => named
            .iter()
            .filter_map(|(name, bucket)| {
                bucket
                    .as_object()
                    .map(|bucket| (Some(Value::from(name.as_str())), bucket))
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn walk(
    label_key: &str,
    keys: &[String],
    buckets: &Value,
    acc: &mut SeriesAccumulator,
    labels: &str,
    ts: i64,
    func: &str,
) {
    for (key, bucket) in bucket_entries(buckets) {
        let key_text = match &key {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Number(number)) => number.to_string(),
            _ => continue,
        };

        let mut ts = ts;
        let mut bucket_labels = labels.to_string();
        match bucket.get("key_as_string") {
            Some(time) => ts = bucket_millis(time, key.as_ref()),
            None if bucket_labels.is_empty() => {
                bucket_labels = format!("{}={}", label_key, key_text)
            }
            None => bucket_labels = format!("{}--{}={}", bucket_labels, label_key, key_text),
        }

        let Some((next_key, rest)) = keys.split_first() else {
            if let Some(count) = bucket.get("doc_count").and_then(Value::as_f64) {
                acc.push(&bucket_labels, ts, count);
            }
            continue;
        };

        let Some(inner) = bucket.get(next_key) else {
            continue;
        };
        if let Some(next_buckets) = inner.get("buckets") {
            walk(next_key, rest, next_buckets, acc, &bucket_labels, ts, func);
            continue;
        }

        let value = if func == "count" || func == "nodata" {
            bucket.get("doc_count").and_then(Value::as_f64)
        } else {
            leaf_value(inner)
        };
        if let Some(value) = value {
            acc.push(&bucket_labels, ts, value);
        }
    }
}

/// Single-value metrics carry `value`, percentiles carry `values`.
fn leaf_value(inner: &Value) -> Option<f64> {
    if let Some(value) = inner.get("value") {
        return value.as_f64();
    }
    match inner.get("values")? {
        Value::Object(values) => values.values().next().and_then(Value::as_f64),
        Value::Array(values) => values
            .first()
            .and_then(|entry| entry.get("value"))
            .and_then(Value::as_f64),
        _ => None,
    }
}

/// Bucket time in epoch milliseconds; `0` when nothing parses.
fn bucket_millis(key_as_string: &Value, key: Option<&Value>) -> i64 {
    let text = key_as_string.as_str().unwrap_or_default();
    if let Ok(millis) = text.parse::<i64>() {
        return millis;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return parsed.timestamp_millis();
    }
    if let Some(millis) = key.and_then(Value::as_i64) {
        return millis;
    }
    warn!(key_as_string = text, "Unparseable bucket time, using epoch 0");
    0
}

/// Turns collected buckets into canonical series named `{ref}_{metric}`.
pub fn transfer_data(
    metric: &str,
    reference: &str,
    series: Vec<(String, Vec<[f64; 2]>)>,
) -> Vec<DataResp> {
    let name = if reference.is_empty() {
        metric.to_string()
    } else {
        format!("{}_{}", reference, metric)
    };

    series
        .into_iter()
        .map(|(labels, mut values)| {
            let mut labels_map = BTreeMap::new();
            labels_map.insert(METRIC_NAME_LABEL.to_string(), name.clone());
            for pair in labels.split("--") {
                if let Some((k, v)) = pair.split_once('=') {
                    labels_map.insert(k.to_string(), v.to_string());
                }
            }
            values.sort_by(|a, b| a[0].total_cmp(&b[0]));
            DataResp {
                reference: reference.to_string(),
                metric: labels_map,
                labels,
                values,
            }
        })
        .collect()
}
