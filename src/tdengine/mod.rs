//! TDengine REST access and result conversion.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::datasource::{DataResp, DatasourceError, DsResult, Keys};
use crate::format::{self, Row};

pub mod client;

pub use client::{ApiResponse, MAX_BODY_BYTES, TdengineClient, TdengineOptions};

pub const DEFAULT_INTERVAL: i64 = 60;
pub const DEFAULT_LOG_LIMIT: &str = " limit 200";

/// Column type from a meta entry: a v2 numeric code or a v3 type name.
pub fn column_type_name(raw: &Value) -> Option<String> {
    match raw {
        Value::Number(code) => {
            let name = match code.as_i64()? {
                1 => "BOOL",
                2 => "TINYINT",
                3 => "SMALLINT",
                4 => "INT",
                5 => "BIGINT",
                6 => "FLOAT",
                7 => "DOUBLE",
                8 => "BINARY",
                9 => "TIMESTAMP",
                10 => "NCHAR",
                _ => "UNKNOWN",
            };
            Some(name.to_string())
        }
        Value::String(name) => Some(name.to_uppercase()),
        _ => None,
    }
}

fn is_numeric(column_type: &str) -> bool {
    matches!(
        column_type,
        "BIGINT"
            | "INT"
            | "INT UNSIGNED"
            | "BIGINT UNSIGNED"
            | "FLOAT"
            | "DOUBLE"
            | "SMALLINT"
            | "SMALLINT UNSIGNED"
            | "TINYINT"
            | "TINYINT UNSIGNED"
            | "BOOL"
    )
}

/// `(type2, indexable)` of a TDengine column type.
pub fn type2(column_type: &str) -> (&'static str, bool) {
    match column_type {
        "TIMESTAMP" => ("date", true),
        "FLOAT" | "DOUBLE" => ("float", true),
        "BOOL" => ("bool", true),
        t if is_numeric(t) => ("long", true),
        _ => ("text", true),
    }
}

/// Rows keyed by column name.
pub fn to_rows(response: &ApiResponse) -> Vec<Row> {
    response
        .data
        .iter()
        .map(|cells| {
            cells
                .iter()
                .enumerate()
                .filter_map(|(index, cell)| {
                    response
                        .column_name(index)
                        .map(|name| (name.to_string(), cell.clone()))
                })
                .collect()
        })
        .collect()
}

/// Assigns column roles from the meta: the timestamp column is the time,
/// numeric columns are values and everything else is a label. Non-empty
/// `keys.value` / `keys.label` restrict which columns take each role.
pub fn classify_columns(response: &ApiResponse, keys: &Keys) -> DsResult<Keys> {
    let wanted_values: Vec<&str> = keys.value_columns().collect();
    let wanted_labels: Vec<&str> = keys.label_columns().collect();
    let mut values = Vec::new();
    let mut labels = Vec::new();
    let mut time = None;

    for meta in &response.column_meta {
        let Some(name) = meta.first().and_then(Value::as_str) else {
            continue;
        };
        let Some(column_type) = meta.get(1).and_then(column_type_name) else {
            warn!(column = name, "Unexpected TDengine column type format");
            continue;
        };
        if column_type == "TIMESTAMP" {
            time = Some(name);
        } else if is_numeric(&column_type) {
            if wanted_values.is_empty() || wanted_values.contains(&name) {
                values.push(name);
            }
        } else if wanted_labels.is_empty() || wanted_labels.contains(&name) {
            labels.push(name);
        }
    }

    let time = time.ok_or_else(|| {
        DatasourceError::query("timestamp column not found, please check your query")
    })?;
    Ok(Keys {
        value: values.join(" "),
        label: labels.join(" "),
        time: time.to_string(),
        time_format: keys.time_format.clone(),
    })
}

pub fn to_series(response: &ApiResponse, keys: &Keys, reference: &str) -> DsResult<Vec<DataResp>> {
    let keys = classify_columns(response, keys)?;
    let rows = to_rows(response);
    Ok(format::format_metric_values(&keys, &rows, true)
        .into_iter()
        .map(|series| DataResp::from_series(reference, series))
        .collect())
}

/// Query shape of the TDengine adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TdengineQuery {
    #[serde(default)]
    pub query: String,
    /// RFC3339 string or epoch seconds.
    #[serde(default)]
    pub from: Value,
    #[serde(default)]
    pub to: Value,
    #[serde(default)]
    pub interval: i64,
    #[serde(default)]
    pub keys: Keys,
    #[serde(default, rename = "ref")]
    pub reference: String,
}

fn rfc3339(seconds: i64) -> String {
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A bound as RFC3339 text; `None` when unset.
fn bound_text(bound: &Value) -> Option<String> {
    match bound {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => number.as_i64().filter(|n| *n != 0).map(rfc3339),
        _ => None,
    }
}

impl TdengineQuery {
    pub fn interval(&self) -> i64 {
        if self.interval > 0 {
            self.interval
        } else {
            DEFAULT_INTERVAL
        }
    }

    /// Substitutes `$from`, `$to` and `$interval`. An unset window means the
    /// last interval before `now`.
    pub fn render(&self, now: i64) -> String {
        let interval = self.interval();
        let (from, to) = match bound_text(&self.from) {
            Some(from) => (from, bound_text(&self.to).unwrap_or_else(|| rfc3339(now))),
            None => (rfc3339(now - interval), rfc3339(now)),
        };
        self.query
            .replace("$from", &format!("'{}'", from))
            .replace("$to", &format!("'{}'", to))
            .replace("$interval", &format!("{}s", interval))
    }

    /// [`Self::render`] plus a default row cap when the query has none.
    pub fn render_log(&self, now: i64) -> String {
        let mut sql = self.render(now);
        if !sql.to_lowercase().contains("limit") {
            sql.push_str(DEFAULT_LOG_LIMIT);
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(meta: Value, data: Value) -> ApiResponse {
        serde_json::from_value(json!({"code": 0, "column_meta": meta, "data": data})).unwrap()
    }

    #[test]
    fn test_classifies_columns() {
        let resp = response(
            json!([["ts", 9], ["host", 10], ["v", 7]]),
            json!([[1700000000000i64, "h1", 1.5]]),
        );
        let keys = Keys {
            value: "v".to_string(),
            label: "host".to_string(),
            ..Default::default()
        };
        let series = to_series(&resp, &keys, "A").unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].metric["__name__"], "v");
        assert_eq!(series[0].metric["host"], "h1");
        assert_eq!(series[0].values, vec![[1700000000.0, 1.5]]);
        assert_eq!(series[0].reference, "A");
    }

    #[test]
    fn test_v3_names_and_restricted_keys() {
        let resp = response(
            json!([
                ["ts", "TIMESTAMP", 8],
                ["current", "FLOAT", 4],
                ["voltage", "INT", 4],
                ["loc", "VARCHAR", 24]
            ]),
            json!([["2023-11-14T22:13:20.000Z", 10.5, 220, "sf"]]),
        );
        let keys = Keys {
            value: "voltage".to_string(),
            ..Default::default()
        };
        let series = to_series(&resp, &keys, "").unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].metric["__name__"], "voltage");
        assert_eq!(series[0].metric["loc"], "sf");
    }

    #[test]
    fn test_missing_timestamp_column() {
        let resp = response(json!([["v", 7]]), json!([[1.0]]));
        let err = to_series(&resp, &Keys::default(), "").unwrap_err();
        assert_eq!(err.to_string(), "timestamp column not found, please check your query");
    }

    #[test]
    fn test_render_substitutions() {
        let query = TdengineQuery {
            query: "select avg(v) from m where ts >= $from and ts <= $to interval($interval)"
                .to_string(),
            from: json!(1700000000),
            to: json!("2023-11-14T22:23:20Z"),
            interval: 30,
            ..Default::default()
        };
        assert_eq!(
            query.render(0),
            "select avg(v) from m where ts >= '2023-11-14T22:13:20Z' \
             and ts <= '2023-11-14T22:23:20Z' interval(30s)"
        );

        let unset = TdengineQuery {
            query: "select * from m where ts > $from".to_string(),
            ..Default::default()
        };
        assert_eq!(
            unset.render_log(1700000060),
            "select * from m where ts > '2023-11-14T22:13:20Z' limit 200"
        );
    }
}
