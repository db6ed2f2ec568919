//! Row to series conversion shared by every SQL-shaped adapter.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::datasource::{Keys, METRIC_NAME_LABEL, MetricValues, fingerprint};

pub mod coerce;

pub use coerce::{parse_time, to_f64, to_label};

/// A driver row: column name to JSON cell.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Value,
    Label,
    Time,
}

fn column_roles(keys: &Keys) -> HashMap<&str, Role> {
    let mut roles = HashMap::new();
    for column in keys.value_columns() {
        roles.insert(column, Role::Value);
    }
    for column in keys.label_columns() {
        roles.insert(column, Role::Label);
    }
    roles.insert(keys.time_column(), Role::Time);
    roles
}

/// Groups rows into series, one per distinct label set and value column.
///
/// Undeclared columns become labels unless `ignore_undeclared` is set.
/// Rows without a time cell are stamped with the current wall-clock second.
pub fn format_metric_values(
    keys: &Keys,
    rows: &[Row],
    ignore_undeclared: bool,
) -> Vec<MetricValues> {
    format_metric_values_at(keys, rows, ignore_undeclared, chrono::Utc::now().timestamp())
}

/// [`format_metric_values`] with an explicit fallback timestamp.
pub fn format_metric_values_at(
    keys: &Keys,
    rows: &[Row],
    ignore_undeclared: bool,
    now: i64,
) -> Vec<MetricValues> {
    let roles = column_roles(keys);
    let mut series: Vec<MetricValues> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    'rows: for row in rows {
        let mut labels = BTreeMap::new();
        let mut values: Vec<(&str, f64)> = Vec::new();
        let mut timestamp = None;

        for (column, cell) in row {
            let role = match roles.get(column.as_str()) {
                Some(role) => *role,
                None if ignore_undeclared => continue,
                None => Role::Label,
            };
            match role {
                Role::Value => match to_f64(cell) {
                    Some(value) => values.push((column.as_str(), value)),
                    None => {
                        warn!(column = %column, cell = %cell, "Dropping non-numeric value cell")
                    }
                },
                Role::Label => {
                    if let Some(label) = to_label(cell) {
                        labels.insert(column.clone(), label);
                    }
                }
                Role::Time => match parse_time(cell, &keys.time_format) {
                    Some(ts) => timestamp = Some(ts),
                    None => {
                        warn!(column = %column, cell = %cell, "Dropping row with unparseable time");
                        continue 'rows;
                    }
                },
            }
        }

        let timestamp = timestamp.unwrap_or(now) as f64;
        for (name, value) in values {
            let mut metric = labels.clone();
            metric.insert(METRIC_NAME_LABEL.to_string(), name.to_string());
            let key = fingerprint(&metric);
            let slot = *index.entry(key).or_insert_with(|| {
                series.push(MetricValues::new(metric));
                series.len() - 1
            });
            series[slot].values.push([timestamp, value]);
        }
    }

    for item in &mut series {
        item.values.sort_by(|a, b| a[0].total_cmp(&b[0]));
    }
    series
}
