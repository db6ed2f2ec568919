use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Reserved label carrying the metric name on every emitted series.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Column roles of a time-series query.
///
/// Each role holds space-separated column names. The aliases accept the
/// camel-case spellings used by dashboards and the TDengine `metricKey` form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Keys {
    #[serde(
        default,
        alias = "valueKey",
        alias = "value_key",
        alias = "metric",
        alias = "metricKey"
    )]
    pub value: String,
    #[serde(default, alias = "labelKey", alias = "label_key")]
    pub label: String,
    #[serde(default, alias = "timeKey", alias = "time_key")]
    pub time: String,
    #[serde(default, alias = "timeFormat")]
    pub time_format: String,
}

impl Keys {
    pub fn value_columns(&self) -> impl Iterator<Item = &str> {
        self.value.split_whitespace()
    }

    pub fn label_columns(&self) -> impl Iterator<Item = &str> {
        self.label.split_whitespace()
    }

    /// Time column, `time` when none was declared.
    pub fn time_column(&self) -> &str {
        let time = self.time.trim();
        if time.is_empty() { "time" } else { time }
    }
}

/// One series: its label set and `[timestamp_seconds, value]` points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValues {
    pub metric: BTreeMap<String, String>,
    pub values: Vec<[f64; 2]>,
}

impl MetricValues {
    pub fn new(metric: BTreeMap<String, String>) -> Self {
        Self {
            metric,
            values: Vec::new(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.metric.get(METRIC_NAME_LABEL).map(String::as_str)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.metric)
    }

    /// Labels without `__name__`, flattened as `k=v--k=v`.
    pub fn labels_string(&self) -> String {
        self.metric
            .iter()
            .filter(|(k, _)| k.as_str() != METRIC_NAME_LABEL)
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("--")
    }
}

/// MD5 over the sorted, comma-joined `k=v` pairs of a label set.
pub fn fingerprint(metric: &BTreeMap<String, String>) -> String {
    // BTreeMap iteration is already sorted by key
    let joined = metric
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");
    format!("{:x}", md5::compute(joined.as_bytes()))
}

/// Canonical series returned to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataResp {
    #[serde(rename = "ref")]
    pub reference: String,
    pub metric: BTreeMap<String, String>,
    pub labels: String,
    pub values: Vec<[f64; 2]>,
}

impl DataResp {
    pub fn from_series(reference: &str, series: MetricValues) -> Self {
        let labels = series.labels_string();
        DataResp {
            reference: reference.to_string(),
            metric: series.metric,
            labels,
            values: series.values,
        }
    }
}

/// Page of raw log rows and the total count reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogPage {
    pub rows: Vec<Value>,
    pub total: i64,
}

impl LogPage {
    pub fn counted(rows: Vec<Value>) -> Self {
        let total = rows.len() as i64;
        Self { rows, total }
    }
}

/// Column description returned by `DescribeTable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnProperty {
    pub field: String,
    #[serde(rename = "type")]
    pub column_type: String,
    pub type2: String,
    pub indexable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub skip_tls_verify: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub dial_timeout: i64,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub max_idle_conns_per_host: i64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default)]
    pub basic_auth: bool,
    #[serde(default)]
    pub basic_auth_user: String,
    #[serde(default)]
    pub basic_auth_password: String,
}

/// Datasource definition as stored by the metadata repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasourceInfo {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub plugin_id: i64,
    #[serde(alias = "type")]
    pub plugin_type: String,
    #[serde(default)]
    pub plugin_type_name: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub is_default: bool,
}

impl DatasourceInfo {
    pub fn is_enabled(&self) -> bool {
        self.status != "disabled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_aliases() {
        let keys: Keys = serde_json::from_value(json!({
            "valueKey": "v w",
            "labelKey": "host",
            "timeFormat": "%s",
        }))
        .unwrap();
        assert_eq!(keys.value_columns().collect::<Vec<_>>(), vec!["v", "w"]);
        assert_eq!(keys.label_columns().collect::<Vec<_>>(), vec!["host"]);
        assert_eq!(keys.time_column(), "time");
        assert_eq!(keys.time_format, "%s");

        let keys: Keys = serde_json::from_value(json!({"metric": "v", "label": "host"})).unwrap();
        assert_eq!(keys.value, "v");
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), "2".to_string());
        a.insert("a".to_string(), "1".to_string());
        let mut b = BTreeMap::new();
        b.insert("a".to_string(), "1".to_string());
        b.insert("b".to_string(), "2".to_string());
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(
            fingerprint(&a),
            format!("{:x}", md5::compute("a=1,b=2".as_bytes()))
        );
    }

    #[test]
    fn test_labels_string_skips_name() {
        let mut metric = BTreeMap::new();
        metric.insert(METRIC_NAME_LABEL.to_string(), "cpu".to_string());
        metric.insert("host".to_string(), "h1".to_string());
        metric.insert("dc".to_string(), "eu".to_string());
        let series = MetricValues::new(metric);
        assert_eq!(series.labels_string(), "dc=eu--host=h1");
        assert_eq!(series.name(), Some("cpu"));
    }

    #[test]
    fn test_definition_defaults() {
        let info: DatasourceInfo =
            serde_json::from_value(json!({"id": 3, "plugin_type": "mysql"})).unwrap();
        assert!(info.is_enabled());
        assert!(info.settings.is_empty());
        assert_eq!(info.http.timeout, 0);
    }
}
