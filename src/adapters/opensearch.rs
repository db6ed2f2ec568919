use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};

use super::es::{MIN_INTERVAL, check_nodes};
use super::search::{self, SearchDefaults};
use crate::datasource::{
    DataResp, Datasource, DatasourceError, DsResult, LogPage, MapDataQuerier, Plugin, downcast,
};
use crate::eslike::{self, DEFAULT_MAX_SHARD, Flavor, SearchClient, SearchTarget};

pub const DEFAULT_TIMEOUT_MS: i64 = 6_000;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OsBasicAuth {
    #[serde(default, rename = "os.auth.enable")]
    pub enable: bool,
    #[serde(default, rename = "os.user")]
    pub user: String,
    #[serde(default, rename = "os.password")]
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OsTls {
    #[serde(default, rename = "os.tls.skip_tls_verify")]
    pub skip_tls_verify: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OpenSearchSettings {
    #[serde(default, rename = "os.nodes")]
    pub nodes: Vec<String>,
    /// Milliseconds
    #[serde(default, rename = "os.timeout")]
    pub timeout: i64,
    #[serde(default, rename = "os.basic")]
    pub basic: OsBasicAuth,
    #[serde(default, rename = "os.tls")]
    pub tls: OsTls,
    #[serde(default, rename = "os.version")]
    pub version: String,
    #[serde(default, rename = "os.headers")]
    pub headers: HashMap<String, String>,
    #[serde(default, rename = "os.min_interval")]
    pub min_interval: i64,
    #[serde(default, rename = "os.max_shard")]
    pub max_shard: i64,
    #[serde(default, rename = "os.cluster_name")]
    pub cluster_name: String,
}

impl OpenSearchSettings {
    fn target(&self) -> SearchTarget {
        SearchTarget {
            nodes: self.nodes.clone(),
            user: self.basic.user.clone(),
            password: self.basic.password.clone(),
            headers: self.headers.clone(),
            skip_tls_verify: self.tls.skip_tls_verify,
            timeout_ms: self.timeout.max(0) as u64,
        }
    }
}

#[derive(Debug)]
pub struct OpenSearch {
    settings: OpenSearchSettings,
    client: Option<SearchClient>,
}

impl OpenSearch {
    fn defaults(&self) -> SearchDefaults {
        SearchDefaults {
            timeout_ms: self.settings.timeout,
            max_shard: self.settings.max_shard,
        }
    }

    fn client(&self) -> DsResult<&SearchClient> {
        search::client(&self.client, Self::KIND)
    }
}

impl Plugin for OpenSearch {
    const KIND: &'static str = "opensearch";
    type Settings = OpenSearchSettings;

    fn init(mut settings: OpenSearchSettings) -> DsResult<Self> {
        if settings.max_shard == 0 {
            settings.max_shard = DEFAULT_MAX_SHARD;
        }
        if settings.min_interval < MIN_INTERVAL {
            settings.min_interval = MIN_INTERVAL;
        }
        if settings.timeout == 0 {
            settings.timeout = DEFAULT_TIMEOUT_MS;
        }
        Ok(Self {
            settings,
            client: None,
        })
    }
}

#[async_trait]
impl Datasource for OpenSearch {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn init_client(&mut self) -> DsResult<()> {
        self.client = Some(SearchClient::new(self.settings.target())?);
        Ok(())
    }

    fn validate(&self) -> DsResult<()> {
        check_nodes(&self.settings.nodes)?;
        if !self.settings.basic.user.is_empty() && self.settings.basic.password.is_empty() {
            return Err(DatasourceError::config(
                "password is required when username is provided",
            ));
        }
        if !self.settings.version.starts_with('2') {
            return Err(DatasourceError::config("version must be 2.0+"));
        }
        Ok(())
    }

    fn equal(&self, other: &dyn Datasource) -> bool {
        let Some(other) = downcast::<OpenSearch>(other) else {
            return false;
        };
        let (a, b) = (&self.settings, &other.settings);
        a.target().sorted_nodes() == b.target().sorted_nodes()
            && a.basic.user == b.basic.user
            && a.basic.password == b.basic.password
            && a.tls == b.tls
            && a.timeout == b.timeout
            && a.headers == b.headers
    }

    fn make_ts_query(
        &self,
        query: Value,
        event_tags: &[String],
        start: i64,
        end: i64,
    ) -> DsResult<Value> {
        eslike::make_query(query, event_tags, start, end)
    }

    fn make_log_query(
        &self,
        query: Value,
        event_tags: &[String],
        start: i64,
        end: i64,
    ) -> DsResult<Value> {
        eslike::make_query(query, event_tags, start, end)
    }

    async fn query_data(&self, query: &Value) -> DsResult<Vec<DataResp>> {
        search::query_timeseries(
            self.client()?,
            Flavor::OpenSearch,
            self.defaults(),
            query,
            search::now(),
        )
        .await
    }

    async fn query_log(&self, query: &Value) -> DsResult<LogPage> {
        search::query_log(
            self.client()?,
            Flavor::OpenSearch,
            self.defaults(),
            query,
            search::now(),
        )
        .await
    }

    fn map_querier(&self) -> Option<&dyn MapDataQuerier> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl MapDataQuerier for OpenSearch {
    async fn query_map_data(&self, query: &Value) -> DsResult<Vec<BTreeMap<String, String>>> {
        search::query_map_data(
            self.client()?,
            Flavor::OpenSearch,
            self.defaults(),
            query,
            search::now(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn os(settings: Value) -> OpenSearch {
        OpenSearch::init(serde_json::from_value(settings).unwrap()).unwrap()
    }

    #[test]
    fn test_validate() {
        let ds = os(json!({"os.nodes": ["https://os:9200"], "os.version": "2.11"}));
        assert_eq!(ds.settings.timeout, 6_000);
        assert!(ds.validate().is_ok());

        let err = os(json!({"os.nodes": ["https://os:9200"], "os.version": "1.3"}))
            .validate()
            .unwrap_err();
        assert_eq!(err.to_string(), "version must be 2.0+");

        let err = os(json!({
            "os.nodes": ["https://os:9200"],
            "os.version": "2",
            "os.basic": {"os.user": "admin"},
        }))
        .validate()
        .unwrap_err();
        assert_eq!(err.to_string(), "password is required when username is provided");
    }

    #[test]
    fn test_equal_tracks_timeout() {
        let a = os(json!({"os.nodes": ["https://os:9200"], "os.version": "2"}));
        let b = os(json!({"os.nodes": ["https://os:9200"], "os.version": "2", "os.timeout": 1000}));
        assert!(a.equal(&os(json!({"os.nodes": ["https://os:9200"], "os.version": "2.5"}))));
        assert!(!a.equal(&b));
    }

    #[tokio::test]
    async fn test_histogram_uses_fixed_interval() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/metrics/_search"))
            .and(body_partial_json(json!({
                "aggs": {"ts": {"date_histogram": {"fixed_interval": "60s"}}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "aggregations": {"ts": {"buckets": []}}
            })))
            .mount(&server)
            .await;

        let mut ds = os(json!({"os.nodes": [server.uri()], "os.version": "2"}));
        ds.init_client().await.unwrap();
        let series = ds
            .query_data(&json!({"index": "metrics", "value": {"field": "v", "func": "avg"}}))
            .await
            .unwrap();
        assert!(series.is_empty());
    }
}
