use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};

use super::search::{self, SearchDefaults};
use crate::datasource::{
    DataResp, Datasource, DatasourceError, DsResult, LogPage, MapDataQuerier, Plugin, downcast,
};
use crate::eslike::{self, DEFAULT_MAX_SHARD, Flavor, SearchClient, SearchTarget};

pub const DEFAULT_TIMEOUT_MS: i64 = 60_000;
pub const MIN_INTERVAL: i64 = 10;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EsBasicAuth {
    #[serde(default, rename = "es.auth.enable")]
    pub enable: bool,
    #[serde(default, rename = "es.user")]
    pub user: String,
    #[serde(default, rename = "es.password")]
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EsTls {
    #[serde(default, rename = "es.tls.skip_tls_verify")]
    pub skip_tls_verify: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EsSettings {
    #[serde(default, rename = "es.nodes")]
    pub nodes: Vec<String>,
    /// Milliseconds
    #[serde(default, rename = "es.timeout")]
    pub timeout: i64,
    #[serde(default, rename = "es.basic")]
    pub basic: EsBasicAuth,
    #[serde(default, rename = "es.tls")]
    pub tls: EsTls,
    #[serde(default, rename = "es.version")]
    pub version: String,
    #[serde(default, rename = "es.headers")]
    pub headers: HashMap<String, String>,
    /// Seconds
    #[serde(default, rename = "es.min_interval")]
    pub min_interval: i64,
    #[serde(default, rename = "es.max_shard")]
    pub max_shard: i64,
    #[serde(default, rename = "es.cluster_name")]
    pub cluster_name: String,
}

impl EsSettings {
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

/// Every node must parse as a URL.
pub(crate) fn check_nodes(nodes: &[String]) -> DsResult<()> {
    if nodes.is_empty() {
        return Err(DatasourceError::config("need a valid addr"));
    }
    for node in nodes {
        url::Url::parse(node)
            .map_err(|err| DatasourceError::config(format!("parse addr error: {}", err)))?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct Elasticsearch {
    settings: EsSettings,
    client: Option<SearchClient>,
}

impl Elasticsearch {
    pub fn settings(&self) -> &EsSettings {
        &self.settings
    }

    fn flavor(&self) -> Flavor {
        Flavor::for_es_version(&self.settings.version)
    }

    fn defaults(&self) -> SearchDefaults {
        SearchDefaults {
            timeout_ms: self.settings.timeout,
            max_shard: self.settings.max_shard,
        }
    }

    fn client(&self) -> DsResult<&SearchClient> {
        search::client(&self.client, Self::KIND)
    }

    /// Validates the settings and checks that a node answers.
    pub async fn test_connection(&self) -> DsResult<()> {
        self.validate()?;
        let client = match &self.client {
            Some(client) => client.clone(),
            None => SearchClient::new(self.settings.target())?,
        };
        client.ping().await.map(|_| ())
    }
}

impl Plugin for Elasticsearch {
    const KIND: &'static str = "es";
    type Settings = EsSettings;

    /// Fills the cluster-wide defaults.
    fn init(mut settings: EsSettings) -> DsResult<Self> {
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
impl Datasource for Elasticsearch {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn init_client(&mut self) -> DsResult<()> {
        self.client = Some(SearchClient::new(self.settings.target())?);
        Ok(())
    }

    fn validate(&self) -> DsResult<()> {
        check_nodes(&self.settings.nodes)?;
        let basic = &self.settings.basic;
        if basic.enable && (basic.user.is_empty() || basic.password.is_empty()) {
            return Err(DatasourceError::config("need a valid user, password"));
        }
        if !self.settings.version.starts_with('6') && !self.settings.version.starts_with('7') {
            return Err(DatasourceError::config("version must be 6.0+ or 7.0+"));
        }
        Ok(())
    }

    fn equal(&self, other: &dyn Datasource) -> bool {
        let Some(other) = downcast::<Elasticsearch>(other) else {
            return false;
        };
        let (a, b) = (&self.settings, &other.settings);
        a.target().sorted_nodes() == b.target().sorted_nodes()
            && a.basic.user == b.basic.user
            && a.basic.password == b.basic.password
            && a.tls == b.tls
            && a.headers == b.headers
            && a.timeout == b.timeout
            && a.version == b.version
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
            self.flavor(),
            self.defaults(),
            query,
            search::now(),
        )
        .await
    }

    async fn query_log(&self, query: &Value) -> DsResult<LogPage> {
        search::query_log(
            self.client()?,
            self.flavor(),
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
impl MapDataQuerier for Elasticsearch {
    async fn query_map_data(&self, query: &Value) -> DsResult<Vec<BTreeMap<String, String>>> {
        search::query_map_data(
            self.client()?,
            self.flavor(),
            self.defaults(),
            query,
            search::now(),
        )
        .await
    }
}
