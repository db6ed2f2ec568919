use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use tracing::debug;

use crate::datasource::{
    ColumnProperty, DataResp, Datasource, DatasourceError, DsResult, LogPage, Plugin,
    TableDescriber, decode_query, downcast, set_field,
};
use crate::tdengine::client::{TdengineClient, TdengineOptions};
use crate::tdengine::{TdengineQuery, to_rows, to_series};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TdengineBasicAuth {
    #[serde(default, rename = "tdengine.user")]
    pub user: String,
    #[serde(default, rename = "tdengine.password")]
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TdengineSettings {
    #[serde(default, rename = "tdengine.addr")]
    pub addr: String,
    /// Milliseconds
    #[serde(default, rename = "tdengine.timeout")]
    pub timeout: i64,
    /// Milliseconds
    #[serde(default, rename = "tdengine.dial_timeout")]
    pub dial_timeout: i64,
    #[serde(default, rename = "tdengine.max_idle_conns_per_host")]
    pub max_idle_conns_per_host: i64,
    #[serde(default, rename = "tdengine.headers")]
    pub headers: HashMap<String, String>,
    #[serde(default, rename = "tdengine.basic")]
    pub basic: Option<TdengineBasicAuth>,
    #[serde(default, rename = "tdengine.skip_tls_verify")]
    pub skip_tls_verify: bool,
    #[serde(default, rename = "tdengine.cluster_name")]
    pub cluster_name: String,
}

impl TdengineSettings {
    fn options(&self) -> TdengineOptions {
        let basic = self.basic.clone().unwrap_or_default();
        TdengineOptions {
            url: self.addr.trim().to_string(),
            user: basic.user,
            password: basic.password,
            headers: self.headers.clone(),
            timeout_ms: self.timeout.max(0) as u64,
            dial_timeout_ms: self.dial_timeout.max(0) as u64,
            max_idle_conns_per_host: self.max_idle_conns_per_host.max(0) as usize,
            skip_tls_verify: self.skip_tls_verify,
        }
    }
}

/// `{database, table}` of a describe request.
#[derive(Debug, Default, Deserialize)]
struct TableRef {
    #[serde(default)]
    database: String,
    #[serde(default)]
    table: String,
}

#[derive(Debug)]
pub struct Tdengine {
    settings: TdengineSettings,
    client: Option<TdengineClient>,
}

impl Tdengine {
    fn client(&self) -> DsResult<&TdengineClient> {
        self.client
            .as_ref()
            .ok_or_else(|| DatasourceError::config("tdengine client is not initialized"))
    }

    pub async fn show_databases(&self) -> DsResult<Vec<String>> {
        self.client()?.show_databases().await
    }

    pub async fn show_tables(&self, database: &str) -> DsResult<Vec<String>> {
        self.client()?.show_tables(database).await
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn make_query(mut query: Value, start: i64, end: i64) -> DsResult<Value> {
    set_field(&mut query, "from", Value::from(start))?;
    set_field(&mut query, "to", Value::from(end))?;
    Ok(query)
}

impl Plugin for Tdengine {
    const KIND: &'static str = "tdengine";
    type Settings = TdengineSettings;

    fn init(settings: TdengineSettings) -> DsResult<Self> {
        Ok(Self {
            settings,
            client: None,
        })
    }
}

#[async_trait]
impl Datasource for Tdengine {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn init_client(&mut self) -> DsResult<()> {
        self.client = Some(TdengineClient::new(&self.settings.options())?);
        Ok(())
    }

    fn validate(&self) -> DsResult<()> {
        if self.settings.addr.trim().is_empty() {
            return Err(DatasourceError::config(
                "tdengine addr is invalid, please check datasource setting",
            ));
        }
        Ok(())
    }

    /// Credentials only count when both sides carry them.
    fn equal(&self, other: &dyn Datasource) -> bool {
        let Some(other) = downcast::<Tdengine>(other) else {
            return false;
        };
        let (a, b) = (&self.settings, &other.settings);
        if let (Some(x), Some(y)) = (&a.basic, &b.basic) {
            if x != y {
                return false;
            }
        }
        a.addr == b.addr
            && a.timeout == b.timeout
            && a.dial_timeout == b.dial_timeout
            && a.max_idle_conns_per_host == b.max_idle_conns_per_host
            && a.headers == b.headers
    }

    fn make_ts_query(&self, query: Value, _: &[String], start: i64, end: i64) -> DsResult<Value> {
        make_query(query, start, end)
    }

    fn make_log_query(&self, query: Value, _: &[String], start: i64, end: i64) -> DsResult<Value> {
        make_query(query, start, end)
    }

    async fn query_data(&self, query: &Value) -> DsResult<Vec<DataResp>> {
        let query: TdengineQuery = decode_query(query)?;
        let sql = query.render(now());
        let response = self.client()?.query_table(&sql).await?;
        debug!(sql, rows = response.data.len(), "TDengine time-series query done");
        to_series(&response, &query.keys, &query.reference)
    }

    async fn query_log(&self, query: &Value) -> DsResult<LogPage> {
        let query: TdengineQuery = decode_query(query)?;
        let response = self.client()?.query_table(&query.render_log(now())).await?;
        Ok(LogPage::counted(
            to_rows(&response).into_iter().map(Value::Object).collect(),
        ))
    }

    fn table_describer(&self) -> Option<&dyn TableDescriber> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl TableDescriber for Tdengine {
    async fn describe_table(&self, query: &Value) -> DsResult<Vec<ColumnProperty>> {
        let table: TableRef = decode_query(query)?;
        if table.table.is_empty() {
            return Err(DatasourceError::query("table is required"));
        }
        self.client()?
            .describe_table(&table.database, &table.table)
            .await
    }
}
