//! In-memory fakes for unit and integration tests.
//!
//! Nothing here touches the network: SQL handles replay queued result sets,
//! and [`CountingDatasource`] records how often each address was initialized.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::datasource::{
    DataResp, Datasource, DatasourceError, DsResult, LogPage, Plugin, downcast,
};
use crate::format::Row;
use crate::sql::{ConnectionPool, SqlConn, SqlConnector, SqlShard};

/// SQL handle returning queued result sets in FIFO order, empty once drained.
#[derive(Debug, Default)]
pub struct FakeConn {
    results: Mutex<VecDeque<Vec<Row>>>,
    executed: Mutex<Vec<String>>,
}

impl FakeConn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one result set. Non-object values are skipped.
    pub fn push_rows(&self, rows: Vec<Value>) {
        let rows = rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(row) => Some(row),
                _ => None,
            })
            .collect();
        self.results.lock().unwrap().push_back(rows);
    }

    /// Statements seen so far, in execution order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SqlConn for FakeConn {
    async fn fetch_rows(&self, sql: &str) -> DsResult<Vec<Row>> {
        self.executed.lock().unwrap().push(sql.to_string());
        Ok(self.results.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// Connector handing out the same [`FakeConn`] for every open.
#[derive(Debug)]
pub struct FakeConnector {
    conn: Arc<FakeConn>,
    opened: AtomicUsize,
}

impl FakeConnector {
    pub fn new(conn: Arc<FakeConn>) -> Self {
        Self {
            conn,
            opened: AtomicUsize::new(0),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SqlConnector for FakeConnector {
    async fn open(&self, _: &SqlShard, _: &str) -> DsResult<Arc<dyn SqlConn>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.conn.clone())
    }
}

/// Pool that never keeps a handle, so every lookup opens a new one.
#[derive(Debug, Default)]
pub struct StubPool;

impl ConnectionPool for StubPool {
    fn load(&self, _: &str) -> Option<Arc<dyn SqlConn>> {
        None
    }

    fn load_or_store(&self, _: &str, conn: Arc<dyn SqlConn>) -> Arc<dyn SqlConn> {
        conn
    }
}

static INIT_COUNTS: Lazy<Mutex<HashMap<String, usize>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Number of `init_client` calls made for `addr` across all counting instances.
pub fn init_count(addr: &str) -> usize {
    INIT_COUNTS
        .lock()
        .unwrap()
        .get(addr)
        .copied()
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CountingSettings {
    #[serde(default, rename = "counting.addr")]
    pub addr: String,
    /// Sleep inside `init_client`, in milliseconds.
    #[serde(default, rename = "counting.delay_ms")]
    pub delay_ms: u64,
    #[serde(default, rename = "counting.fail")]
    pub fail: bool,
}

/// Datasource without a backend. Equality follows `counting.addr`;
/// tests use a unique address each to keep counts apart.
#[derive(Debug)]
pub struct CountingDatasource {
    settings: CountingSettings,
    ready: bool,
}

impl CountingDatasource {
    pub fn addr(&self) -> &str {
        &self.settings.addr
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

impl Plugin for CountingDatasource {
    const KIND: &'static str = "counting";
    type Settings = CountingSettings;

    fn init(settings: CountingSettings) -> DsResult<Self> {
        Ok(Self {
            settings,
            ready: false,
        })
    }
}

#[async_trait]
impl Datasource for CountingDatasource {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn init_client(&mut self) -> DsResult<()> {
        *INIT_COUNTS
            .lock()
            .unwrap()
            .entry(self.settings.addr.clone())
            .or_default() += 1;
        if self.settings.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.settings.delay_ms)).await;
        }
        if self.settings.fail {
            return Err(DatasourceError::transport(format!(
                "dial {}: connection refused",
                self.settings.addr
            )));
        }
        self.ready = true;
        Ok(())
    }

    fn validate(&self) -> DsResult<()> {
        if self.settings.addr.is_empty() {
            return Err(DatasourceError::config("counting addr is required"));
        }
        Ok(())
    }

    fn equal(&self, other: &dyn Datasource) -> bool {
        downcast::<CountingDatasource>(other).is_some_and(|other| other.settings == self.settings)
    }

    fn make_ts_query(&self, query: Value, _: &[String], _: i64, _: i64) -> DsResult<Value> {
        Ok(query)
    }

    fn make_log_query(&self, query: Value, _: &[String], _: i64, _: i64) -> DsResult<Value> {
        Ok(query)
    }

    async fn query_data(&self, _: &Value) -> DsResult<Vec<DataResp>> {
        Ok(Vec::new())
    }

    async fn query_log(&self, _: &Value) -> DsResult<LogPage> {
        Ok(LogPage::default())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
