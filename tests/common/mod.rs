#![allow(dead_code)]

use async_trait::async_trait;
use dsbridge::datasource::{DatasourceInfo, DsResult};
use dsbridge::format::Row;
use dsbridge::mongo::{DocumentStore, FindRequest};
use dsbridge::sql::{HandlePool, SqlDialect, SqlFacade, SqlShard};
use dsbridge::test_utils::{FakeConn, FakeConnector};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

/// Facade over `conn` with a private handle pool.
pub fn fake_facade(dialect: SqlDialect, conn: Arc<FakeConn>, max_query_rows: u64) -> SqlFacade {
    SqlFacade::with_pool(
        dialect,
        SqlShard {
            addr: "db.test:3306".to_string(),
            user: "reader".to_string(),
            max_query_rows,
            ..Default::default()
        },
        Arc::new(FakeConnector::new(conn)),
        Arc::new(HandlePool::new()),
    )
}

pub fn definition(value: Value) -> DatasourceInfo {
    serde_json::from_value(value).expect("valid definition")
}

pub fn counting_definition(id: i64, name: &str, kind: &str, addr: &str) -> DatasourceInfo {
    definition(json!({
        "id": id,
        "name": name,
        "plugin_type": kind,
        "settings": {"counting.addr": addr},
    }))
}

pub fn row(value: Value) -> Row {
    match value {
        Value::Object(row) => row,
        other => panic!("not a row: {}", other),
    }
}

/// Document store replaying fixed rows and recording the pipelines it was given.
#[derive(Debug, Default)]
pub struct RecordingStore {
    pub rows: Vec<Row>,
    pub pipelines: Mutex<Vec<Vec<Value>>>,
}

impl RecordingStore {
    pub fn with_rows(rows: Vec<Value>) -> Self {
        Self {
            rows: rows.into_iter().map(row).collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn ping(&self) -> DsResult<()> {
        Ok(())
    }

    async fn aggregate(&self, _: &str, _: &str, pipeline: Vec<Value>) -> DsResult<Vec<Row>> {
        self.pipelines.lock().unwrap().push(pipeline);
        Ok(self.rows.clone())
    }

    async fn find(&self, _: &str, _: &str, _: FindRequest) -> DsResult<Vec<Row>> {
        Ok(self.rows.clone())
    }
}
