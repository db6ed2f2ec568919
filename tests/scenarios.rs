mod common;

use common::{RecordingStore, fake_facade};
use dsbridge::adapters::mongodb::MongoSettings;
use dsbridge::adapters::mysql::MySqlSettings;
use dsbridge::adapters::tdengine::TdengineSettings;
use dsbridge::adapters::{Elasticsearch, MongoDb, MySql, Tdengine};
use dsbridge::cache::{InstanceCache, PutOutcome};
use dsbridge::datasource::{Datasource, DatasourceError, Plugin, describe_table};
use dsbridge::sql::{SqlDialect, needs_row_count_check};
use dsbridge::test_utils::{CountingDatasource, CountingSettings, FakeConn, init_count};
use serde_json::json;
use sqlparser::dialect::MySqlDialect;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn mysql(conn: Arc<FakeConn>) -> MySql {
    let settings: MySqlSettings = serde_json::from_value(json!({
        "mysql.shards": [{"addr": "db.test:3306", "user": "reader", "password": "pw"}]
    }))
    .unwrap();
    MySql::init(settings)
        .unwrap()
        .with_facade(fake_facade(SqlDialect::MySql, conn, 500))
}

#[tokio::test]
async fn s1_sql_rows_grouped_by_label() {
    let conn = Arc::new(FakeConn::new());
    conn.push_rows(vec![
        json!({"id": "a", "v": 1, "t": 1700000000}),
        json!({"id": "a", "v": 2, "t": 1700000060}),
        json!({"id": "b", "v": 5, "t": 1700000000}),
    ]);
    let ds = mysql(conn.clone());

    let series = ds
        .query_data(&json!({
            "sql": "select id, v, t from m limit 100",
            "keys": {"value": "v", "label": "id", "time": "t"},
            "from": 1700000000,
            "to": 1700000060,
        }))
        .await
        .unwrap();

    assert_eq!(series.len(), 2);
    assert_eq!(series[0].metric["__name__"], "v");
    assert_eq!(series[0].metric["id"], "a");
    assert_eq!(series[0].values, vec![[1700000000.0, 1.0], [1700000060.0, 2.0]]);
    assert_eq!(series[1].metric["id"], "b");
    assert_eq!(series[1].values, vec![[1700000000.0, 5.0]]);
    assert_eq!(conn.executed().len(), 1);
}

#[tokio::test]
async fn s2_es_date_histogram_count() {
    let server = MockServer::start().await;
    let host_bucket = |host: &str, count: i64| json!({"key": host, "doc_count": count});
    Mock::given(method("POST"))
        .and(path("/web-*/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": {"total": {"value": 14}, "hits": []},
            "aggregations": {"ts": {"buckets": [
                {"key": 1700000000000i64, "key_as_string": "1700000000000", "doc_count": 6,
                 "host": {"buckets": [host_bucket("web-1", 3), host_bucket("web-2", 3)]}},
                {"key": 1700000060000i64, "key_as_string": "1700000060000", "doc_count": 8,
                 "host": {"buckets": [host_bucket("web-1", 4), host_bucket("web-2", 4)]}},
            ]}}
        })))
        .mount(&server)
        .await;

    let settings =
        serde_json::from_value(json!({"es.nodes": [server.uri()], "es.version": "7.10"})).unwrap();
    let mut es = Elasticsearch::init(settings).unwrap();
    es.init_client().await.unwrap();

    let series = es
        .query_data(&json!({
            "index": "web-*",
            "value": {"func": "count"},
            "group_by": [{"cate": "terms", "field": "host"}],
            "interval": 60,
            "start": 1700000000,
            "end": 1700000060,
        }))
        .await
        .unwrap();

    assert_eq!(series.len(), 2);
    for (item, host) in series.iter().zip(["web-1", "web-2"]) {
        assert_eq!(item.labels, format!("host={}", host));
        assert_eq!(item.values, vec![[1700000000.0, 3.0], [1700000060.0, 4.0]]);
    }
}

#[tokio::test]
async fn s3_sql_safety() {
    let dialect = MySqlDialect {};
    assert!(!needs_row_count_check("SELECT COUNT(*) FROM t", 500, &dialect).needs_probe);
    assert!(needs_row_count_check("SELECT * FROM t LIMIT 1000", 500, &dialect).needs_probe);

    let conn = Arc::new(FakeConn::new());
    let err = mysql(conn.clone())
        .query_data(&json!({
            "sql": "INSERT INTO t VALUES(1)",
            "keys": {"value": "v"},
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, DatasourceError::OperationForbidden { .. }));
    assert!(conn.executed().is_empty());
}

#[tokio::test]
async fn s4_equal_put_initializes_once() {
    let cache = InstanceCache::new();
    let instance = || {
        let settings = CountingSettings {
            addr: "scenario-s4".to_string(),
            ..Default::default()
        };
        Box::new(CountingDatasource::init(settings).unwrap()) as Box<dyn Datasource>
    };

    assert_eq!(cache.put("mysql", 7, instance()).await, PutOutcome::Stored);
    assert_eq!(cache.put("mysql", 7, instance()).await, PutOutcome::Unchanged);
    assert_eq!(init_count("scenario-s4"), 1);
    assert!(cache.get("mysql", 7).is_some());
}

#[tokio::test]
async fn s5_tdengine_column_classification() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/sql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "column_meta": [["ts", 9], ["host", 10], ["v", 7]],
            "data": [[1700000000000i64, "h1", 1.5]],
            "rows": 1,
        })))
        .mount(&server)
        .await;

    let settings: TdengineSettings =
        serde_json::from_value(json!({"tdengine.addr": server.uri()})).unwrap();
    let mut td = Tdengine::init(settings).unwrap();
    td.init_client().await.unwrap();

    let series = td
        .query_data(&json!({
            "query": "select ts, host, v from db.m where ts >= $from",
            "from": 1700000000,
            "to": 1700000060,
            "keys": {"metricKey": "v", "labelKey": "host"},
        }))
        .await
        .unwrap();

    assert_eq!(series.len(), 1);
    assert_eq!(series[0].metric["__name__"], "v");
    assert_eq!(series[0].metric["host"], "h1");
    assert_eq!(series[0].values, vec![[1700000000.0, 1.5]]);
}

#[tokio::test]
async fn s6_mongo_pipeline() {
    let store = Arc::new(RecordingStore::with_rows(vec![json!({
        "_id": "6553f1a0c0ffee0000000001",
        "ts": 1700000000000i64,
        "count": 3,
    })]));
    let settings: MongoSettings = serde_json::from_value(json!({
        "mongodb.shards": [{"mongodb.uri": "mongodb://mongo.test:27017"}]
    }))
    .unwrap();
    let mongo = MongoDb::init(settings).unwrap().with_store(store.clone());

    let series = mongo
        .query_data(&json!({
            "collection": "events",
            "pipeline": [{"$match": {"level": "err"}}],
            "keys": {"value": "count", "time": "ts", "time_format": "epoch_millis"},
        }))
        .await
        .unwrap();

    assert_eq!(series.len(), 1);
    assert_eq!(series[0].metric.len(), 1);
    assert_eq!(series[0].metric["__name__"], "count");
    assert_eq!(series[0].values, vec![[1700000000.0, 3.0]]);
    assert_eq!(
        store.pipelines.lock().unwrap()[0],
        vec![json!({"$match": {"level": "err"}})]
    );
}

#[tokio::test]
async fn unsupported_capability_is_reported() {
    let settings: MongoSettings = serde_json::from_value(json!({})).unwrap();
    let mongo = MongoDb::init(settings).unwrap();
    let err = describe_table(&mongo, &json!({"table": "t"})).await.unwrap_err();
    assert!(matches!(err, DatasourceError::Unsupported));
    assert!(mongo.map_querier().is_none());
}
