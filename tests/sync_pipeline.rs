mod common;

use common::{counting_definition, definition};
use dsbridge::adapters::{Elasticsearch, builtin_registry};
use dsbridge::cache::InstanceCache;
use dsbridge::sync::{StaticFetcher, SyncOptions, Synchronizer};
use dsbridge::test_utils::{CountingDatasource, init_count};
use serde_json::json;
use std::sync::Arc;

fn synchronizer(fetcher: Arc<StaticFetcher>) -> (Synchronizer, Arc<InstanceCache>) {
    let mut registry = builtin_registry().unwrap();
    registry.register::<CountingDatasource>().unwrap();
    let cache = Arc::new(InstanceCache::new());
    let sync = Synchronizer::new(
        Arc::new(registry),
        cache.clone(),
        fetcher,
        SyncOptions {
            evict_missing: true,
            ..Default::default()
        },
    );
    (sync, cache)
}

#[tokio::test]
async fn test_definitions_reach_the_cache() {
    let fetcher = Arc::new(StaticFetcher::new(vec![
        definition(json!({
            "id": 21,
            "name": "app-logs",
            "plugin_type": "elasticsearch.logging",
            "settings": {"version": "7.10", "max_shard": 3},
            "http": {"url": "http://es.test:9200", "timeout": 30000},
        })),
        definition(json!({
            "id": 22,
            "name": "es-without-version",
            "plugin_type": "elasticsearch",
            "http": {"url": "http://es.test:9200"},
        })),
        definition(json!({
            "id": 23,
            "name": "metrics",
            "plugin_type": "prometheus",
            "http": {"url": "http://prom.test:9090"},
        })),
        counting_definition(24, "counting", "counting", "pipeline-counting"),
    ]));
    let (sync, cache) = synchronizer(fetcher.clone());

    for task in sync.tick().await.unwrap() {
        task.await.unwrap();
    }

    assert_eq!(cache.ids("es"), vec![21]);
    assert!(cache.ids("prometheus").is_empty());
    let es = cache.get("es", 21).unwrap();
    let es = es.as_any().downcast_ref::<Elasticsearch>().unwrap();
    assert_eq!(es.settings().nodes, vec!["http://es.test:9200"]);
    assert_eq!(es.settings().max_shard, 3);
    assert_eq!(es.settings().timeout, 30000);
    assert_eq!(es.settings().cluster_name, "app-logs");

    fetcher.replace(vec![counting_definition(24, "counting", "counting", "pipeline-counting")]);
    for task in sync.tick().await.unwrap() {
        task.await.unwrap();
    }
    assert!(cache.get("es", 21).is_none());
    assert_eq!(cache.ids("counting"), vec![24]);
    assert_eq!(init_count("pipeline-counting"), 1);
}
