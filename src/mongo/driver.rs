use async_trait::async_trait;
use bson::{Bson, Document, doc};
use futures::TryStreamExt;
use mongodb::Client;
use mongodb::options::{ClientOptions, Credential, Tls, TlsOptions};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::RwLock;
use tracing::info;

use super::{DocumentStore, FindRequest, MongoShard, normalize_rows};
use crate::datasource::{DatasourceError, DsResult};
use crate::format::Row;

static CLIENTS: Lazy<RwLock<HashMap<String, Client>>> = Lazy::new(|| RwLock::new(HashMap::new()));

fn to_document(value: Value) -> DsResult<Document> {
    match Bson::try_from(value) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(other) => Err(DatasourceError::query(format!(
            "expected a document, got {}",
            other
        ))),
        Err(err) => Err(DatasourceError::query(format!("invalid extended JSON: {}", err))),
    }
}

/// Dates become epoch milliseconds and ObjectIds their hex string, so both
/// reach the formatter as plain time and label cells.
fn to_json(value: Bson) -> Value {
    match value {
        Bson::DateTime(datetime) => Value::from(datetime.timestamp_millis()),
        Bson::ObjectId(id) => Value::from(id.to_hex()),
        Bson::Document(document) => Value::Object(to_row(document)),
        Bson::Array(items) => Value::Array(items.into_iter().map(to_json).collect()),
        other => other.into_relaxed_extjson(),
    }
}

fn to_row(document: Document) -> Row {
    document
        .into_iter()
        .map(|(key, value)| (key, to_json(value)))
        .collect()
}

/// Driver-backed store for the first shard of a datasource.
#[derive(Debug, Clone)]
pub struct MongoStore {
    shard: MongoShard,
    client: Client,
}

impl MongoStore {
    /// Returns the pooled client for the shard's key, connecting and pinging on a miss.
    pub async fn connect(shard: &MongoShard) -> DsResult<Self> {
        let key = shard.client_key()?;
        if let Some(client) = CLIENTS.read().await.get(&key) {
            return Ok(Self {
                shard: shard.clone(),
                client: client.clone(),
            });
        }

        let timeout = shard.effective_timeout();
        let client = tokio::time::timeout(timeout, open_client(shard))
            .await
            .map_err(|_| DatasourceError::timeout("mongodb connect", timeout.as_secs()))??;

        let client = CLIENTS.write().await.entry(key).or_insert(client).clone();
        Ok(Self {
            shard: shard.clone(),
            client,
        })
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        future: impl Future<Output = DsResult<T>>,
    ) -> DsResult<T> {
        let timeout = self.shard.effective_timeout();
        tokio::time::timeout(timeout, future)
            .await
            .map_err(|_| DatasourceError::timeout(operation, timeout.as_secs()))?
    }

    fn database_name<'a>(&'a self, database: &'a str) -> DsResult<&'a str> {
        let database = if database.is_empty() {
            self.shard.database.as_str()
        } else {
            database
        };
        if database.is_empty() {
            return Err(DatasourceError::query("empty mongodb database"));
        }
        Ok(database)
    }
}

async fn open_client(shard: &MongoShard) -> DsResult<Client> {
    let uri = shard.connection_uri()?;
    let mut options = ClientOptions::parse(&uri).await?;
    if !shard.user.is_empty() {
        let mut credential = Credential::builder()
            .username(shard.user.clone())
            .password(shard.password.clone())
            .build();
        if !shard.auth_source.is_empty() {
            credential.source = Some(shard.auth_source.clone());
        }
        options.credential = Some(credential);
    }
    if !shard.replica_set.is_empty() {
        options.repl_set_name = Some(shard.replica_set.clone());
    }
    if shard.max_pool_size > 0 {
        options.max_pool_size = Some(shard.max_pool_size);
    }
    if shard.tls_enable {
        let mut tls = TlsOptions::default();
        tls.allow_invalid_certificates = Some(shard.tls_skip_verify);
        options.tls = Some(Tls::Enabled(tls));
    }
    for (key, value) in &shard.params {
        match key.to_lowercase().as_str() {
            "appname" => options.app_name = Some(value.clone()),
            "direct" if value.eq_ignore_ascii_case("true") => {
                options.direct_connection = Some(true)
            }
            _ => {}
        }
    }
    options.connect_timeout = Some(shard.effective_timeout());
    options.server_selection_timeout = Some(shard.effective_timeout());

    let client = Client::with_options(options)?;
    client
        .database("admin")
        .run_command(doc! {"ping": 1})
        .await?;
    info!(uri = %uri, "Connected to MongoDB");
    Ok(client)
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn ping(&self) -> DsResult<()> {
        self.bounded("mongodb ping", async {
            self.client
                .database("admin")
                .run_command(doc! {"ping": 1})
                .await?;
            Ok(())
        })
        .await
    }

    async fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: Vec<Value>,
    ) -> DsResult<Vec<Row>> {
        let database = self.database_name(database)?;
        let pipeline = pipeline
            .into_iter()
            .map(to_document)
            .collect::<DsResult<Vec<_>>>()?;
        self.bounded("mongodb aggregate", async {
            let cursor = self
                .client
                .database(database)
                .collection::<Document>(collection)
                .aggregate(pipeline)
                .await?;
            let documents: Vec<Document> = cursor.try_collect().await?;
            Ok(normalize_rows(documents.into_iter().map(to_row).collect()))
        })
        .await
    }

    async fn find(
        &self,
        database: &str,
        collection: &str,
        request: FindRequest,
    ) -> DsResult<Vec<Row>> {
        let database = self.database_name(database)?;
        let filter = to_document(Value::Object(request.filter))?;
        let sort = request.sort.map(to_document).transpose()?;
        let projection = request.projection.map(to_document).transpose()?;
        self.bounded("mongodb find", async {
            let collection = self
                .client
                .database(database)
                .collection::<Document>(collection);
            let mut find = collection.find(filter);
            if let Some(sort) = sort {
                find = find.sort(sort);
            }
            if let Some(projection) = projection {
                find = find.projection(projection);
            }
            if let Some(limit) = request.limit {
                find = find.limit(limit);
            }
            if let Some(skip) = request.skip {
                find = find.skip(skip);
            }
            let documents: Vec<Document> = find.await?.try_collect().await?;
            Ok(normalize_rows(documents.into_iter().map(to_row).collect()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extended_json_dates_become_bson_dates() {
        let document = to_document(json!({
            "ts": {"$gte": {"$date": {"$numberLong": "1700000000000"}}}
        }))
        .unwrap();
        let range = document.get_document("ts").unwrap();
        assert!(matches!(range.get("$gte"), Some(Bson::DateTime(_))));
        assert!(to_document(json!([1, 2])).is_err());
    }

    #[test]
    fn test_dates_and_object_ids_become_plain_cells() {
        use crate::datasource::Keys;
        use crate::format::format_metric_values;
        use bson::DateTime;
        use bson::oid::ObjectId;

        let id = ObjectId::parse_str("6553f1a0c0ffee0000000001").unwrap();
        let row = to_row(doc! {
            "_id": id,
            "ts": DateTime::from_millis(1_700_000_000_000),
            "count": 3_i32,
            "nested": {"at": DateTime::from_millis(1_000)},
        });
        assert_eq!(row["_id"], "6553f1a0c0ffee0000000001");
        assert_eq!(row["ts"], 1_700_000_000_000_i64);
        assert_eq!(row["nested"]["at"], 1_000);

        let keys = Keys {
            value: "count".to_string(),
            time: "ts".to_string(),
            ..Default::default()
        };
        let series = format_metric_values(&keys, &normalize_rows(vec![row]), true);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].values, vec![[1_700_000_000.0, 3.0]]);
    }

    #[test]
    fn test_rows_use_relaxed_json() {
        let row = to_row(doc! {"count": 3_i32, "avg": 1.5, "host": "h1"});
        assert_eq!(row["count"], 3);
        assert_eq!(row["avg"], 1.5);
        assert_eq!(row["host"], "h1");
    }
}
