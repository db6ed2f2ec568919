use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use crate::datasource::DatasourceInfo;

/// Source of the full datasource definition list, polled every tick.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self) -> Result<Vec<DatasourceInfo>>;
}

/// Fixed in-memory list, replaceable between ticks.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    items: RwLock<Vec<DatasourceInfo>>,
}

impl StaticFetcher {
    pub fn new(items: Vec<DatasourceInfo>) -> Self {
        Self {
            items: RwLock::new(items),
        }
    }

    pub fn replace(&self, items: Vec<DatasourceInfo>) {
        *self.items.write().unwrap_or_else(|e| e.into_inner()) = items;
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self) -> Result<Vec<DatasourceInfo>> {
        Ok(self.items.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

/// Definitions from a JSON file, re-read on every fetch.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    path: PathBuf,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self) -> Result<Vec<DatasourceInfo>> {
        let content = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let body: Value = serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        parse_items(body)
    }
}

/// Metadata API: `POST` with an optional bearer token.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpFetcher {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self) -> Result<Vec<DatasourceInfo>> {
        let mut request = self.client.post(&self.url).json(&serde_json::json!({}));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("Metadata API {} answered {}", self.url, status);
        }
        let body: Value = response
            .json()
            .await
            .context("Failed to decode metadata API response")?;
        parse_items(body)
    }
}

/// Accepts `{"data": {"items": [...]}}` or a bare array.
fn parse_items(body: Value) -> Result<Vec<DatasourceInfo>> {
    let items = match body {
        Value::Array(_) => body,
        mut other => match other.pointer_mut("/data/items") {
            Some(items) => items.take(),
            None => bail!("Expected a definition array or data.items"),
        },
    };
    serde_json::from_value(items).context("Failed to decode datasource definitions")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_items_shapes() {
        let wrapped = json!({
            "request_id": "r",
            "data": {"items": [{"id": 1, "plugin_type": "mysql"}]},
        });
        assert_eq!(parse_items(wrapped).unwrap()[0].id, 1);
        let bare = json!([{"id": 2, "type": "ck"}]);
        assert_eq!(parse_items(bare).unwrap()[0].plugin_type, "ck");
        assert!(parse_items(json!({"data": "encrypted"})).is_err());
    }

    #[tokio::test]
    async fn test_file_fetcher() {
        let path = std::env::temp_dir().join(format!("dsbridge-defs-{}.json", std::process::id()));
        tokio::fs::write(&path, r#"[{"id": 9, "name": "db", "plugin_type": "mysql"}]"#)
            .await
            .unwrap();
        let items = FileFetcher::new(&path).fetch().await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();
        assert_eq!(items[0].name, "db");
        assert!(FileFetcher::new("/nonexistent/defs.json").fetch().await.is_err());
    }

    #[tokio::test]
    async fn test_http_fetcher_sends_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/datasources"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"items": [{"id": 5, "name": "es", "plugin_type": "elasticsearch"}]}
            })))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(
            format!("{}/v1/datasources", server.uri()),
            Some("secret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        let items = fetcher.fetch().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].plugin_type, "elasticsearch");

        let url = format!("{}/v1/datasources", server.uri());
        let anonymous = HttpFetcher::new(url, None, Duration::from_secs(5)).unwrap();
        assert!(anonymous.fetch().await.is_err());
    }
}
