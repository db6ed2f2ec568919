use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::datasource::{DatasourceError, DsResult};

/// Hard cap on a `_search` response body.
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Connection-affecting fields of a search cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchTarget {
    pub nodes: Vec<String>,
    pub user: String,
    pub password: String,
    pub headers: HashMap<String, String>,
    pub skip_tls_verify: bool,
    /// Whole-request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl SearchTarget {
    /// Nodes sorted, for order-insensitive comparison.
    pub fn sorted_nodes(&self) -> Vec<String> {
        let mut nodes = self.nodes.clone();
        nodes.sort();
        nodes
    }
}

/// Minimal `_search` client over reqwest. Nodes are tried in order until one answers.
#[derive(Debug, Clone)]
pub struct SearchClient {
    http: reqwest::Client,
    target: SearchTarget,
}

impl SearchClient {
    pub fn new(target: SearchTarget) -> DsResult<Self> {
        if target.nodes.is_empty() {
            return Err(DatasourceError::config("nodes is empty"));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &target.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| {
                    DatasourceError::config(format!("invalid header {}: {}", name, err))
                })?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| DatasourceError::config(format!("invalid header value: {}", err)))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(target.skip_tls_verify);
        if target.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(target.timeout_ms));
        }

        Ok(Self {
            http: builder.build()?,
            target,
        })
    }

    pub fn target(&self) -> &SearchTarget {
        &self.target
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let request = self.http.request(method, url);
        if self.target.user.is_empty() {
            request
        } else {
            request.basic_auth(&self.target.user, Some(&self.target.password))
        }
    }

    /// GETs the cluster root of the first reachable node.
    pub async fn ping(&self) -> DsResult<Value> {
        let mut last_error = None;
        for node in &self.target.nodes {
            let url = node.trim_end_matches('/').to_string();
            match self.request(reqwest::Method::GET, url).send().await {
                Ok(response) => return read_json(response).await,
                Err(err) => {
                    debug!(node, error = %err, "Search node unreachable");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.map_or_else(|| DatasourceError::config("nodes is empty"), Into::into))
    }

    /// POSTs `body` to `{node}/{indices}/_search`.
    pub async fn search(
        &self,
        indices: &[String],
        body: &Value,
        timeout_seconds: i64,
        max_shard: i64,
    ) -> DsResult<Value> {
        if indices.is_empty() {
            return Err(DatasourceError::query("index is required"));
        }
        let path = indices.join(",");
        let mut params = vec![("ignore_unavailable", "true".to_string())];
        if timeout_seconds > 0 {
            params.push(("timeout", format!("{}s", timeout_seconds)));
        }
        if max_shard > 0 {
            params.push(("max_concurrent_shard_requests", max_shard.to_string()));
        }

        let mut last_error = None;
        for node in &self.target.nodes {
            let url = format!("{}/{}/_search", node.trim_end_matches('/'), path);
            let sent = self
                .request(reqwest::Method::POST, url)
                .query(&params)
                .json(body)
                .send()
                .await;
            match sent {
                Ok(response) => return read_json(response).await,
                Err(err) => {
                    warn!(node, error = %err, "Search request failed, trying next node");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.map_or_else(|| DatasourceError::config("nodes is empty"), Into::into))
    }
}

async fn read_json(mut response: reqwest::Response) -> DsResult<Value> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(DatasourceError::transport(format!(
            "search failed with status {}: {}",
            status, body
        )));
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(DatasourceError::transport("response body exceeds 10MB limit"));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{basic_auth, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target(server: &MockServer) -> SearchTarget {
        SearchTarget {
            nodes: vec![server.uri()],
            user: "elastic".to_string(),
            password: "secret".to_string(),
            headers: HashMap::from([("x-tenant".to_string(), "ops".to_string())]),
            timeout_ms: 5000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_search_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/logs-a,logs-b/_search"))
            .and(query_param("ignore_unavailable", "true"))
            .and(query_param("timeout", "30s"))
            .and(query_param("max_concurrent_shard_requests", "5"))
            .and(basic_auth("elastic", "secret"))
            .and(header("x-tenant", "ops"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hits": {"total": 0}})))
            .expect(1)
            .mount(&server)
            .await;

        let client = SearchClient::new(target(&server)).unwrap();
        let indices = vec!["logs-a".to_string(), "logs-b".to_string()];
        let response = client.search(&indices, &json!({"size": 0}), 30, 5).await.unwrap();
        assert_eq!(response["hits"]["total"], 0);
    }

    #[tokio::test]
    async fn test_error_status_is_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("parsing_exception"))
            .mount(&server)
            .await;

        let client = SearchClient::new(target(&server)).unwrap();
        let err = client
            .search(&["logs".to_string()], &json!({}), 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, DatasourceError::Transport(_)));
        assert!(err.to_string().contains("parsing_exception"));
    }

    #[tokio::test]
    async fn test_oversized_response_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(vec![b' '; MAX_RESPONSE_BYTES + 1]),
            )
            .mount(&server)
            .await;

        let client = SearchClient::new(target(&server)).unwrap();
        let err = client
            .search(&["logs".to_string()], &json!({}), 0, 0)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "transport failure: response body exceeds 10MB limit");
    }

    #[test]
    fn test_requires_nodes_and_valid_headers() {
        assert!(SearchClient::new(SearchTarget::default()).is_err());
        let bad = SearchTarget {
            nodes: vec!["http://localhost:9200".to_string()],
            headers: HashMap::from([("bad header".to_string(), "v".to_string())]),
            ..Default::default()
        };
        assert!(SearchClient::new(bad).is_err());
    }
}
