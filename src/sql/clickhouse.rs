//! ClickHouse transports: the HTTP interface through the `clickhouse` client, or the
//! MySQL wire-protocol interface through sqlx. HTTPS without certificate checks goes
//! through reqwest.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::facade::{SqlConn, SqlConnector, SqlShard};
use crate::datasource::{DatasourceError, DsResult};
use crate::format::Row;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// Port of the ClickHouse MySQL wire-protocol interface.
pub const MYSQL_WIRE_PORT: u16 = 9004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickHouseTransport {
    Http,
    Https,
    /// Selected by `ck.protocol = "native"`.
    MysqlWire,
}

impl ClickHouseTransport {
    /// Parses the `ck.protocol` setting. Empty means "probe".
    pub fn from_protocol(protocol: &str) -> DsResult<Option<Self>> {
        match protocol.trim().to_lowercase().as_str() {
            "" => Ok(None),
            "http" => Ok(Some(ClickHouseTransport::Http)),
            "https" => Ok(Some(ClickHouseTransport::Https)),
            "native" => Ok(Some(ClickHouseTransport::MysqlWire)),
            other => Err(DatasourceError::config(format!(
                "unsupported clickhouse protocol: {}, only `http`, `https` or `native` allowed",
                other
            ))),
        }
    }
}

fn http_url(addr: &str, transport: ClickHouseTransport) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        return addr.trim_end_matches('/').to_string();
    }
    let scheme = match transport {
        ClickHouseTransport::Https => "https",
        _ => "http",
    };
    format!("{}://{}", scheme, addr.trim_end_matches('/'))
}

/// GETs the root of the HTTP interface, which answers `Ok.` on a healthy server.
pub async fn probe_http(addr: &str, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(_) => return false,
    };
    let response = match client
        .get(http_url(addr, ClickHouseTransport::Http))
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            debug!(addr, error = %err, "ClickHouse HTTP probe failed");
            return false;
        }
    };
    if response.status() != reqwest::StatusCode::OK {
        return false;
    }
    response
        .text()
        .await
        .map(|body| body.to_lowercase().contains("ok."))
        .unwrap_or(false)
}

/// Picks the transport: the configured one, else HTTP when the probe answers, else the
/// MySQL wire protocol.
pub async fn resolve_transport(protocol: &str, addr: &str) -> DsResult<ClickHouseTransport> {
    if let Some(transport) = ClickHouseTransport::from_protocol(protocol)? {
        return Ok(transport);
    }
    let transport = if probe_http(addr, PROBE_TIMEOUT).await {
        ClickHouseTransport::Http
    } else {
        ClickHouseTransport::MysqlWire
    };
    info!(addr, ?transport, "Resolved ClickHouse transport");
    Ok(transport)
}

#[derive(Debug, Clone)]
pub struct ClickHouseConnector {
    transport: ClickHouseTransport,
    skip_tls_verify: bool,
}

impl ClickHouseConnector {
    pub fn new(transport: ClickHouseTransport) -> Self {
        Self {
            transport,
            skip_tls_verify: false,
        }
    }

    /// Accept any server certificate on the HTTPS transport.
    pub fn skip_tls_verify(mut self, skip: bool) -> Self {
        self.skip_tls_verify = skip;
        self
    }

    pub fn transport(&self) -> ClickHouseTransport {
        self.transport
    }
}

#[async_trait]
impl SqlConnector for ClickHouseConnector {
    async fn open(&self, shard: &SqlShard, database: &str) -> DsResult<Arc<dyn SqlConn>> {
        match self.transport {
            ClickHouseTransport::Https if self.skip_tls_verify => Ok(Arc::new(
                UnverifiedHttpsConn::new(shard, database, self.transport)?,
            )),
            ClickHouseTransport::Http | ClickHouseTransport::Https => {
                open_http(shard, database, self.transport)
            }
            ClickHouseTransport::MysqlWire => open_mysql_wire(shard, database).await,
        }
    }
}

#[cfg(feature = "clickhouse")]
fn open_http(
    shard: &SqlShard,
    database: &str,
    transport: ClickHouseTransport,
) -> DsResult<Arc<dyn SqlConn>> {
    Ok(Arc::new(http::ClickHouseHttpConn::new(shard, database, transport)))
}

#[cfg(not(feature = "clickhouse"))]
fn open_http(_: &SqlShard, _: &str, _: ClickHouseTransport) -> DsResult<Arc<dyn SqlConn>> {
    Err(DatasourceError::config(
        "ClickHouse HTTP transport requires the `clickhouse` feature",
    ))
}

#[cfg(feature = "mysql")]
async fn open_mysql_wire(shard: &SqlShard, database: &str) -> DsResult<Arc<dyn SqlConn>> {
    let host = shard
        .addr
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    let shard = SqlShard {
        addr: host.to_string(),
        ..shard.clone()
    };
    super::mysql::MySqlConnector::new(MYSQL_WIRE_PORT)
        .open(&shard, database)
        .await
}

#[cfg(not(feature = "mysql"))]
async fn open_mysql_wire(_: &SqlShard, _: &str) -> DsResult<Arc<dyn SqlConn>> {
    Err(DatasourceError::config(
        "ClickHouse native transport requires the `mysql` feature",
    ))
}

/// HTTP interface over a reqwest client that skips certificate verification.
#[derive(Debug)]
pub struct UnverifiedHttpsConn {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
    params: Vec<(&'static str, String)>,
}

impl UnverifiedHttpsConn {
    pub fn new(shard: &SqlShard, database: &str, transport: ClickHouseTransport) -> DsResult<Self> {
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(shard.effective_timeout());
        if shard.max_idle_conns > 0 {
            builder = builder.pool_max_idle_per_host(shard.max_idle_conns as usize);
        }
        let mut params = vec![
            ("default_format", "JSONEachRow".to_string()),
            (
                "max_execution_time",
                shard.effective_timeout().as_secs().to_string(),
            ),
            ("output_format_json_quote_64bit_integers", "0".to_string()),
        ];
        if !database.is_empty() {
            params.push(("database", database.to_string()));
        }
        Ok(Self {
            client: builder.build()?,
            url: http_url(&shard.addr, transport),
            user: shard.user.clone(),
            password: shard.password.clone(),
            params,
        })
    }
}

#[async_trait]
impl SqlConn for UnverifiedHttpsConn {
    async fn fetch_rows(&self, sql: &str) -> DsResult<Vec<Row>> {
        let mut request = self
            .client
            .post(format!("{}/", self.url))
            .query(&self.params)
            .header("X-ClickHouse-User", &self.user)
            .body(sql.to_string());
        if !self.password.is_empty() {
            request = request.header("X-ClickHouse-Key", &self.password);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(DatasourceError::transport(format!(
                "clickhouse returned {}: {}",
                status,
                String::from_utf8_lossy(&body).trim()
            )));
        }
        parse_json_each_row(&body)
    }
}

fn parse_json_each_row(body: &[u8]) -> DsResult<Vec<Row>> {
    body.split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(|line| Ok(serde_json::from_slice::<Row>(line)?))
        .collect()
}

#[cfg(feature = "clickhouse")]
mod http {
    use async_trait::async_trait;
    use clickhouse::Client;

    use super::{ClickHouseTransport, http_url, parse_json_each_row};
    use crate::datasource::DsResult;
    use crate::format::Row;
    use crate::sql::facade::{SqlConn, SqlShard};

    pub struct ClickHouseHttpConn {
        client: Client,
    }

    impl std::fmt::Debug for ClickHouseHttpConn {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ClickHouseHttpConn")
                .field("client", &"<ClickHouse Client>")
                .finish()
        }
    }

    impl ClickHouseHttpConn {
        pub fn new(shard: &SqlShard, database: &str, transport: ClickHouseTransport) -> Self {
            let mut client = Client::default()
                .with_url(http_url(&shard.addr, transport))
                .with_user(&shard.user)
                .with_option(
                    "max_execution_time",
                    shard.effective_timeout().as_secs().to_string(),
                )
                // numbers stay numbers in JSONEachRow
                .with_option("output_format_json_quote_64bit_integers", "0");
            if !shard.password.is_empty() {
                client = client.with_password(&shard.password);
            }
            if !database.is_empty() {
                client = client.with_database(database);
            }
            Self { client }
        }
    }

    #[async_trait]
    impl SqlConn for ClickHouseHttpConn {
        async fn fetch_rows(&self, sql: &str) -> DsResult<Vec<Row>> {
            let mut cursor = self.client.query(sql).fetch_bytes("JSONEachRow")?;
            let mut body = Vec::new();
            while let Some(chunk) = cursor.next().await? {
                body.extend_from_slice(&chunk);
            }
            parse_json_each_row(&body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_protocol_parsing() {
        assert_eq!(ClickHouseTransport::from_protocol("").unwrap(), None);
        assert_eq!(
            ClickHouseTransport::from_protocol(" HTTPS ").unwrap(),
            Some(ClickHouseTransport::Https)
        );
        assert!(ClickHouseTransport::from_protocol("tcp").is_err());
    }

    #[test]
    fn test_http_url() {
        assert_eq!(
            http_url("ck:8123", ClickHouseTransport::Https),
            "https://ck:8123"
        );
        assert_eq!(
            http_url("http://ck:8123/", ClickHouseTransport::Https),
            "http://ck:8123"
        );
    }

    #[test]
    fn test_parse_json_each_row() {
        let body = b"{\"a\":1,\"b\":\"x\"}\n{\"a\":2,\"b\":\"y\"}\n\n";
        let rows = parse_json_each_row(body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["a"], 2);
    }

    #[tokio::test]
    async fn test_probe_selects_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Ok.\n"))
            .mount(&server)
            .await;
        let transport = resolve_transport("", &server.uri()).await.unwrap();
        assert_eq!(transport, ClickHouseTransport::Http);
    }

    #[tokio::test]
    async fn test_skip_tls_verify_posts_sql_over_reqwest() {
        use wiremock::matchers::{body_string, header, path, query_param};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(query_param("default_format", "JSONEachRow"))
            .and(query_param("database", "metrics"))
            .and(header("X-ClickHouse-User", "reader"))
            .and(header("X-ClickHouse-Key", "pw"))
            .and(body_string("SELECT v FROM t"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"v\":1}\n{\"v\":2}\n"))
            .mount(&server)
            .await;

        let shard = SqlShard {
            addr: server.uri(),
            user: "reader".to_string(),
            password: "pw".to_string(),
            max_idle_conns: 4,
            ..Default::default()
        };
        let conn = ClickHouseConnector::new(ClickHouseTransport::Https)
            .skip_tls_verify(true)
            .open(&shard, "metrics")
            .await
            .unwrap();
        let rows = conn.fetch_rows("SELECT v FROM t").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["v"], 2);
    }

    #[tokio::test]
    async fn test_unreachable_http_falls_back_to_mysql_wire() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;
        let transport = resolve_transport("", &server.uri()).await.unwrap();
        assert_eq!(transport, ClickHouseTransport::MysqlWire);

        let explicit = resolve_transport("native", &server.uri()).await.unwrap();
        assert_eq!(explicit, ClickHouseTransport::MysqlWire);
    }
}
