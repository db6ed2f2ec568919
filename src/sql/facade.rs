use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use super::analyzer::{needs_row_count_check, probe_sql};
use super::dialect::SqlDialect;
use crate::datasource::{ColumnProperty, DatasourceError, DsResult, Keys, MetricValues};
use crate::format::{Row, format_metric_values, to_f64, to_label};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_QUERY_ROWS: u64 = 500;
/// sqlx pool size when `max_open_conns` is unset.
pub const DEFAULT_MAX_OPEN_CONNS: u32 = 10;

static QUERY_DEFAULTS: OnceLock<(Duration, u64)> = OnceLock::new();

/// Replaces the built-in timeout and row cap applied to shards that leave
/// them unset. Only the first call wins; returns whether this one did.
pub fn install_query_defaults(timeout: Duration, max_query_rows: u64) -> bool {
    QUERY_DEFAULTS.set((timeout, max_query_rows)).is_ok()
}

pub fn default_timeout() -> Duration {
    QUERY_DEFAULTS.get().map_or(DEFAULT_TIMEOUT, |(timeout, _)| *timeout)
}

pub fn default_max_query_rows() -> u64 {
    QUERY_DEFAULTS
        .get()
        .map_or(DEFAULT_MAX_QUERY_ROWS, |(_, rows)| *rows)
}

/// An open driver handle able to run one statement and return its rows.
#[async_trait]
pub trait SqlConn: Send + Sync + Debug {
    async fn fetch_rows(&self, sql: &str) -> DsResult<Vec<Row>>;
}

/// Opens driver handles for a shard.
#[async_trait]
pub trait SqlConnector: Send + Sync + Debug {
    async fn open(&self, shard: &SqlShard, database: &str) -> DsResult<Arc<dyn SqlConn>>;
}

/// Keyed store of open handles, shared between facades.
pub trait ConnectionPool: Send + Sync + Debug {
    fn load(&self, key: &str) -> Option<Arc<dyn SqlConn>>;

    /// Stores `conn` unless another handle won the race, returning whichever is kept.
    fn load_or_store(&self, key: &str, conn: Arc<dyn SqlConn>) -> Arc<dyn SqlConn>;
}

/// Pool key of a handle: `addr|user|pw|db`.
pub fn conn_key(addr: &str, user: &str, password: &str, database: &str) -> String {
    format!("{}|{}|{}|{}", addr, user, password, database)
}

#[derive(Debug, Default)]
pub struct HandlePool {
    handles: RwLock<HashMap<String, Arc<dyn SqlConn>>>,
}

impl HandlePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handles.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConnectionPool for HandlePool {
    fn load(&self, key: &str) -> Option<Arc<dyn SqlConn>> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn load_or_store(&self, key: &str, conn: Arc<dyn SqlConn>) -> Arc<dyn SqlConn> {
        let mut handles = self.handles.write().unwrap_or_else(|e| e.into_inner());
        handles.entry(key.to_string()).or_insert(conn).clone()
    }
}

static SHARED_POOL: Lazy<Arc<HandlePool>> = Lazy::new(|| Arc::new(HandlePool::new()));

/// Process-wide handle pool used when no pool is injected.
pub fn shared_pool() -> Arc<dyn ConnectionPool> {
    SHARED_POOL.clone()
}

/// One SQL endpoint with its credentials and pool limits.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SqlShard {
    pub addr: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub timeout: Duration,
    pub max_query_rows: u64,
    pub max_idle_conns: u32,
    pub max_open_conns: u32,
    pub conn_max_lifetime: Duration,
}

impl SqlShard {
    /// Connections the pool keeps open while idle, capped by `max_open_conns`.
    pub fn retained_idle_conns(&self) -> Option<u32> {
        match (self.max_idle_conns, self.max_open_conns) {
            (0, _) => None,
            (idle, 0) => Some(idle.min(DEFAULT_MAX_OPEN_CONNS)),
            (idle, open) => Some(idle.min(open)),
        }
    }

    pub fn effective_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            default_timeout()
        } else {
            self.timeout
        }
    }
}

/// Read-only query surface over one shard of a SQL backend.
#[derive(Debug, Clone)]
pub struct SqlFacade {
    dialect: SqlDialect,
    shard: SqlShard,
    connector: Arc<dyn SqlConnector>,
    pool: Arc<dyn ConnectionPool>,
}

impl SqlFacade {
    pub fn new(dialect: SqlDialect, shard: SqlShard, connector: Arc<dyn SqlConnector>) -> Self {
        Self::with_pool(dialect, shard, connector, shared_pool())
    }

    pub fn with_pool(
        dialect: SqlDialect,
        shard: SqlShard,
        connector: Arc<dyn SqlConnector>,
        pool: Arc<dyn ConnectionPool>,
    ) -> Self {
        Self {
            dialect,
            shard,
            connector,
            pool,
        }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub fn shard(&self) -> &SqlShard {
        &self.shard
    }

    /// Returns the pooled handle for `database`, opening one on a miss.
    ///
    /// An empty `database` falls back to the shard default.
    pub async fn new_conn(&self, database: &str) -> DsResult<Arc<dyn SqlConn>> {
        let database = if database.is_empty() {
            self.shard.database.as_str()
        } else {
            database
        };
        let key = conn_key(
            &self.shard.addr,
            &self.shard.user,
            &self.shard.password,
            database,
        );
        if let Some(conn) = self.pool.load(&key) {
            return Ok(conn);
        }

        let timeout = self.shard.effective_timeout();
        let conn = tokio::time::timeout(timeout, self.connector.open(&self.shard, database))
            .await
            .map_err(|_| DatasourceError::timeout("connect", timeout.as_secs()))??;
        debug!(
            dialect = self.dialect.name(),
            addr = %self.shard.addr,
            database,
            "Opened SQL handle"
        );
        Ok(self.pool.load_or_store(&key, conn))
    }

    /// Rejects statements carrying a banned keyword token.
    pub fn check_banned(&self, sql: &str) -> DsResult<()> {
        let banned = self.dialect.banned_ops();
        let upper = sql.to_uppercase();
        match upper.split_whitespace().find(|token| banned.contains(token)) {
            Some(op) => Err(DatasourceError::forbidden(op)),
            None => Ok(()),
        }
    }

    async fn exec(&self, conn: &dyn SqlConn, sql: &str) -> DsResult<Vec<Row>> {
        let timeout = self.shard.effective_timeout();
        match tokio::time::timeout(timeout, conn.fetch_rows(sql)).await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(err)) => {
                warn!(dialect = self.dialect.name(), sql, error = %err, "SQL query failed");
                Err(err)
            }
            Err(_) => Err(DatasourceError::timeout("query", timeout.as_secs())),
        }
    }

    /// Runs `sql` unguarded. Callers must have checked it.
    pub async fn exec_query(&self, database: &str, sql: &str) -> DsResult<Vec<Row>> {
        let conn = self.new_conn(database).await?;
        self.exec(conn.as_ref(), sql).await
    }

    /// Runs a user statement after the banned-keyword check and the row-count probe.
    pub async fn query(&self, database: &str, sql: &str) -> DsResult<Vec<Row>> {
        self.check_banned(sql)?;
        let conn = self.new_conn(database).await?;

        let max_rows = self.shard.max_query_rows;
        if max_rows > 0 {
            // the parser dialect is not Send and must not live across an await
            let decision = {
                let parser = self.dialect.parser_dialect();
                needs_row_count_check(sql, max_rows, parser.as_ref())
            };
            if decision.direct_reject {
                return Err(DatasourceError::query(decision.reason));
            }
            if decision.needs_probe {
                let rows = self.exec(conn.as_ref(), &probe_sql(sql)).await?;
                let count = rows
                    .first()
                    .and_then(|row| row.get("count"))
                    .and_then(to_f64)
                    .unwrap_or(0.0) as u64;
                if count > max_rows {
                    return Err(DatasourceError::RowLimitExceeded {
                        count,
                        max: max_rows,
                    });
                }
            }
        }

        self.exec(conn.as_ref(), sql).await
    }

    pub async fn query_timeseries(
        &self,
        database: &str,
        sql: &str,
        keys: &Keys,
        ignore_undeclared: bool,
    ) -> DsResult<Vec<MetricValues>> {
        let rows = self.query(database, sql).await?;
        Ok(format_metric_values(keys, &rows, ignore_undeclared))
    }

    pub async fn show_databases(&self) -> DsResult<Vec<String>> {
        let rows = self
            .exec_query("", self.dialect.show_databases_sql())
            .await?;
        Ok(first_column(&rows))
    }

    pub async fn show_tables(&self, database: &str) -> DsResult<Vec<String>> {
        let rows = self
            .exec_query(database, &self.dialect.show_tables_sql(database))
            .await?;
        Ok(first_column(&rows))
    }

    pub async fn desc_table(&self, database: &str, table: &str) -> DsResult<Vec<ColumnProperty>> {
        let rows = self
            .exec_query(database, &self.dialect.desc_table_sql(database, table))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let field = pick(row, &["Field", "field", "column_name", "name"])?;
                let column_type = pick(row, &["Type", "type", "data_type"])?;
                let (type2, indexable) = self.dialect.column_type(&column_type);
                Some(ColumnProperty {
                    field,
                    column_type,
                    type2,
                    indexable,
                })
            })
            .collect())
    }

    pub async fn select_rows(
        &self,
        database: &str,
        table: &str,
        filter: &str,
    ) -> DsResult<Vec<Row>> {
        let sql = self.dialect.select_rows_sql(database, table, filter);
        self.query(database, &sql).await
    }
}

fn pick(row: &Row, columns: &[&str]) -> Option<String> {
    columns
        .iter()
        .find_map(|column| row.get(*column))
        .and_then(to_label)
}

fn first_column(rows: &[Row]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.values().next().and_then(to_label))
        .collect()
}
