use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::any::Any;

use super::sqlbase::{self, SqlQueryParam, SqlShardSettings, first_shard};
use crate::datasource::{
    ColumnProperty, DataResp, Datasource, DatasourceError, DsResult, LogPage, Plugin,
    TableDescriber, decode_query, downcast,
};
use crate::sql::SqlFacade;

/// Database every connection opens before a query picks its own.
pub const BOOTSTRAP_DATABASE: &str = "postgres";

static QUALIFIED_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)from\s+("[^"]+"|[a-zA-Z0-9_]+)\.("[^"]+"|[a-zA-Z0-9_]+)\.("[^"]+"|[a-zA-Z0-9_]+)"#,
    )
    .unwrap()
});

fn unquote(part: &str) -> &str {
    part.trim_matches('"')
}

/// The database named by the first `from db.schema.table` reference.
pub fn parse_database(sql: &str) -> DsResult<String> {
    QUALIFIED_TABLE
        .captures(sql)
        .map(|caps| unquote(&caps[1]).to_string())
        .ok_or_else(|| {
            DatasourceError::query("no valid table name in format database.schema.table found")
        })
}

/// Rewrites every `from db.schema.table` to `from "db"."schema"."table"`.
pub fn quote_qualified_tables(sql: &str) -> String {
    QUALIFIED_TABLE
        .replace_all(sql, |caps: &regex::Captures| {
            format!(
                r#"from "{}"."{}"."{}""#,
                unquote(&caps[1]),
                unquote(&caps[2]),
                unquote(&caps[3])
            )
        })
        .into_owned()
}

/// Picks the query database: the explicit one, else the one referenced by the statement.
fn resolve_database(param: &mut SqlQueryParam) -> DsResult<()> {
    if param.database.is_empty() {
        param.database = parse_database(&param.sql)?;
    }
    param.sql = quote_qualified_tables(&param.sql);
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PostgresSettings {
    #[serde(default, rename = "pgsql.shards")]
    pub shards: Vec<SqlShardSettings>,
}

#[derive(Debug)]
pub struct Postgres {
    settings: PostgresSettings,
    facade: Option<SqlFacade>,
}

impl Postgres {
    pub fn with_facade(mut self, facade: SqlFacade) -> Self {
        self.facade = Some(facade);
        self
    }

    fn facade(&self) -> DsResult<&SqlFacade> {
        sqlbase::client(&self.facade, Self::KIND)
    }
}

impl Plugin for Postgres {
    const KIND: &'static str = "pgsql";
    type Settings = PostgresSettings;

    fn init(settings: PostgresSettings) -> DsResult<Self> {
        Ok(Self {
            settings,
            facade: None,
        })
    }
}

#[async_trait]
impl Datasource for Postgres {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn init_client(&mut self) -> DsResult<()> {
        let shard = first_shard(&self.settings.shards, Self::KIND)?.to_shard();
        let facade = open_facade(shard)?;
        facade.new_conn(BOOTSTRAP_DATABASE).await?;
        self.facade = Some(facade);
        Ok(())
    }

    fn validate(&self) -> DsResult<()> {
        first_shard(&self.settings.shards, Self::KIND)?.validate(Self::KIND)
    }

    fn equal(&self, other: &dyn Datasource) -> bool {
        let Some(other) = downcast::<Postgres>(other) else {
            return false;
        };
        match (self.settings.shards.first(), other.settings.shards.first()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn make_ts_query(&self, query: Value, _: &[String], start: i64, end: i64) -> DsResult<Value> {
        sqlbase::make_query(query, start, end)
    }

    fn make_log_query(&self, query: Value, _: &[String], start: i64, end: i64) -> DsResult<Value> {
        sqlbase::make_query(query, start, end)
    }

    async fn query_data(&self, query: &Value) -> DsResult<Vec<DataResp>> {
        let mut param: SqlQueryParam = decode_query(query)?;
        resolve_database(&mut param)?;
        sqlbase::query_timeseries(self.facade()?, param, sqlbase::now()).await
    }

    async fn query_log(&self, query: &Value) -> DsResult<LogPage> {
        let mut param: SqlQueryParam = decode_query(query)?;
        resolve_database(&mut param)?;
        sqlbase::query_log(self.facade()?, param, sqlbase::now()).await
    }

    fn table_describer(&self) -> Option<&dyn TableDescriber> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl TableDescriber for Postgres {
    /// `table` is `schema.table`; a bare name is looked up in `public`.
    async fn describe_table(&self, query: &Value) -> DsResult<Vec<ColumnProperty>> {
        sqlbase::describe_table(self.facade()?, query).await
    }
}

#[cfg(feature = "postgres")]
fn open_facade(shard: crate::sql::SqlShard) -> DsResult<SqlFacade> {
    Ok(SqlFacade::new(
        crate::sql::SqlDialect::Postgres,
        shard,
        std::sync::Arc::new(crate::sql::postgres::PostgresConnector),
    ))
}

#[cfg(not(feature = "postgres"))]
fn open_facade(_: crate::sql::SqlShard) -> DsResult<SqlFacade> {
    Err(DatasourceError::config(
        "pgsql datasource requires the `postgres` feature",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{HandlePool, SqlDialect, SqlShard};
    use crate::test_utils::{FakeConn, FakeConnector};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_parse_and_quote() {
        let sql = r#"SELECT v FROM metrics.public."cpu" WHERE x = 1"#;
        assert_eq!(parse_database(sql).unwrap(), "metrics");
        assert_eq!(
            quote_qualified_tables(sql),
            r#"SELECT v from "metrics"."public"."cpu" WHERE x = 1"#
        );
        let err = parse_database("select 1 from cpu").unwrap_err();
        assert_eq!(
            err.to_string(),
            "no valid table name in format database.schema.table found"
        );
    }

    #[tokio::test]
    async fn test_query_log_picks_database_from_sql() {
        let conn = Arc::new(FakeConn::new());
        conn.push_rows(vec![json!({"msg": "boot"})]);
        let connector = Arc::new(FakeConnector::new(conn.clone()));
        let facade = SqlFacade::with_pool(
            SqlDialect::Postgres,
            SqlShard {
                addr: "pg:5432".to_string(),
                max_query_rows: 500,
                ..Default::default()
            },
            connector.clone(),
            Arc::new(HandlePool::new()),
        );
        let pg = Postgres::init(PostgresSettings::default())
            .unwrap()
            .with_facade(facade);

        let page = pg
            .query_log(&json!({"sql": "select msg from logs.public.events limit 5"}))
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(connector.opened(), 1);
        assert!(conn.executed().last().unwrap().contains(r#"from "logs"."public"."events""#));
    }

    #[test]
    fn test_validate_needs_user() {
        let settings: PostgresSettings = serde_json::from_value(json!({
            "pgsql.shards": [{"addr": "pg:5432"}]
        }))
        .unwrap();
        let err = Postgres::init(settings).unwrap().validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "pgsql user is invalid, please check datasource setting"
        );
    }
}
