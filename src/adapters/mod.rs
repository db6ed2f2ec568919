//! Backend adapters implementing the [`Datasource`](crate::datasource::Datasource) contract.

use crate::datasource::{DsResult, Registry};

pub mod ck;
pub mod doris;
pub mod es;
pub mod mongodb;
pub mod mysql;
pub mod opensearch;
pub mod pgsql;
pub mod search;
pub mod sqlbase;
pub mod tdengine;

pub use ck::ClickHouse;
pub use doris::Doris;
pub use es::Elasticsearch;
pub use mongodb::MongoDb;
pub use mysql::MySql;
pub use opensearch::OpenSearch;
pub use pgsql::Postgres;
pub use tdengine::Tdengine;

/// Registry with every builtin kind.
///
/// Kinds whose driver feature is disabled still register; their
/// `init_client` reports the missing feature.
pub fn builtin_registry() -> DsResult<Registry> {
    let mut registry = Registry::new();
    registry.register::<ClickHouse>()?;
    registry.register::<Doris>()?;
    registry.register::<Elasticsearch>()?;
    registry.register::<MongoDb>()?;
    registry.register::<MySql>()?;
    registry.register::<OpenSearch>()?;
    registry.register::<Postgres>()?;
    registry.register::<Tdengine>()?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds() {
        let registry = builtin_registry().unwrap();
        assert_eq!(
            registry.kinds(),
            vec!["ck", "doris", "es", "mongodb", "mysql", "opensearch", "pgsql", "tdengine"]
        );
    }
}
