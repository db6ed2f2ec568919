use super::{Datasource, DatasourceError, DsResult};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// A datasource adapter that can be materialized from its settings shape.
pub trait Plugin: Datasource + Sized + 'static {
    /// Registry kind, e.g. `ck` or `mysql`.
    const KIND: &'static str;

    /// Settings shape. Decoding fails on type mismatches, unknown keys are ignored.
    type Settings: DeserializeOwned;

    /// Builds an instance from decoded settings. Must not perform I/O.
    fn init(settings: Self::Settings) -> DsResult<Self>;
}

type BuildFn = fn(Value) -> DsResult<Box<dyn Datasource>>;

fn build<P: Plugin>(settings: Value) -> DsResult<Box<dyn Datasource>> {
    let settings: P::Settings = serde_json::from_value(settings)?;
    Ok(Box::new(P::init(settings)?))
}

/// Table from datasource kind to factory.
///
/// Filled once at startup, then shared read-only.
#[derive(Default)]
pub struct Registry {
    factories: HashMap<&'static str, BuildFn>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: Plugin>(&mut self) -> DsResult<()> {
        if self.factories.contains_key(P::KIND) {
            return Err(DatasourceError::DuplicateKind(P::KIND.to_string()));
        }
        self.factories.insert(P::KIND, build::<P>);
        Ok(())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Decodes `settings` into a fresh instance of `kind`.
    pub fn create(
        &self,
        kind: &str,
        settings: &Map<String, Value>,
    ) -> DsResult<Box<dyn Datasource>> {
        let build = self
            .factories
            .get(kind)
            .ok_or_else(|| DatasourceError::UnknownKind(kind.to_string()))?;
        build(Value::Object(settings.clone()))
    }
}

static GLOBAL_REGISTRY: OnceLock<Arc<Registry>> = OnceLock::new();

/// Installs the process-wide registry. Only the first call wins.
pub fn install(registry: Registry) -> Arc<Registry> {
    GLOBAL_REGISTRY.get_or_init(|| Arc::new(registry)).clone()
}

pub fn get() -> anyhow::Result<Arc<Registry>> {
    GLOBAL_REGISTRY.get().cloned().ok_or_else(|| {
        anyhow::Error::msg("Registry not installed. Please call registry::install() at startup")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::CountingDatasource;
    use serde_json::json;

    #[test]
    fn test_register_and_create() {
        let mut registry = Registry::new();
        registry.register::<CountingDatasource>().unwrap();
        assert!(registry.contains(CountingDatasource::KIND));

        let settings = json!({"counting.addr": "127.0.0.1:1"});
        let instance = registry
            .create(CountingDatasource::KIND, settings.as_object().unwrap())
            .unwrap();
        assert_eq!(instance.kind(), CountingDatasource::KIND);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = Registry::new();
        registry.register::<CountingDatasource>().unwrap();
        let err = registry.register::<CountingDatasource>().unwrap_err();
        assert!(matches!(err, DatasourceError::DuplicateKind(_)));
    }

    #[test]
    fn test_unknown_kind_and_bad_shape() {
        let mut registry = Registry::new();
        assert!(matches!(
            registry.create("nope", &Map::new()),
            Err(DatasourceError::UnknownKind(_))
        ));

        registry.register::<CountingDatasource>().unwrap();
        let settings = json!({"counting.addr": 42});
        assert!(matches!(
            registry.create(CountingDatasource::KIND, settings.as_object().unwrap()),
            Err(DatasourceError::Decode(_))
        ));
    }
}
