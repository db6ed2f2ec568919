use anyhow::{Context, Error};
use confique::Config;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::sync::{Fetcher, FileFetcher, HttpFetcher, StaticFetcher, SyncOptions};

#[derive(Debug, Config)]
pub struct DsBridgeConfig {
    #[config(env = "DSBRIDGE_SYNC_INTERVAL_MS", default = 2000)]
    pub sync_interval_ms: u64,

    #[config(env = "DSBRIDGE_MAX_CONCURRENT_INITS", default = 8)]
    pub max_concurrent_inits: usize,

    #[config(env = "DSBRIDGE_EVICT_MISSING", default = false)]
    pub evict_missing: bool,

    /// JSON array of datasource definitions.
    #[config(env = "DSBRIDGE_DEFINITIONS_FILE")]
    pub definitions_file: Option<PathBuf>,

    /// Metadata API answering `POST` with the definition list. Wins over the file.
    #[config(env = "DSBRIDGE_DEFINITIONS_URL")]
    pub definitions_url: Option<String>,

    #[config(env = "DSBRIDGE_DEFINITIONS_TOKEN")]
    pub definitions_token: Option<String>,

    #[config(env = "DSBRIDGE_DEFAULT_QUERY_TIMEOUT_SECONDS", default = 60)]
    pub default_query_timeout_seconds: u64,

    #[config(env = "DSBRIDGE_DEFAULT_MAX_QUERY_ROWS", default = 500)]
    pub default_max_query_rows: u64,

    #[config(env = "DSBRIDGE_SENTRY_DSN")]
    pub sentry_dsn: Option<String>,
}

impl DsBridgeConfig {
    pub fn load() -> Result<DsBridgeConfig, Error> {
        let c = DsBridgeConfig::builder()
            .env()
            .file("settings.toml")
            .load()?;

        Ok(c)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            interval: Duration::from_millis(self.sync_interval_ms.max(1)),
            max_concurrent_inits: self.max_concurrent_inits,
            evict_missing: self.evict_missing,
        }
    }

    /// The HTTP source when a URL is set, else the file, else an empty list.
    pub fn fetcher(&self) -> Result<Arc<dyn Fetcher>, Error> {
        if let Some(url) = &self.definitions_url {
            let fetcher = HttpFetcher::new(
                url.clone(),
                self.definitions_token.clone(),
                Duration::from_secs(self.default_query_timeout_seconds),
            )
            .context("Failed to create metadata API fetcher")?;
            return Ok(Arc::new(fetcher));
        }
        if let Some(path) = &self.definitions_file {
            return Ok(Arc::new(FileFetcher::new(path.clone())));
        }
        Ok(Arc::new(StaticFetcher::default()))
    }
}

static DSBRIDGE_CONFIG: OnceLock<Arc<DsBridgeConfig>> = OnceLock::new();

pub fn get() -> Result<Arc<DsBridgeConfig>, Error> {
    DSBRIDGE_CONFIG.get().cloned().ok_or_else(|| {
        Error::msg(
            "Configuration not loaded. \
             Please call load_configuration() before using the configuration",
        )
    })
}

pub fn load_configuration() -> Result<(), Error> {
    if DSBRIDGE_CONFIG.get().is_some() {
        return Ok(());
    }

    let config = DsBridgeConfig::load()?;
    DSBRIDGE_CONFIG.get_or_init(|| Arc::new(config));

    Ok(())
}

static TEST_CONFIG_INIT: Mutex<()> = Mutex::new(());

/// Loads the configuration exactly once across unit and integration tests.
pub fn load_configuration_for_tests() -> Result<(), Error> {
    let _guard = TEST_CONFIG_INIT.lock().unwrap_or_else(|e| e.into_inner());
    load_configuration()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_load_config() {
        let config = DsBridgeConfig::load().unwrap();
        assert_eq!(config.sync_interval_ms, 2000);
        assert_eq!(config.max_concurrent_inits, 8);
        assert!(!config.evict_missing);
        assert_eq!(config.default_max_query_rows, 500);
        assert!(config.definitions_url.is_none());

        temp_env::with_vars(
            [
                ("DSBRIDGE_SYNC_INTERVAL_MS", Some("500")),
                ("DSBRIDGE_EVICT_MISSING", Some("true")),
            ],
            || {
                let config = DsBridgeConfig::load().unwrap();
                let options = config.sync_options();
                assert_eq!(options.interval, Duration::from_millis(500));
                assert!(options.evict_missing);
            },
        );
    }

    #[test]
    #[serial]
    fn test_fetcher_selection() {
        temp_env::with_vars(
            [
                ("DSBRIDGE_DEFINITIONS_URL", Some("http://meta.local/v1/datasources")),
                ("DSBRIDGE_DEFINITIONS_FILE", Some("/etc/dsbridge/defs.json")),
            ],
            || {
                let config = DsBridgeConfig::load().unwrap();
                assert!(config.fetcher().is_ok());
                assert_eq!(
                    config.definitions_file,
                    Some(PathBuf::from("/etc/dsbridge/defs.json"))
                );
            },
        );
    }

    #[test]
    #[serial]
    fn test_load_configuration() {
        load_configuration_for_tests().unwrap();
        assert!(DSBRIDGE_CONFIG.get().is_some());
        assert_eq!(get().unwrap().default_query_timeout_seconds, 60);
    }
}
