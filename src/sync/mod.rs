//! Periodic reconciliation of datasource definitions into the instance cache.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::InstanceCache;
use crate::datasource::{Datasource, DatasourceInfo, Registry};

pub mod fetcher;
pub mod translate;

pub use fetcher::{Fetcher, FileFetcher, HttpFetcher, StaticFetcher};
pub use translate::{is_reserved, normalize_kind, settings_for};

/// Rewrites the definition list before it is materialized.
pub type ProcessHook = Arc<dyn Fn(Vec<DatasourceInfo>) -> Vec<DatasourceInfo> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub interval: Duration,
    /// Upper bound on concurrently running `init_client` calls.
    pub max_concurrent_inits: usize,
    /// Drop cached instances whose definition is no longer listed.
    pub evict_missing: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_concurrent_inits: 8,
            evict_missing: false,
        }
    }
}

type Slot = (String, i64);

pub struct Synchronizer {
    registry: Arc<Registry>,
    cache: Arc<InstanceCache>,
    fetcher: Arc<dyn Fetcher>,
    hook: Option<ProcessHook>,
    options: SyncOptions,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<Slot>>>,
}

impl Synchronizer {
    pub fn new(
        registry: Arc<Registry>,
        cache: Arc<InstanceCache>,
        fetcher: Arc<dyn Fetcher>,
        options: SyncOptions,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrent_inits.max(1)));
        Self {
            registry,
            cache,
            fetcher,
            hook: None,
            options,
            permits,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_hook(mut self, hook: ProcessHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Ticks every `interval` until `cancel` fires. Puts already spawned run to completion.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval_ms = self.options.interval.as_millis() as u64, "Starting datasource sync");
        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(error = %format!("{:#}", err), "Datasource sync failed");
                    }
                }
            }
        }
        info!("Datasource sync stopped");
    }

    /// One reconciliation pass. Returns the spawned put tasks.
    pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>> {
        let mut items = self
            .fetcher
            .fetch()
            .await
            .context("Failed to fetch datasource definitions")?;
        if let Some(hook) = &self.hook {
            items = hook(items);
        }

        let mut listed = HashSet::new();
        let mut tasks = Vec::new();
        for item in &items {
            let kind = normalize_kind(&item.plugin_type);
            listed.insert((kind.clone(), item.id));
            let Some(instance) = self.materialize(&kind, item) else {
                continue;
            };
            if let Some(task) = self.schedule(kind, item.id, instance) {
                tasks.push(task);
            }
        }

        if self.options.evict_missing {
            let evicted = self
                .cache
                .retain(|kind, id| listed.contains(&(kind.to_string(), id)));
            if evicted > 0 {
                info!(evicted, "Evicted datasources missing from the definition list");
            }
        }
        debug!(definitions = items.len(), scheduled = tasks.len(), "Datasource sync tick done");
        Ok(tasks)
    }

    fn materialize(&self, kind: &str, item: &DatasourceInfo) -> Option<Box<dyn Datasource>> {
        if is_reserved(kind) {
            return None;
        }
        if !item.is_enabled() {
            debug!(kind, id = item.id, "Skipping disabled datasource");
            return None;
        }
        if item.name.is_empty() {
            warn!(kind, id = item.id, "Datasource name is empty, ignoring");
            return None;
        }

        let settings = settings_for(kind, item);
        let instance = match self.registry.create(kind, &settings) {
            Ok(instance) => instance,
            Err(err) => {
                debug!(kind, id = item.id, error = %err, "Cannot build datasource");
                return None;
            }
        };
        if let Err(err) = instance.validate() {
            warn!(
                kind,
                id = item.id,
                name = %item.name,
                error = %err,
                "Invalid datasource settings"
            );
            return None;
        }
        Some(instance)
    }

    fn schedule(
        &self,
        kind: String,
        id: i64,
        instance: Box<dyn Datasource>,
    ) -> Option<JoinHandle<()>> {
        let slot = (kind, id);
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !in_flight.insert(slot.clone()) {
                debug!(kind = %slot.0, id, "Previous put still running, skipping");
                return None;
            }
        }

        let cache = self.cache.clone();
        let permits = self.permits.clone();
        let in_flight = self.in_flight.clone();
        Some(tokio::spawn(async move {
            // The semaphore is never closed.
            if let Ok(_permit) = permits.acquire_owned().await {
                cache.put(&slot.0, slot.1, instance).await;
            }
            in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&slot);
        }))
    }
}
