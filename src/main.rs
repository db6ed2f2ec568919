#![forbid(unsafe_code)]
use anyhow::{Context, Result};
use dsbridge::adapters::builtin_registry;
use dsbridge::cache;
use dsbridge::config::{self, load_configuration};
use dsbridge::datasource::registry;
use dsbridge::sql::facade::install_query_defaults;
use dsbridge::sync::Synchronizer;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing::event;

fn main() -> Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|e| anyhow::anyhow!("Failed to install CryptoProvider: {:?}", e))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    load_configuration().context("Failed to load configuration")?;
    let config = config::get().context("Failed to get configuration")?;

    // Initialize Sentry if DSN is provided
    let _sentry = config.sentry_dsn.as_ref().map(|dsn| {
        sentry::init((
            dsn.clone(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    install_query_defaults(
        Duration::from_secs(config.default_query_timeout_seconds),
        config.default_max_query_rows,
    );

    let registry =
        registry::install(builtin_registry().context("Failed to build datasource registry")?);
    event!(Level::INFO, kinds = ?registry.kinds(), "Datasource registry installed");

    let fetcher = config.fetcher()?;
    let synchronizer = Synchronizer::new(registry, cache::shared(), fetcher, config.sync_options());

    let cancel = CancellationToken::new();
    let shutdown = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                event!(Level::ERROR, "Failed to listen for Ctrl-C: {}", err);
            }
            cancel.cancel();
        })
    };

    synchronizer.run(cancel).await;
    shutdown.abort();
    event!(Level::INFO, "dsbridge stopped gracefully");
    Ok(())
}
