//! Tally rating service binary

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tally_rating::{
    config::{CacheBackend, RatingConfig, StorageBackend},
    pricing::{AccountDirectory, HttpAccountDirectory, StaticAccountDirectory},
    store::{
        self, EventStoreLogStore, EventStoreStateStore, LogStore, MemoryLogStore,
        MemoryStateCache, MemoryStateStore, RedisStateCache, StateCache, StateStore,
    },
    Backends, MetricConfig, PriceConfig, PricingCatalog, RateFunctionRegistry, RatingService,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting Tally rating service v{}", tally_common::VERSION);

    let config = RatingConfig::load()?;
    info!("Loaded configuration: {:?}", config);

    let catalog = Arc::new(load_catalog(&config)?);
    let backends = build_backends(&config)?;
    let service = Arc::new(RatingService::new(&config, catalog, backends)?);

    let app = tally_rating::http::router(service);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Rating API listening on {}", addr);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Shutting down Tally rating service");
    Ok(())
}

/// `RUST_LOG` filtering, JSON lines when `TALLY_LOG_JSON` is set
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("TALLY_LOG_JSON").is_ok_and(|v| v != "0" && v != "false");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_catalog(config: &RatingConfig) -> Result<PricingCatalog> {
    let metrics = match &config.pricing.resources_path {
        Some(path) => MetricConfig::from_file(path)?,
        None => MetricConfig::new(),
    };
    let prices = match &config.pricing.prices_path {
        Some(path) => PriceConfig::from_file(path)?,
        None => PriceConfig::new(),
    };
    Ok(PricingCatalog::new(&metrics, prices, &RateFunctionRegistry::new())?)
}

fn build_backends(config: &RatingConfig) -> Result<Backends> {
    let accounts: Arc<dyn AccountDirectory> = match &config.account.base_url {
        Some(url) => Arc::new(HttpAccountDirectory::new(
            url.clone(),
            Duration::from_millis(config.account.request_timeout_ms),
        )?),
        None => Arc::new(StaticAccountDirectory::new()),
    };

    let (state_store, log_store): (Arc<dyn StateStore>, Arc<dyn LogStore>) =
        match config.storage.backend {
            StorageBackend::Memory => (
                Arc::new(MemoryStateStore::new()),
                Arc::new(MemoryLogStore::new()),
            ),
            StorageBackend::EventStore => {
                let client = store::connect_eventstore(&config.storage.eventstore_url)?;
                let prefix = config.storage.stream_prefix.clone();
                (
                    Arc::new(EventStoreStateStore::new(client.clone(), prefix.clone())),
                    Arc::new(EventStoreLogStore::new(client, prefix)),
                )
            }
        };

    let cache: Arc<dyn StateCache> = match config.cache.backend {
        CacheBackend::Memory => Arc::new(MemoryStateCache::new()),
        CacheBackend::Redis => Arc::new(
            RedisStateCache::new(&config.cache.redis_url)?
                .with_prefix(&config.cache.key_prefix)
                .with_ttl(Duration::from_secs(config.cache.ttl_secs)),
        ),
    };

    Ok(Backends {
        accounts,
        state_store,
        cache,
        log_store,
    })
}
