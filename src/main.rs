//! Rushtix service entry point
//!
//! Startup order matters: configuration, logging, PostgreSQL (with
//! migrations), the fast store, the relational → fast-store inventory
//! sync, background workers, then the gateway. Exit codes: 0 clean
//! shutdown, 1 configuration error, 2 unrecoverable startup failure.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{error, info, warn};

use rushtix::bus::EventBus;
use rushtix::catalog::{CatalogProvider, PgCatalog, SnapshotCache};
use rushtix::config::AppConfig;
use rushtix::gateway::{self, AppState, AuthVerifier, RateLimiter};
use rushtix::idempotency::IdempotencyLayer;
use rushtix::outbox::{OutboxDispatcher, dispatcher::DispatcherConfig};
use rushtix::payment::{HttpPaymentGateway, MockPaymentGateway, PaymentGateway};
use rushtix::queue::{PassIssuer, QueueConfig, QueueService};
use rushtix::reservation::{
    ExpiryReaper, ReservationDb, ReservationEngine, engine::EngineConfig, reaper::ReaperConfig,
};
use rushtix::saga::{
    RecoveryConfig, SagaConfig, SagaDb, SagaOrchestrator, recovery::SagaRecoveryWorker,
};
use rushtix::store::{FastStore, RedisStore, sync_zone_inventory};

const STARTUP_ATTEMPTS: u32 = 5;

/// Retry a startup dependency with linear backoff; callers exit(2) on None.
async fn connect_with_backoff<T, E, F, Fut>(what: &str, mut connect: F) -> Option<T>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    for attempt in 1..=STARTUP_ATTEMPTS {
        match connect().await {
            Ok(value) => return Some(value),
            Err(e) => {
                warn!(attempt, error = %e, "{what} unreachable, retrying");
                tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
            }
        }
    }
    None
}

#[tokio::main]
async fn main() {
    // 1. Configuration (exit 1 on error)
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    // 2. Logging
    let _log_guard = rushtix::logging::init_logging(&config);
    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), "Starting rushtix");

    // 3. PostgreSQL + migrations (exit 2 if unreachable after backoff)
    let pool = {
        let config = config.clone();
        match connect_with_backoff("PostgreSQL", move || {
            let config = config.clone();
            async move {
                PgPoolOptions::new()
                    .max_connections(config.db_max_connections)
                    .min_connections(config.db_min_connections)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(&config.database_url)
                    .await
            }
        })
        .await
        {
            Some(pool) => pool,
            None => {
                error!("PostgreSQL unreachable, giving up");
                std::process::exit(2);
            }
        }
    };
    if let Err(e) = sqlx::migrate!().run(&pool).await {
        error!(error = %e, "Migrations failed");
        std::process::exit(2);
    }
    info!("PostgreSQL connection pool established, migrations applied");

    // 4. Fast store (exit 2 if unreachable after backoff)
    let store: Arc<dyn FastStore> = {
        let redis_url = config.redis_url.clone();
        let pool_size = config.fast_store_pool_size;
        match connect_with_backoff("Fast store", move || {
            let redis_url = redis_url.clone();
            async move { RedisStore::connect(&redis_url, pool_size).await }
        })
        .await
        {
            Some(store) => Arc::new(store),
            None => {
                error!("Fast store unreachable, giving up");
                std::process::exit(2);
            }
        }
    };

    // 5. Seed zone counters (write-if-absent; live counters win)
    if let Err(e) = sync_zone_inventory(&pool, &store).await {
        error!(error = %e, "Zone inventory sync failed");
        std::process::exit(2);
    }

    // 6. Wire the components
    let catalog: Arc<dyn CatalogProvider> = Arc::new(SnapshotCache::new(
        Arc::new(PgCatalog::new(pool.clone())),
        config.catalog_cache_ttl.as_secs(),
    ));
    let passes = Arc::new(PassIssuer::new(
        &config.queue_pass_secret,
        config.queue_pass_ttl,
    ));
    let reservation_db = Arc::new(ReservationDb::new(pool.clone()));
    let engine = Arc::new(ReservationEngine::new(
        reservation_db.clone(),
        store.clone(),
        catalog,
        passes.clone(),
        EngineConfig {
            reservation_ttl: config.reservation_ttl,
            queue_enforcement: config.queue_enforcement,
            outbox_max_retries: config.outbox_max_retries,
        },
    ));

    #[cfg(feature = "kafka")]
    let bus: Arc<dyn EventBus> = match rushtix::bus::KafkaBus::new(&config.bus_brokers) {
        Ok(bus) => Arc::new(bus),
        Err(e) => {
            error!(error = %e, "Kafka producer init failed");
            std::process::exit(2);
        }
    };
    #[cfg(not(feature = "kafka"))]
    let bus: Arc<dyn EventBus> = {
        info!("Kafka feature disabled, using in-process channel bus");
        Arc::new(rushtix::bus::ChannelBus::default())
    };

    let payment: Arc<dyn PaymentGateway> = match &config.payment_base_url {
        Some(base_url) => match HttpPaymentGateway::new(base_url.clone(), config.payment_timeout) {
            Ok(gateway) => Arc::new(gateway),
            Err(e) => {
                error!(error = %e, "Payment client init failed");
                std::process::exit(2);
            }
        },
        None => {
            warn!("PAYMENT_BASE_URL unset, using approve-all mock gateway");
            Arc::new(MockPaymentGateway::approve_all())
        }
    };

    let saga_db = Arc::new(SagaDb::new(pool.clone()));
    let orchestrator = SagaOrchestrator::new(
        saga_db,
        engine.clone(),
        payment,
        pool.clone(),
        config.outbox_max_retries,
        SagaConfig {
            step_timeout: config.saga_step_timeout,
            retries: config.saga_retries,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let queue = Arc::new(QueueService::new(
        store.clone(),
        passes,
        QueueConfig {
            batch_size: config.queue_batch_size,
            admission_interval: config.queue_admission_interval,
        },
        shutdown_rx.clone(),
    ));

    // 7. Background workers
    let dispatcher = OutboxDispatcher::new(
        pool.clone(),
        bus,
        DispatcherConfig {
            poll_interval: config.dispatcher_interval,
            batch_size: config.dispatcher_batch,
        },
    );
    let dispatcher_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await })
    };

    let reaper = ExpiryReaper::new(
        reservation_db,
        store.clone(),
        ReaperConfig {
            scan_interval: config.reaper_interval,
            batch_size: config.reaper_batch,
            outbox_max_retries: config.outbox_max_retries,
        },
    );
    let reaper_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { reaper.run(shutdown).await })
    };

    let recovery = SagaRecoveryWorker::new(
        orchestrator.clone(),
        RecoveryConfig {
            scan_interval: config.saga_recovery_interval,
            stale_threshold: config.saga_stale_threshold,
            batch_size: 100,
        },
    );
    let recovery_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { recovery.run(shutdown).await })
    };

    // 8. Gateway
    let state = Arc::new(AppState {
        orchestrator,
        engine,
        queue,
        idempotency: Arc::new(IdempotencyLayer::new(store.clone(), config.idempotency_ttl)),
        auth: Arc::new(AuthVerifier::new(&config.jwt_secret)),
        limiter: Arc::new(RateLimiter::new(
            config.rate_limit_rps,
            config.rate_limit_burst,
        )),
        pool,
        store,
    });

    let mut server = tokio::spawn(gateway::run_server(
        state,
        config.http_port,
        shutdown_rx.clone(),
    ));

    // 9. Run until SIGINT or a fatal server error
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!(error = %e, "Signal handler failed"),
            }
            let _ = shutdown_tx.send(true);
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Server error during shutdown"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
        result = &mut server => {
            let _ = shutdown_tx.send(true);
            match result {
                Ok(Ok(())) => warn!("Server exited unexpectedly"),
                Ok(Err(e)) => {
                    error!(error = %e, "Server failed to start or serve");
                    std::process::exit(2);
                }
                Err(e) => {
                    error!(error = %e, "Server task panicked");
                    std::process::exit(2);
                }
            }
        }
    }

    let _ = tokio::join!(dispatcher_handle, reaper_handle, recovery_handle);
    info!("Clean shutdown complete");
}
