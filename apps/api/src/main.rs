use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::{self, TraceLayer};
use tracing::{Level, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use booking_cell::{
    AppointmentStore, BookingCellState, BookingCoordinator, InMemoryAppointmentStore, LockTable,
    RealtimeHub, RedisLockTable, SlotLocks, SupabaseAppointmentStore,
};
use schedule_cell::{
    Directory, InMemoryDirectory, InMemoryScheduleRepository, ScheduleCellState, ScheduleRepository,
    ScheduleService, SlotStore, SupabaseDirectory, SupabaseScheduleRepository,
};
use shared_config::{AppConfig, LockBackend, StorageBackend};
use shared_database::supabase::SupabaseClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting hospital booking API server");

    // Load configuration
    let config = Arc::new(AppConfig::from_env());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (schedule_state, booking_state) = build_state(config.clone(), shutdown_rx.clone()).await?;

    // Live calendar fan-out runs off the request path
    let hub = booking_state.hub.clone();
    let forwarder = tokio::spawn(async move { hub.run(shutdown_rx).await });

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the application router
    let app = router::create_router(schedule_state, booking_state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("Server error")?;

    if let Err(e) = forwarder.await {
        warn!("Realtime forwarder ended abnormally: {}", e);
    }
    info!("Server stopped");
    Ok(())
}

/// Wire stores, locks and services for the configured backends.
async fn build_state(
    config: Arc<AppConfig>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(Arc<ScheduleCellState>, Arc<BookingCellState>)> {
    let (repository, directory, appointments): (
        Arc<dyn ScheduleRepository>,
        Arc<dyn Directory>,
        Arc<dyn AppointmentStore>,
    ) = match config.storage_backend {
        StorageBackend::Supabase => {
            info!("Using Supabase storage at {}", config.supabase_url);
            let supabase = Arc::new(SupabaseClient::new(&config));
            (
                Arc::new(SupabaseScheduleRepository::new(supabase.clone())),
                Arc::new(SupabaseDirectory::new(supabase.clone())),
                Arc::new(SupabaseAppointmentStore::new(supabase)),
            )
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; data is lost on restart");
            (
                Arc::new(InMemoryScheduleRepository::new()),
                Arc::new(InMemoryDirectory::permissive()),
                Arc::new(InMemoryAppointmentStore::new()),
            )
        }
    };

    let locks: Arc<dyn SlotLocks> = match config.lock_backend {
        LockBackend::Redis => Arc::new(
            RedisLockTable::connect(&config)
                .await
                .context("Failed to connect the Redis lock backend")?,
        ),
        LockBackend::Memory => {
            let table = Arc::new(LockTable::new(Duration::from_secs(config.slot_lock_ttl_seconds)));
            let expiry = table.clone();
            tokio::spawn(async move { expiry.run_expiry(shutdown).await });
            table
        }
    };

    let slots = Arc::new(SlotStore::new(repository, config.admit_max_retries));
    let schedules = Arc::new(ScheduleService::new(slots.clone(), directory, config.default_max_bookings));
    let coordinator = Arc::new(BookingCoordinator::new(
        slots.clone(),
        locks.clone(),
        appointments,
        config.max_reschedules,
    ));
    let hub = Arc::new(RealtimeHub::new(locks, slots));

    Ok((
        Arc::new(ScheduleCellState { config: config.clone(), schedules }),
        Arc::new(BookingCellState { config, coordinator, hub }),
    ))
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
    // Receivers may already be gone
    let _ = shutdown.send(true);
}
