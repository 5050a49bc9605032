use actix_web::{web, App, HttpServer};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use transactional_outbox::{OutboxRepository, SqlxOutboxRepository};
use watch_room_service::{
    commands::RoomService,
    config::Config,
    consumers::IdentityEventConsumer,
    error::AppError,
    hub::{ConnectionRegistry, Hub},
    logging, routes,
    state::AppState,
    store::{MemoryStore, PgStore, SharedStore},
    workers::{build_publisher, spawn_outbox_processor, Janitor, SWEEP_INTERVAL},
};

#[actix_web::main]
async fn main() -> Result<(), AppError> {
    let cfg = Arc::new(Config::from_env()?);
    logging::init_tracing(&cfg.log_format);

    let (store, outbox): (SharedStore, Arc<dyn OutboxRepository>) = match &cfg.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(cfg.database_max_connections)
                .connect(url)
                .await
                .map_err(|e| AppError::StartServer(format!("db: {e}")))?;

            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| AppError::StartServer(format!("migrations: {e}")))?;

            tracing::info!("Using PostgreSQL store");
            (
                Arc::new(PgStore::new(pool.clone(), cfg.dedup_window)),
                Arc::new(SqlxOutboxRepository::new(pool)),
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            let memory = MemoryStore::new(cfg.dedup_window);
            (Arc::new(memory.clone()), Arc::new(memory))
        }
    };

    let registry = ConnectionRegistry::new();
    let service = RoomService::new(store.clone(), registry, cfg.commands.clone());
    let hub = Hub::new(service.clone());

    let publisher = build_publisher(cfg.kafka.as_ref())?;
    let _outbox_task = spawn_outbox_processor(outbox.clone(), publisher, &cfg.outbox);

    let cooldown_ttl = cfg
        .commands
        .beep_cooldown
        .max(cfg.commands.scream_cooldown);
    let _janitor_task = Janitor::new(
        outbox,
        store,
        service.cooldowns().clone(),
        cfg.dedup_window,
        cooldown_ttl,
    )
    .spawn(SWEEP_INTERVAL);

    if let Some(kafka) = &cfg.kafka {
        let consumer = IdentityEventConsumer::new(kafka, service.clone())?;
        tokio::spawn(consumer.run());
    } else {
        tracing::warn!("KAFKA_BROKERS not set, identity events will not be consumed");
    }

    let state = AppState::new(hub, cfg.clone());
    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, "starting watch-room-service");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind: {e}")))?
    .run()
    .await
    .map_err(|e| AppError::StartServer(format!("server: {e}")))
}
