mod audio;
mod config;
mod db_types;
mod dispatch;
mod error;
mod geo;
mod handlers;
mod notify;
mod realtime_types;
mod retry;
mod session;
mod session_manager;
mod store;
mod tasks;
mod tools;
mod twilio_types;
mod types;
mod utils;
mod voice_model;

use crate::config::Config;
use crate::dispatch::{DispatchScheduler, DispatchSettings};
use crate::error::{AppError, StoreError};
use crate::geo::{Geocoder, GoogleGeocoder};
use crate::notify::TwilioNotifier;
use crate::session_manager::CallSessionManager;
use crate::store::PgStore;
use crate::tools::HttpToolBackend;
use crate::types::AppState;
use crate::voice_model::RealtimeConnector;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", tracing_subscriber::filter::LevelFilter::OFF),
            ("sqlx", tracing_subscriber::filter::LevelFilter::WARN),
            ("dispatch_rs", tracing_subscriber::filter::LevelFilter::DEBUG),
        ]));
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {e}");
    }

    if let Err(e) = run().await {
        error!(error=%e, "dispatch-rs exited");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let config = Config::from_env()?;
    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .map_err(|e| AppError::Config(format!("invalid BIND_ADDR '{}': {e}", config.bind_addr)))?;

    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .map_err(StoreError::from)?;
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .map_err(StoreError::from)?;
    let store = Arc::new(PgStore::new(db_pool));
    let http_client = reqwest::Client::new();

    let geocoder: Option<Arc<dyn Geocoder>> = match &config.google_maps_api_key {
        Some(key) => Some(Arc::new(GoogleGeocoder::new(http_client.clone(), key.clone()))),
        None => {
            warn!("GOOGLE_MAPS_API_KEY not set; dispatch will rank by priority only");
            None
        }
    };
    let notifier = Arc::new(TwilioNotifier::new(
        http_client.clone(),
        config.twilio_account_sid.clone(),
        config.twilio_auth_token.clone(),
        config.twilio_from_number.clone(),
    ));
    let scheduler = Arc::new(DispatchScheduler::new(
        store.clone(),
        store.clone(),
        store.clone(),
        geocoder,
        notifier,
        DispatchSettings {
            public_base_url: config.public_base_url.clone(),
            local_offset: config.dispatch_utc_offset,
        },
    ));
    let tools = Arc::new(HttpToolBackend::new(
        http_client,
        config.backend_base_url.clone(),
        scheduler.clone(),
    ));
    let connector = Arc::new(RealtimeConnector::new(
        config.voice_model_url.clone(),
        config.voice_model_api_key.clone(),
        config.voice_model_audio_format,
    ));
    let manager = Arc::new(CallSessionManager::new(
        connector,
        tools,
        store,
        config.fallback_booking_url.clone(),
    ));

    let app_state = Arc::new(AppState {
        manager: manager.clone(),
        scheduler,
    });

    let app = Router::new()
        .route("/connect", get(handlers::ws_handler))
        .route("/twilio/twiml/start", post(handlers::twiml_start_connect))
        .route("/twilio/status", post(handlers::twilio_status))
        .route("/twilio/dispatch/status", post(handlers::dispatch_status))
        .route(
            "/twilio/dispatch/:booking_id/twiml",
            post(handlers::dispatch_twiml),
        )
        .route("/api/emergency-dispatch", post(handlers::emergency_dispatch))
        .route("/", get(|| async { "ok" }))
        .with_state(app_state);

    info!(addr=%addr, "listening");
    let served = axum::Server::try_bind(&addr)
        .map_err(|e| AppError::Server(e.to_string()))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    manager.shutdown().await;
    served.map_err(|e| AppError::Server(e.to_string()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error=%e, "failed to listen for ctrl-c");
    }
    info!("shutting down");
}
