use axum::{
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::ws::ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        // Mode arbitration
        .route("/mode", get(handlers::mode_get))
        .route("/mode/:mode", post(handlers::mode_set))
        // Ingest
        .route("/ingest/status", get(handlers::ingest_status))
        .route("/ingest/start/:cam", post(handlers::ingest_start))
        .route("/ingest/stop/:cam", post(handlers::ingest_stop))
        .route("/cameras/:cam/snapshot", get(handlers::camera_snapshot))
        // Recording
        .route("/recording/start", post(handlers::recording_start))
        .route("/recording/stop", post(handlers::recording_stop))
        .route("/recording/status", get(handlers::recording_status))
        .route("/recording/sessions", get(handlers::recording_sessions))
        // Mixer
        .route("/mixer/start", post(handlers::mixer_start))
        .route("/mixer/stop", post(handlers::mixer_stop))
        .route("/mixer/scene/:id", post(handlers::mixer_scene))
        .route("/mixer/scenes", get(handlers::mixer_scenes))
        .route("/mixer/overlay/:id", post(handlers::mixer_overlay))
        // Aggregate status and configuration
        .route("/status", get(handlers::aggregate_status))
        .route("/config/reload", post(handlers::config_reload));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws/events", any(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
