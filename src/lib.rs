pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod utils;

use crate::{
    models::response::HealthStatus,
    state::AppState,
    utils::middleware::{
        rate_limit_middleware, request_id_middleware, security_headers_middleware,
        session_middleware,
    },
};
use axum::{
    extract::State,
    http::{HeaderValue, Method},
    middleware,
    response::Json,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

/// Builds the full HTTP surface on top of a prepared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(
            state
                .config
                .cors_allowed_origins
                .split(',')
                .filter_map(|origin| match origin.trim().parse::<HeaderValue>() {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!("Ignoring invalid CORS origin: {}", origin);
                        None
                    }
                })
                .collect::<Vec<_>>(),
        );

    let limited = Router::new()
        .nest("/auth", routes::auth::router())
        .nest("/api/auth", routes::auth::api_router())
        .nest("/api/bookmarks", routes::bookmarks::router())
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware));

    Router::new()
        .merge(routes::pages::router())
        .route("/health", get(health_check))
        .merge(limited)
        .nest("/api/live", routes::live::router())
        .layer(middleware::from_fn_with_state(state.clone(), session_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(cors),
        )
        .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
        store: format!("{:?}", state.config.store_backend).to_lowercase(),
        live_subscriptions: state.feed.active_subscriptions(),
    })
}
