use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::{
    config::Config,
    limiter::{rate_limit_middleware, RateLimiter},
};

#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub rate_limiter: RateLimiter,
}

/// Builds the router with the limiter mounted in front of every route.
///
/// The limiter travels as a request extension so the middleware stays a plain
/// function composable with the other layers.
pub fn create_api_router(context: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(
            context
                .config
                .server
                .cors_origins
                .iter()
                .map(|origin| origin.parse().unwrap())
                .collect::<Vec<_>>(),
        )
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(service_status))
        .route("/health", get(health_check))
        .layer(axum::middleware::from_fn(rate_limit_middleware))
        .layer(axum::Extension(context.rate_limiter.clone()))
        .layer(cors)
        .with_state(context)
}

async fn service_status(State(context): State<AppContext>) -> Json<Value> {
    Json(json!({
        "service": "rategate",
        "window_ms": context.config.rate_limit.window_ms,
        "max_requests": context.config.rate_limit.max_requests,
        "tracked_clients": context.rate_limiter.tracked_keys()
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now()
    }))
}
