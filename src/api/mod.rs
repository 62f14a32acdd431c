// Axum web server layer

pub mod handlers;
pub mod responses;

use crate::config::ShieldConfig;
use crate::engine::shield::ShieldEngine;
use axum::{
    error_handling::HandleErrorLayer,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    BoxError, Router,
};
use responses::ApiError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

/// Application state shared across handlers.
///
/// The engine is internally reference-counted; AppState clones are cheap.
#[derive(Clone)]
pub struct AppState {
    pub engine: ShieldEngine,
    pub config: Arc<ShieldConfig>,
    pub api_token: Option<String>,
    pub check_semaphore: Arc<Semaphore>,
}

impl AppState {
    pub fn new(engine: ShieldEngine, config: ShieldConfig) -> Self {
        let permits = config.server.max_concurrent_checks.max(1);
        Self {
            engine,
            config: Arc::new(config),
            api_token: ShieldConfig::api_token(),
            check_semaphore: Arc::new(Semaphore::new(permits)),
        }
    }
}

/// Bearer-token auth. Applied to every route except `/api/v1/health`
/// (always public for container healthchecks). No configured token
/// means open access (dev mode).
async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if request.uri().path() == "/api/v1/health" {
        return Ok(next.run(request).await);
    }
    let Some(token) = &state.api_token else {
        return Ok(next.run(request).await);
    };

    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(presented) = header.strip_prefix("Bearer ") else {
        return Err(ApiError::unauthorized("Missing Bearer token"));
    };
    if presented != token {
        return Err(ApiError::forbidden("Invalid token"));
    }
    Ok(next.run(request).await)
}

/// Create the router with all routes and middleware.
///
/// Middleware stack (outermost to innermost): CORS → body size limit →
/// auth → handlers. The per-check concurrency bound lives in the check
/// handler itself so only `/api/v1/check` pays for it.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/api/v1/check", post(handlers::check_handler))
        .route("/api/v1/post-check", post(handlers::post_check_handler))
        .route("/api/v1/health", get(handlers::health_handler))
        .route("/readyz", get(handlers::readyz_handler))
        .route("/api/v1/status", get(handlers::status_handler))
        .route("/api/v1/reload", post(handlers::reload_handler))
        .route("/api/v1/kill", post(handlers::kill_handler))
        .route("/api/v1/resume", post(handlers::resume_handler))
        .route("/api/v1/constraints", get(handlers::constraints_handler))
        .route("/api/v1/check-approval", post(handlers::check_approval_handler))
        .route(
            "/api/v1/respond-approval",
            post(handlers::respond_approval_handler),
        )
        .route(
            "/api/v1/pending-approvals",
            get(handlers::pending_approvals_handler),
        )
        .route("/api/v1/clear-taint", post(handlers::clear_taint_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    router = router.layer(RequestBodyLimitLayer::new(
        state.config.server.max_request_size,
    ));

    // Request timeout; HandleErrorLayer converts the elapsed error into
    // an HTTP response instead of a connection reset
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs.max(1));
    router = router.layer(
        ServiceBuilder::new()
            .layer(HandleErrorLayer::new(|e: BoxError| async move {
                let status = if e.is::<tower::timeout::error::Elapsed>() {
                    StatusCode::REQUEST_TIMEOUT
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, e.to_string())
            }))
            .timeout(timeout),
    );

    if !state.config.server.cors_origins.is_empty() {
        let cors = if state.config.server.cors_origins.iter().any(|o| o == "*") {
            CorsLayer::new().allow_origin(AllowOrigin::any())
        } else {
            let origins: Vec<axum::http::HeaderValue> = state
                .config
                .server
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new().allow_origin(AllowOrigin::list(origins))
        };
        router = router.layer(
            cors.allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        );
    }

    router.with_state(state)
}
