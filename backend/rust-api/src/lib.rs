use axum::{
    http::{header, Method},
    middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::AppState;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Operator console is served from a different origin
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        .nest(
            "/api/v1/attempts",
            attempt_routes(app_state.clone())
                .layer(middleware::from_fn_with_state(
                    app_state.clone(),
                    middlewares::rate_limit::rate_limit_middleware,
                ))
                .layer(middleware::from_fn_with_state(
                    app_state.clone(),
                    middlewares::auth::auth_middleware,
                )),
        )
        .nest(
            "/admin/feedback",
            operator_routes()
                .layer(cors)
                .layer(middleware::from_fn_with_state(
                    app_state.clone(),
                    middlewares::auth::auth_middleware,
                )),
        )
        .with_state(app_state)
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(middleware::from_fn(
            middlewares::trace::trace_context_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

fn attempt_routes(app_state: Arc<AppState>) -> Router<Arc<AppState>> {
    // Starting an attempt carries its own tighter throttle
    let start_route = Router::new()
        .route("/", post(handlers::attempts::start_attempt))
        .route_layer(middleware::from_fn_with_state(
            app_state,
            middlewares::rate_limit::start_rate_limit_middleware,
        ));

    let attempt_routes = Router::new()
        .route("/{id}", get(handlers::attempts::get_attempt_result))
        .route("/{id}/answers", put(handlers::attempts::autosave_answers))
        .route("/{id}/resume", get(handlers::attempts::resume_attempt))
        .route("/{id}/submit", post(handlers::attempts::submit_attempt));

    start_route.merge(attempt_routes)
}

fn operator_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/attempts/{id}/retry",
            post(handlers::operator::retry_attempt_feedback),
        )
        .route("/retry", post(handlers::operator::retry_feedback_batch))
        .route_layer(middleware::from_fn(
            middlewares::auth::admin_guard_middleware,
        ))
}
