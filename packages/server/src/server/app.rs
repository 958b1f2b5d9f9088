//! Application setup and server configuration.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        Method,
    },
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::kernel::{ContentPipeline, HttpGenerationApi, HttpPublishingApi, ServerDeps};
use crate::resilience::LogNotifier;
use crate::server::routes::{
    admin_retry_handler, api_health_handler, cancel_job_handler, create_job_handler,
    get_jobs_handler, health_handler, process_job_handler, retry_handler,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<ServerDeps>,
    pub pipeline: Arc<ContentPipeline>,
}

/// Build the Axum application router
pub fn build_app(pool: PgPool, config: &Config) -> anyhow::Result<Router> {
    let generation = Arc::new(HttpGenerationApi::new(
        config.generation_api_url.clone(),
        config.generation_api_key.clone(),
        config.generation_model.clone(),
    )?);
    let publishing = Arc::new(HttpPublishingApi::new(
        config.publishing_api_url.clone(),
        config.publishing_api_key.clone(),
    )?);

    let deps = Arc::new(ServerDeps::new(
        pool,
        generation,
        publishing,
        Arc::new(LogNotifier),
    ));
    let app_state = AppState {
        pipeline: Arc::new(ContentPipeline::new(deps.clone())),
        deps,
    };

    // CORS: browser dashboards call these endpoints cross-origin; the
    // layer answers OPTIONS preflights with 200.
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    let app = Router::new()
        .route("/api/jobs", get(get_jobs_handler).post(create_job_handler))
        .route("/api/jobs/process", post(process_job_handler))
        .route("/api/jobs/cancel", post(cancel_job_handler))
        .route("/api/retry", get(retry_handler).post(retry_handler))
        .route("/api/health", get(api_health_handler))
        .route("/api/admin/retry", post(admin_retry_handler))
        .route("/health", get(health_handler))
        .layer(Extension(app_state))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    Ok(app)
}
