//! HTTP surface for HITL workflows.
//!
//! Requests register a start or resume; `GET /workflows/stream/{thread_id}`
//! then runs the thread and delivers its events over SSE.

pub mod config;
mod error;
pub mod routes;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use hitl_engine::WorkflowService;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::ServerConfig;
pub use error::ApiError;

/// Shared application state accessible from Axum routes.
#[derive(Clone)]
pub struct AppState {
    pub service: WorkflowService,
}

/// The full route table.
pub fn app(service: WorkflowService, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/workflows", get(routes::list_workflows))
        .route("/workflows/start", post(routes::start))
        .route("/workflows/resume", post(routes::resume))
        .route("/workflows/interrupt", post(routes::interrupt))
        .route("/workflows/stream/{thread_id}", get(routes::stream))
        .route("/workflows/state/{thread_id}", get(routes::get_state))
        .route("/workflows/sentences/{thread_id}", get(routes::sentences))
        .route("/workflows/sentences/edit", post(routes::edit_sentence))
        .route("/workflows/sentences/feedback", post(routes::feedback_sentence))
        .layer(TraceLayer::new_for_http())
        .layer(cors(cors_origins))
        .with_state(AppState { service })
}

fn cors(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if allowed.is_empty() {
        return CorsLayer::permissive();
    }
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Bind and serve until the process is stopped.
pub async fn serve(config: &ServerConfig, service: WorkflowService) -> anyhow::Result<()> {
    let addr = config.addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{}", addr);
    axum::serve(listener, app(service, &config.cors_origins)).await?;
    Ok(())
}
