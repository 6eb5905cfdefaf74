//! HTTP request gateway
//!
//! `POST /data` validates a payload and publishes it; `GET /data` returns the
//! latest stored document. Writes never touch the store on the request path.

mod error;
mod handlers;

pub use error::AppError;
pub use handlers::{LatestResponse, StatusMessage, SubmitResponse, ACCEPTED_MESSAGE};

use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::broker::Broker;
use crate::store::DocumentStore;

pub struct AppState {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn DocumentStore>,
    pub queue: String,
    /// Echo a text analysis in submit responses, matching what the worker stores
    pub analyze_text: bool,
}

impl AppState {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn DocumentStore>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            store,
            queue: queue.into(),
            analyze_text: true,
        }
    }

    pub fn with_text_analysis(mut self, enabled: bool) -> Self {
        self.analyze_text = enabled;
        self
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/data", post(handlers::submit).get(handlers::fetch_latest))
        .route("/data/", post(handlers::submit).get(handlers::fetch_latest))
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the gateway until `shutdown` resolves, then drain in-flight requests.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Gateway listening on {}", addr);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
