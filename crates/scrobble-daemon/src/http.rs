use crate::core::PollerEvent;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use scrobble_proto::cache::ResultCache;
use scrobble_proto::protocol::{CacheEntry, Command};
use scrobble_proto::settings::SettingsRecord;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    cache: Arc<ResultCache>,
    event_tx: mpsc::Sender<PollerEvent>,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    cache: Arc<ResultCache>,
    event_tx: mpsc::Sender<PollerEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(cache, event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn router(cache: Arc<ResultCache>, event_tx: mpsc::Sender<PollerEvent>) -> Router {
    Router::new()
        .route("/api/latest", get(get_latest))
        .route("/api/reset", post(reset_polling))
        .route("/api/reinitialize", post(reinitialize))
        .route("/api/settings", put(save_settings))
        // Display surfaces are browser pages on other origins.
        .layer(CorsLayer::permissive())
        .with_state(HttpState { cache, event_tx })
}

async fn get_latest(State(state): State<HttpState>) -> Json<CacheEntry> {
    Json(state.cache.snapshot())
}

async fn reset_polling(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: reset polling");
    forward(&state, Command::ResetPolling).await
}

async fn reinitialize(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: reinitialize");
    forward(&state, Command::Reinitialize).await
}

async fn save_settings(
    State(state): State<HttpState>,
    Json(settings): Json<SettingsRecord>,
) -> StatusCode {
    info!("HTTP API: save settings ({} keys)", settings.len());
    forward(&state, Command::SaveSettings { settings }).await
}

async fn forward(state: &HttpState, cmd: Command) -> StatusCode {
    if state
        .event_tx
        .send(PollerEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("Failed to forward command: poller loop is gone");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::ACCEPTED
}
