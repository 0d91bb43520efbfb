use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{FromRequestParts, Request, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info};

use vellum::app_state::AppState;
use vellum::config::ServerConfig;
use vellum::error::AppError;
use vellum::hub::{Hub, HubConfig};
use vellum::management;
use vellum::session::run_client;
use vellum::store::{MemoryStore, SharedStore, SqliteStore};
use vellum::webhook::WebhookQueue;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    setup_tracing();

    let config = ServerConfig::from_env();
    let addr: SocketAddr = config.bind_addr.parse()?;

    let store = build_store(&config).await?;
    store.set_expiration(config.expiration_seconds);

    let webhooks = WebhookQueue::spawn();
    let hub = Hub::spawn(
        webhooks,
        HubConfig {
            webhook_url: config.webhook_url.clone(),
            secret_user: config.secret_user.clone(),
            secret_password: config.secret_password.clone(),
            ..HubConfig::default()
        },
    );

    let state = Arc::new(AppState { store, hub, config });

    let app = Router::new()
        .route("/socket", get(socket_handler).post(management::handle))
        .layer(
            TraceLayer::new_for_http()
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("vellum collaboration server listening on ws://{addr}/socket");

    axum::serve(listener, app).await?;

    Ok(())
}

fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,axum::rejection=trace".into()),
        )
        .init();
}

async fn build_store(config: &ServerConfig) -> Result<SharedStore, AppError> {
    match &config.database_url {
        Some(url) if url.starts_with("sqlite") => {
            Ok(Arc::new(SqliteStore::connect(url).await?))
        }
        Some(other) => Err(AppError::InvalidInput(format!(
            "unsupported DATABASE_URL: {other}"
        ))),
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

/// A WebSocket upgrade hands the connection to a client engine; a plain
/// GET gets a human-readable banner.
async fn socket_handler(State(state): State<Arc<AppState>>, req: Request) -> impl IntoResponse {
    let (mut parts, _body) = req.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws
            .on_upgrade(move |socket| run_client(state, socket))
            .into_response(),
        Err(_) => "Vellum collaboration server is running.".into_response(),
    }
}
