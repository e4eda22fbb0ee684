use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use hiwar_core::ids::ConnectionId;
use hiwar_engine::Assistant;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::gateway::{self, Gateway, READ_TIMEOUT};
use crate::registry::{SessionRegistry, PING_INTERVAL, WRITE_TIMEOUT};

const INDEX_HTML: &str = include_str!("../assets/index.html");
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub read_timeout: Duration,
    pub ping_interval: Duration,
    /// Bound on a single socket write or close.
    pub write_timeout: Duration,
    pub static_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            max_connections: 50,
            read_timeout: READ_TIMEOUT,
            ping_interval: PING_INTERVAL,
            write_timeout: WRITE_TIMEOUT,
            static_dir: PathBuf::from("static"),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub connection_slots: Arc<Semaphore>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    model: String,
    device: &'static str,
    farasa_available: bool,
    connections: usize,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, static_dir: &Path) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .nest_service("/static", ServeDir::new(static_dir))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, assistant: Arc<Assistant>) -> Result<ServerHandle, std::io::Error> {
    tokio::fs::create_dir_all(&config.static_dir).await?;

    let registry = Arc::new(
        SessionRegistry::new(config.ping_interval).with_write_timeout(config.write_timeout),
    );
    let gateway = Gateway::new(Arc::clone(&registry), assistant).with_read_timeout(config.read_timeout);
    let state = AppState {
        gateway,
        connection_slots: Arc::new(Semaphore::new(config.max_connections)),
    };

    let router = build_router(state, &config.static_dir);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        addr = %local_addr,
        max_connections = config.max_connections,
        static_dir = %config.static_dir.display(),
        "Hiwar server started"
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Stop accepting, then close every socket and drain the listener within
    /// the shutdown grace period.
    pub async fn shutdown(self) {
        self.shutdown.cancel();

        let registry = self.registry;
        let mut server = self.server;
        let drain = async {
            let closed = registry.close_all().await;
            tracing::info!(closed, "Server shutting down");
            let _ = (&mut server).await;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::warn!("Server did not drain in time, aborting");
            server.abort();
        }
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// WebSocket upgrade handler. Refuses the upgrade once every slot is taken.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let Ok(permit) = Arc::clone(&state.connection_slots).try_acquire_owned() else {
        tracing::warn!("Connection limit reached, refusing upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, state.gateway).await;
        drop(permit);
    })
}

async fn handle_socket(socket: WebSocket, gateway: Gateway) {
    let id = ConnectionId::new();
    tracing::info!(connection_id = %id, "WebSocket client connected");

    let (sink, stream) = socket.split();
    gateway
        .serve(id, Box::new(sink), gateway::inbound_events(stream))
        .await;
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        model: state.gateway.assistant().model().to_string(),
        device: "remote",
        farasa_available: false,
        connections: state.gateway.registry().count().await,
    })
}
