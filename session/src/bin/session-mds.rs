use anyhow::Context;
use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use mds_session::{
    store::{MemoryRecordStore, RecordStore},
    Lease, SessionManager, SessionOptions, StatusCode,
};
use serde::{Deserialize, Serialize};
use std::{env, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdsStatus {
    pub running: bool,
    pub session_count: usize,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenRequest {
    pub path: String,
    pub client_ip: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenResponse {
    pub status: StatusCode,
    pub session: Option<Lease>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshRequest {
    pub path: String,
    pub session_id: String,
    pub token: String,
    pub client_ip: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshResponse {
    pub status: StatusCode,
}

#[derive(Debug, Clone)]
pub struct MdsState {
    pub sessions: Arc<SessionManager>,
    pub start_time: std::time::Instant,
}

async fn get_status(State(state): State<MdsState>) -> Json<MdsStatus> {
    Json(MdsStatus {
        running: state.sessions.is_running(),
        session_count: state.sessions.session_count().await,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

async fn open_session(
    State(state): State<MdsState>,
    Json(request): Json<OpenRequest>,
) -> Json<OpenResponse> {
    let result = state
        .sessions
        .insert_session(&request.path, &request.client_ip)
        .await;
    let status = StatusCode::of(&result);
    Json(OpenResponse {
        status,
        session: result.ok(),
    })
}

async fn refresh_session(
    State(state): State<MdsState>,
    Json(request): Json<RefreshRequest>,
) -> Json<RefreshResponse> {
    let result = state
        .sessions
        .update_session(
            &request.path,
            &request.session_id,
            &request.token,
            &request.client_ip,
        )
        .await;
    Json(RefreshResponse {
        status: StatusCode::of(&result),
    })
}

fn record_store() -> Arc<dyn RecordStore> {
    #[cfg(feature = "mysql-backend")]
    {
        if env::var("SESSION_DB_URL").is_ok() {
            info!("Using MySQL session store");
            return Arc::new(mds_session::store::MysqlRecordStore::new());
        }
    }

    warn!("Using in-memory session store, sessions will not survive a restart");
    Arc::new(MemoryRecordStore::new())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let bind_addr = env::var("SESSION_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:7100".to_string());
    let options = SessionOptions::from_env()?;

    info!("Session MDS starting...");
    info!(
        lease_time_us = options.lease_time_us,
        tolerance_time_us = options.tolerance_time_us,
        interval_time_us = options.interval_time_us,
        "Session options"
    );

    let sessions = Arc::new(SessionManager::new(record_store()));
    sessions
        .init(options)
        .await
        .context("session manager init failed")?;
    sessions.start();

    let state = MdsState {
        sessions: sessions.clone(),
        start_time: std::time::Instant::now(),
    };

    let app = Router::new()
        .route("/status", get(get_status))
        .route("/session/open", post(open_session))
        .route("/session/refresh", post(refresh_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {bind_addr}"))?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("Session MDS listening on {}", addr);
    info!("API endpoints:");
    info!("  GET  /status           - Session service status");
    info!("  POST /session/open     - Open a file session");
    info!("  POST /session/refresh  - Refresh a file session");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
        })
        .await;

    sessions.stop().await;
    served.context("server error")?;
    info!("Session MDS stopped");
    Ok(())
}
