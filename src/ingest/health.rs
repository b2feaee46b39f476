// =============================================================================
// Liveness -- heartbeat monitor + HTTP health endpoint
// =============================================================================
//
// The connector stamps the heartbeat on every successfully processed closed
// candle; the health server answers 200 while the last stamp is younger than
// the liveness threshold (default 60 s), 503 otherwise. Orchestrators restart
// the process on sustained 503s.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

// =============================================================================
// Heartbeat
// =============================================================================

/// Shared liveness stamp, written by the ingest path and read by the health
/// endpoint.
pub struct Heartbeat {
    last: RwLock<Instant>,
}

impl Heartbeat {
    /// A fresh heartbeat starts "live" so the service is not reported dead
    /// during its first connect.
    pub fn new() -> Self {
        Self {
            last: RwLock::new(Instant::now()),
        }
    }

    /// Stamp the heartbeat with the current time.
    pub fn beat(&self) {
        *self.last.write() = Instant::now();
    }

    /// Age of the last stamp.
    pub fn age(&self) -> Duration {
        self.last.read().elapsed()
    }

    /// True while the last stamp is younger than `threshold`.
    pub fn is_live(&self, threshold: Duration) -> bool {
        self.age() < threshold
    }

    #[cfg(test)]
    fn rewind(&self, by: Duration) {
        let past = Instant::now()
            .checked_sub(by)
            .expect("instant arithmetic underflow");
        *self.last.write() = past;
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// HTTP server
// =============================================================================

#[derive(Clone)]
struct HealthState {
    heartbeat: Arc<Heartbeat>,
    threshold: Duration,
    service: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    heartbeat_age_seconds: u64,
}

#[derive(Serialize)]
struct RootResponse {
    service: &'static str,
    status: &'static str,
}

/// Build the health router. Split out of `serve` so tests can drive the
/// handlers without a socket.
fn router(state: HealthState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/", get(root))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    let age = state.heartbeat.age();
    let body = HealthResponse {
        status: if age < state.threshold { "ok" } else { "stale" },
        heartbeat_age_seconds: age.as_secs(),
    };

    if age < state.threshold {
        (StatusCode::OK, Json(body))
    } else {
        warn!(age_seconds = age.as_secs(), "health check failed: no data received recently");
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

async fn root(State(state): State<HealthState>) -> impl IntoResponse {
    Json(RootResponse {
        service: state.service,
        status: "running",
    })
}

/// Serve the health endpoint until shutdown is signalled.
pub async fn serve(
    port: u16,
    heartbeat: Arc<Heartbeat>,
    threshold: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let state = HealthState {
        heartbeat,
        threshold,
        service: "ingestor",
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind health server on port {port}"))?;
    info!(port, "health server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("health server failed")?;

    Ok(())
}
