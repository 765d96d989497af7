//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness, no I/O
//! - GET /readyz   -> checks database connectivity and a backend round trip

use crate::storage::{StorageBackend, collect_stream};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use bytes::Bytes;
use serde::Serialize;
use sqlx::SqlitePool;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::warn;
use uuid::Uuid;

const PROBE_BODY: &[u8] = b"readyz";

/// Shared state of the health router.
#[derive(Clone)]
pub struct HealthState {
    pub pool: SqlitePool,
    pub backend: Arc<dyn StorageBackend>,
    /// Upper bound for each readiness check.
    pub probe_timeout: Duration,
}

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// 200 when `SELECT 1` succeeds and a probe blob can be stored, read back
/// and deleted on the configured backend, 503 otherwise.
pub async fn readyz(State(state): State<HealthState>) -> impl IntoResponse {
    let sqlite = check(state.probe_timeout, sqlite_check(&state.pool)).await;
    let storage = check(state.probe_timeout, storage_check(state.backend.as_ref())).await;
    let overall_ok = sqlite.ok && storage.ok;
    if !overall_ok {
        warn!(
            sqlite = ?sqlite.error,
            storage = ?storage.error,
            "readiness check failed"
        );
    }

    let mut checks = HashMap::new();
    checks.insert("sqlite", sqlite);
    checks.insert(state.backend.backend_name(), storage);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn check(
    timeout: Duration,
    fut: impl Future<Output = Result<(), String>>,
) -> CheckStatus {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(())) => CheckStatus {
            ok: true,
            error: None,
        },
        Ok(Err(error)) => CheckStatus {
            ok: false,
            error: Some(error),
        },
        Err(_) => CheckStatus {
            ok: false,
            error: Some(format!("timed out after {timeout:?}")),
        },
    }
}

async fn sqlite_check(pool: &SqlitePool) -> Result<(), String> {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(1) => Ok(()),
        Ok(v) => Err(format!("unexpected result: {v}")),
        Err(e) => Err(format!("error: {e}")),
    }
}

async fn storage_check(backend: &dyn StorageBackend) -> Result<(), String> {
    let path = format!("health/readyz-{}", Uuid::new_v4());
    backend
        .store(&path, Bytes::from_static(PROBE_BODY), "text/plain")
        .await
        .map_err(|e| format!("could not write probe: {e}"))?;

    let read = match backend.get(&path).await {
        Ok(stream) => collect_stream(stream)
            .await
            .map_err(|e| format!("could not read probe: {e}")),
        Err(e) => Err(format!("could not read probe: {e}")),
    };
    let cleanup = backend.delete(&path).await;

    match read? {
        body if body.as_ref() == PROBE_BODY => {}
        _ => return Err("probe content mismatch".into()),
    }
    cleanup.map_err(|e| format!("could not remove probe: {e}"))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize, Debug)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
