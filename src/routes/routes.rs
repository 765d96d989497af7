//! Operational HTTP surface.
//!
//! - `GET /healthz` -> liveness
//! - `GET /readyz`  -> database and storage backend readiness
//!
//! Vault operations are a library API and are not exposed over HTTP here.

use crate::handlers::health_handlers::{HealthState, healthz, readyz};
use axum::{Router, routing::get};

pub fn routes() -> Router<HealthState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}
