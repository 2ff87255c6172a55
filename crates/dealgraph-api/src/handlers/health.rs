use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use tracing::warn;

use crate::state::AppState;

/// Liveness plus a graph store probe. Always 200; `status` reports degradation.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let graph_ok = match state.graph.health_check().await {
        Ok(ok) => ok,
        Err(e) => {
            warn!(subsystem = "api", component = "health", error = %e, "Graph store probe failed");
            false
        }
    };

    Json(serde_json::json!({
        "status": if graph_ok { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "graph": graph_ok,
    }))
}
