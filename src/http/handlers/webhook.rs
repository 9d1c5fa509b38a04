use crate::store::WebhookStatus;
use crate::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

// Anything but a 2xx makes the gateway redeliver, so recoverable handler
// failures map to 500.
pub async fn receive(State(state): State<AppState>, body: String) -> impl IntoResponse {
    match state.gate.ingest(&body).await {
        Ok(outcome) if outcome.ok => (StatusCode::OK, outcome.message).into_response(),
        Ok(outcome) => (StatusCode::INTERNAL_SERVER_ERROR, outcome.message).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "webhook ingestion failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> impl IntoResponse {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match WebhookStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return (StatusCode::BAD_REQUEST, format!("unknown status {raw}")).into_response()
            }
        },
    };

    match state.gate.queue.list(status, query.limit.unwrap_or(25)).await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "webhook listing failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
