//! API route definitions.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use crate::context::CommandContext;
use crate::driver::{OperationError, OperationErrorKind};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/initialize", post(initialize))
        .route("/load-config", post(load_config))
        .route("/start-traffic", post(start_traffic))
        .route("/stop-traffic", post(stop_traffic))
        .route("/statistics", post(statistics))
        .route("/cleanup", post(cleanup))
        .route("/reservations/{id}", get(reservation))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "request_id": uuid::Uuid::new_v4().to_string(),
    })
}

fn envelope(data: Value) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta() }))
}

/// A failed driver command rendered as an HTTP error.
struct ApiError(OperationError);

impl From<OperationError> for ApiError {
    fn from(err: OperationError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            OperationErrorKind::Invalid => StatusCode::BAD_REQUEST,
            OperationErrorKind::Conflict => StatusCode::CONFLICT,
            OperationErrorKind::Upstream => StatusCode::BAD_GATEWAY,
            OperationErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        };
        let body = json!({
            "error": {
                "operation": self.0.operation,
                "kind": self.0.kind,
                "message": self.0.to_string(),
            },
            "meta": meta(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

async fn health(State(state): State<AppState>) -> Json<Value> {
    let pool = state.driver.pool_stats().await;
    envelope(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "initialized": pool.is_some(),
        "pool": pool,
        "reservations": state.driver.registry().len().await,
    }))
}

async fn initialize(State(state): State<AppState>, Json(ctx): Json<CommandContext>) -> ApiResult {
    let message = state.driver.initialize(&ctx).await?;
    Ok(envelope(json!({ "message": message })))
}

/// Accepts `true`/`false` either as JSON booleans or strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

impl Default for Flag {
    fn default() -> Self {
        Flag::Bool(false)
    }
}

impl Flag {
    fn as_text(&self) -> String {
        match self {
            Flag::Bool(b) => b.to_string(),
            Flag::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoadConfigRequest {
    context: CommandContext,
    config_file_location: String,
    #[serde(default)]
    use_ports_from_reservation: Flag,
}

async fn load_config(State(state): State<AppState>, Json(req): Json<LoadConfigRequest>) -> ApiResult {
    let message = state
        .driver
        .load_config(
            &req.context,
            &req.config_file_location,
            &req.use_ports_from_reservation.as_text(),
        )
        .await?;
    Ok(envelope(json!({ "message": message })))
}

async fn start_traffic(State(state): State<AppState>, Json(ctx): Json<CommandContext>) -> ApiResult {
    let message = state.driver.start_traffic(&ctx).await?;
    Ok(envelope(json!({ "message": message })))
}

async fn stop_traffic(State(state): State<AppState>, Json(ctx): Json<CommandContext>) -> ApiResult {
    let message = state.driver.stop_traffic(&ctx).await?;
    Ok(envelope(json!({ "message": message })))
}

async fn statistics(State(state): State<AppState>, Json(ctx): Json<CommandContext>) -> ApiResult {
    let artifact = state.driver.get_statistics(&ctx).await?;
    Ok(envelope(json!(artifact)))
}

async fn cleanup(State(state): State<AppState>, Json(ctx): Json<CommandContext>) -> ApiResult {
    let message = state.driver.cleanup_reservation(&ctx).await?;
    Ok(envelope(json!({ "message": message })))
}

async fn reservation(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.driver.registry().snapshot(&id).await {
        Some(reservation) => envelope(json!(reservation)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "data": null, "meta": { "message": format!("unknown reservation {id}") } })),
        )
            .into_response(),
    }
}
