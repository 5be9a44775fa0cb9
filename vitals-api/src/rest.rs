use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;

use crate::auth::{self, AuthedDevice};
use crate::db;
use crate::errors::{Error, Result};
use crate::ingest;
use crate::metrics::{gather_metrics, AUTH_FAILURES_TOTAL};
use crate::model::{HistoryResponse, Reading, RegisterDevice, VitalsPayload};
use crate::query;
use crate::registry;

const IDEMPOTENCY_KEY_MAX_LEN: usize = 255;

#[derive(Debug, Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub master_key: String,
    pub stale_after: chrono::Duration,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    page: Option<i64>,
    page_size: Option<i64>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/admin/init-db", post(init_db))
        .route("/patients", get(get_patients))
        .route("/api/v1/devices/register", post(register_device))
        .route("/api/v1/patients/:patient_id/latest", get(get_latest))
        .route(
            "/api/v1/patients/:patient_id/vitals",
            post(post_vitals)
                .route_layer(from_fn_with_state(
                    state.clone(),
                    auth::require_device_key,
                ))
                .get(get_history),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "OK" }))
}

async fn metrics() -> String {
    gather_metrics()
}

async fn init_db(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    db::init_schema(&state.pool).await?;
    db::seed_demo_patients(&state.pool).await?;
    Ok(Json(serde_json::json!({ "status": "initialized" })))
}

async fn get_patients(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let patients = query::patients(&state.pool).await?;
    Ok(Json(serde_json::json!({ "patients": patients })))
}

async fn register_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<RegisterDevice>, JsonRejection>,
) -> Result<Response> {
    let presented = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !registry::master_key_matches(&state.master_key, presented) {
        AUTH_FAILURES_TOTAL.inc();
        return Err(Error::Auth);
    }

    let Json(request) = payload.map_err(|e| Error::Validation(e.to_string()))?;
    let registered = registry::register_device(&state.pool, &request).await?;
    Ok((StatusCode::CREATED, Json(registered)).into_response())
}

async fn post_vitals(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
    Extension(device): Extension<AuthedDevice>,
    headers: HeaderMap,
    payload: std::result::Result<Json<VitalsPayload>, JsonRejection>,
) -> Result<Response> {
    let idem_key = idempotency_key(&headers)?;
    let Json(payload) = payload.map_err(|e| Error::Validation(e.to_string()))?;

    let outcome = ingest::ingest_reading(
        &state.pool,
        &patient_id,
        &device.0,
        &idem_key,
        &payload,
        state.stale_after,
    )
    .await?;

    let status = if outcome.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome.body)).into_response())
}

async fn get_latest(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
) -> Result<Json<Reading>> {
    let reading = query::latest(&state.pool, &patient_id).await?;
    Ok(Json(reading))
}

async fn get_history(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
    params: std::result::Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>> {
    let Query(params) = params.map_err(|e| Error::Validation(e.to_string()))?;
    let response = query::history(
        &state.pool,
        &patient_id,
        params.from,
        params.to,
        params.page,
        params.page_size,
    )
    .await?;
    Ok(Json(response))
}

fn idempotency_key(headers: &HeaderMap) -> Result<String> {
    let value = headers
        .get("idempotency-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();

    if value.is_empty() {
        return Err(Error::Validation(
            "Idempotency-Key header is required".to_string(),
        ));
    }
    if value.len() > IDEMPOTENCY_KEY_MAX_LEN {
        return Err(Error::Validation(format!(
            "Idempotency-Key must be at most {} characters",
            IDEMPOTENCY_KEY_MAX_LEN
        )));
    }
    Ok(value.to_string())
}
