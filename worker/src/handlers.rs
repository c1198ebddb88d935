use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use ecco_common::api::{
    CreateFunctionRequest, FilterEventsRequest, FilterEventsResponse, FunctionConfiguration,
    FunctionState, ImageInfo, InvokeResponse, ListStreamsResponse, UpdateFunctionRequest,
};
use ecco_common::Batch;
use serde::Deserialize;
use std::{fs, time::UNIX_EPOCH};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::runtime::{activate, run_invocation};
use crate::state::{lock, HostState};

pub fn build_router(state: HostState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/functions", get(list_functions).post(create_function))
        .route(
            "/api/v1/functions/:name",
            get(get_function).put(update_function),
        )
        .route("/api/v1/functions/:name/invocations", post(invoke))
        .route("/api/v1/images", get(describe_image))
        .route("/api/v1/logs/streams", get(list_streams))
        .route("/api/v1/logs/events", post(filter_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

fn spawn_activation(state: &HostState, config: &FunctionConfiguration, generation: u64) {
    tokio::spawn(activate(
        state.clone(),
        config.name.clone(),
        config.image_ref.clone(),
        generation,
    ));
}

// Lista las funciones ordenadas por nombre
async fn list_functions(State(state): State<HostState>) -> Json<Vec<FunctionConfiguration>> {
    let mut functions: Vec<FunctionConfiguration> = lock(&state.functions)
        .values()
        .map(|e| e.config.clone())
        .collect();
    functions.sort_by(|a, b| a.name.cmp(&b.name));
    Json(functions)
}

async fn get_function(
    State(state): State<HostState>,
    Path(name): Path<String>,
) -> Result<Json<FunctionConfiguration>, StatusCode> {
    state
        .function(&name)
        .map(|e| Json(e.config))
        .ok_or(StatusCode::NOT_FOUND)
}

// Crea la función en Pending y lanza su activación
async fn create_function(
    State(state): State<HostState>,
    Json(req): Json<CreateFunctionRequest>,
) -> Result<(StatusCode, Json<FunctionConfiguration>), StatusCode> {
    if req.name.trim().is_empty() || req.memory_size == 0 {
        return Err(StatusCode::BAD_REQUEST);
    }
    if state.function(&req.name).is_some() {
        return Err(StatusCode::CONFLICT);
    }

    let (config, generation) = state.put_pending(FunctionConfiguration {
        name: req.name,
        memory_size: req.memory_size,
        image_ref: req.image_ref,
        last_modified: Utc::now(),
        state: FunctionState::Pending,
        state_reason: None,
        timeout_secs: req
            .timeout_secs
            .unwrap_or(state.config.function_timeout_secs),
    });
    spawn_activation(&state, &config, generation);

    info!(
        "función creada: {} (memoria={} MB, imagen={})",
        config.name, config.memory_size, config.image_ref
    );
    Ok((StatusCode::CREATED, Json(config)))
}

// Cambia imagen y/o memoria; vuelve a Pending hasta reactivarse
async fn update_function(
    State(state): State<HostState>,
    Path(name): Path<String>,
    Json(req): Json<UpdateFunctionRequest>,
) -> Result<Json<FunctionConfiguration>, StatusCode> {
    if req.is_empty() || req.memory_size == Some(0) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let mut current = state.function(&name).ok_or(StatusCode::NOT_FOUND)?.config;

    if let Some(image_ref) = req.image_ref {
        current.image_ref = image_ref;
    }
    if let Some(memory_size) = req.memory_size {
        current.memory_size = memory_size;
    }
    let (config, generation) = state.put_pending(current);
    spawn_activation(&state, &config, generation);

    info!(
        "función actualizada: {} (memoria={} MB, imagen={})",
        config.name, config.memory_size, config.image_ref
    );
    Ok(Json(config))
}

// Acepta el lote y lo corre en segundo plano
async fn invoke(
    State(state): State<HostState>,
    Path(name): Path<String>,
    Json(batch): Json<Batch>,
) -> Result<(StatusCode, Json<InvokeResponse>), StatusCode> {
    let entry = state.function(&name).ok_or(StatusCode::NOT_FOUND)?;
    if entry.config.state != FunctionState::Active {
        warn!(
            "invocación rechazada: {} está en {:?}",
            name, entry.config.state
        );
        return Err(StatusCode::CONFLICT);
    }

    let invocation_id = uuid::Uuid::new_v4().to_string();
    let cold = state.take_cold(&name);
    info!(
        "invocación {} de {}: lote {} de {} ({} time steps)",
        invocation_id,
        name,
        batch.index,
        batch.job,
        batch.time_steps.len()
    );
    tokio::spawn(run_invocation(
        state.clone(),
        entry.config,
        invocation_id.clone(),
        batch,
        cold,
    ));

    Ok((StatusCode::ACCEPTED, Json(InvokeResponse { invocation_id })))
}

#[derive(Debug, Deserialize)]
struct ImageQuery {
    image_ref: String,
}

// La "imagen" es el ejecutable; su mtime hace de fecha de push
async fn describe_image(Query(q): Query<ImageQuery>) -> Result<Json<ImageInfo>, StatusCode> {
    let meta = fs::metadata(&q.image_ref).map_err(|_| StatusCode::NOT_FOUND)?;
    if !meta.is_file() {
        return Err(StatusCode::NOT_FOUND);
    }
    let modified = meta.modified().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let secs = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Ok(Json(ImageInfo {
        image_ref: q.image_ref,
        last_pushed: DateTime::<Utc>::from(modified),
        digest: Some(format!("{:x}-{:x}", meta.len(), secs)),
    }))
}

#[derive(Debug, Deserialize)]
struct StreamsQuery {
    group: String,
    next_token: Option<String>,
}

async fn list_streams(
    State(state): State<HostState>,
    Query(q): Query<StreamsQuery>,
) -> Json<ListStreamsResponse> {
    let page = state.config.page_size;
    Json(lock(&state.logs).list_streams(&q.group, q.next_token.as_deref(), page))
}

async fn filter_events(
    State(state): State<HostState>,
    Json(req): Json<FilterEventsRequest>,
) -> Json<FilterEventsResponse> {
    let page = state.config.page_size;
    Json(lock(&state.logs).filter(&req, page))
}
