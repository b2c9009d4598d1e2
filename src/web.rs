//
// web.rs
// Study-Anonymizer-rs
//
// Axum-based HTTP server exposing ledger suggestions, patient search and study runs to form front-ends.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::error::StudyError;
use crate::ledger::SequenceLedger;
use crate::models::{PatientMatch, StudyMetadata, StudyPaths, StudyReport, StudyRow};
use crate::pipeline::{PipelineOptions, RunControl, StudyPipeline};

#[derive(Clone)]
struct AppState {
    pipeline: Arc<StudyPipeline>,
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Bootstraps the Axum HTTP server and wires up API routes.
pub async fn start_server(host: &str, port: u16, ledger: Arc<SequenceLedger>) -> anyhow::Result<()> {
    let pipeline = Arc::new(StudyPipeline::new(ledger, PipelineOptions::default()));
    let app = router(pipeline);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!(%addr, "server listening");
    println!("Server running at http://{}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(pipeline: Arc<StudyPipeline>) -> Router {
    Router::new()
        .route("/api/projects/:project/next-patient", get(next_patient_handler))
        .route(
            "/api/projects/:project/patients/:patient_seq/next-study",
            get(next_study_handler),
        )
        .route("/api/projects/:project/patients", get(search_handler))
        .route("/api/projects/:project/studies", get(studies_handler))
        .route("/api/studies", post(start_study_handler))
        .with_state(AppState { pipeline })
        .layer(CorsLayer::permissive())
}

async fn next_patient_handler(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> ApiResult<Json<Value>> {
    let pipeline = Arc::clone(&state.pipeline);
    let patient_seq = blocking(move || pipeline.suggest_next_patient_number(&project))
        .await?
        .map_err(internal_error)?;
    Ok(Json(json!({ "patient_seq": patient_seq })))
}

async fn next_study_handler(
    State(state): State<AppState>,
    Path((project, patient_seq)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let pipeline = Arc::clone(&state.pipeline);
    let study_number =
        blocking(move || pipeline.suggest_next_study_number(&project, &patient_seq))
            .await?
            .map_err(internal_error)?;
    Ok(Json(json!({ "study_number": study_number })))
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    q: Option<String>,
}

async fn search_handler(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<PatientMatch>>> {
    let pipeline = Arc::clone(&state.pipeline);
    let needle = query.q.unwrap_or_default();
    let matches = blocking(move || pipeline.search_patients(&project, &needle))
        .await?
        .map_err(internal_error)?;
    Ok(Json(matches))
}

async fn studies_handler(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> ApiResult<Json<Vec<StudyRow>>> {
    let pipeline = Arc::clone(&state.pipeline);
    let rows = blocking(move || pipeline.ledger().rows(&project))
        .await?
        .map_err(internal_error)?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
struct StudyRequest {
    project_id: String,
    modality: String,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    patient_seq: String,
    study_number: Option<u32>,
    source_root: PathBuf,
    originals_root: PathBuf,
    anonymized_root: PathBuf,
}

async fn start_study_handler(
    State(state): State<AppState>,
    Json(request): Json<StudyRequest>,
) -> ApiResult<Json<StudyReport>> {
    let metadata = StudyMetadata::new(
        &request.project_id,
        &request.modality,
        &request.first_name,
        &request.last_name,
        &request.patient_seq,
        request.study_number,
    )
    .map_err(study_error)?;
    let paths = StudyPaths {
        source_root: request.source_root,
        originals_root: request.originals_root,
        anonymized_root: request.anonymized_root,
    };

    let pipeline = Arc::clone(&state.pipeline);
    let report = blocking(move || pipeline.run(&metadata, &paths, &RunControl::default()))
        .await?
        .map_err(study_error)?;
    Ok(Json(report))
}

/// Ledger and pipeline work touches the filesystem; keep it off the async workers.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(internal_error)
}

fn study_error(err: StudyError) -> (StatusCode, String) {
    let status = match err {
        StudyError::InvalidInput(_)
        | StudyError::NoRecordsFound(_)
        | StudyError::IdentifierInvalid(_) => StatusCode::BAD_REQUEST,
        StudyError::Ledger(_) | StudyError::Scan(_) | StudyError::Worker(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

fn internal_error<E: Display>(err: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
