//! Inbound HTTP contract: batch submission and status lookup.

use crate::batch::IngestionService;
use crate::errors::{CoreError, ErrorKind};
use crate::models::{Batch, FileMetadata, ObjectRef};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State as AxumState},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct ApiState {
    pub ingestion: IngestionService,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/batches", post(submit_batch).get(list_batches))
        .route("/api/batches/:batch_id", get(get_batch_status))
        .layer(DefaultBodyLimit::max(crate::batch::ingest::MAX_FILE_SIZE))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SubmitQuery {
    bank_id: Option<String>,
    file_name: Option<String>,
    content_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    batch_id: String,
    status: String,
    object_ref: Option<ObjectRef>,
    file_metadata: FileMetadata,
    exposure_count: i64,
    uploaded_at: String,
    completed_at: Option<String>,
    error_message: Option<String>,
}

impl From<Batch> for BatchResponse {
    fn from(batch: Batch) -> Self {
        Self {
            batch_id: batch.batch_id,
            status: batch.status.as_str().to_string(),
            object_ref: batch.object_ref,
            file_metadata: batch.file_metadata,
            exposure_count: batch.exposure_count,
            uploaded_at: batch.uploaded_at.to_rfc3339(),
            completed_at: batch.completed_at.map(|t| t.to_rfc3339()),
            error_message: batch.error_message,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message_key: String,
    detail: Option<String>,
}

fn error_response(error: CoreError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match error.kind {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::ChecksumMismatch => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            code: error.code,
            message_key: error.message_key,
            detail: error.detail,
        }),
    )
}

async fn submit_batch(
    AxumState(state): AxumState<ApiState>,
    Query(params): Query<SubmitQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<BatchResponse>), (StatusCode, Json<ErrorResponse>)> {
    let bank_id = params.bank_id.unwrap_or_default();
    let file_name = params.file_name.unwrap_or_else(|| "upload.json".to_string());
    let content_type = params
        .content_type
        .unwrap_or_else(|| "application/json".to_string());

    let batch = state
        .ingestion
        .submit_batch(&bank_id, &body, &file_name, &content_type)
        .map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(batch.into())))
}

async fn get_batch_status(
    AxumState(state): AxumState<ApiState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.ingestion.get_batch_status(&batch_id) {
        Ok(Some(batch)) => Ok(Json(batch.into())),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                code: "BATCH_NOT_FOUND".to_string(),
                message_key: "error.batch.not_found".to_string(),
                detail: Some(batch_id),
            }),
        )),
        Err(e) => Err(error_response(e)),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    bank_id: String,
    limit: Option<usize>,
}

async fn list_batches(
    AxumState(state): AxumState<ApiState>,
    Query(params): Query<ListQuery>,
) -> Result<Json<Vec<BatchResponse>>, (StatusCode, Json<ErrorResponse>)> {
    let limit = params.limit.unwrap_or(50).min(500);
    let batches = state
        .ingestion
        .list_batches(&params.bank_id, limit)
        .map_err(error_response)?;
    Ok(Json(batches.into_iter().map(BatchResponse::from).collect()))
}
