use axum::{
    extract::{Multipart, Query, State},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use tracing::info;

use welearn_core::models::{
    SyllabusFeedback, SyllabusResponse, TutorSearchResponse, TutorSyllabusRequest,
};

use crate::error::ApiError;
use crate::extract::extract_upload;
use crate::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/search", post(handle_tutor_search))
        .route("/syllabus", post(handle_syllabus))
        .route("/syllabus/feedback", post(handle_syllabus_feedback))
}

/// Read every `files` part of the upload as plain text.
async fn read_files(mut multipart: Multipart) -> Result<Vec<String>, ApiError> {
    let mut contents = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("files") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let text = extract_upload(&filename, content_type.as_deref(), &bytes)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        if text.is_empty() {
            return Err(ApiError::BadRequest("added files are empty".to_string()));
        }
        info!(%filename, chars = text.len(), "tutor upload");
        contents.push(text);
    }
    if contents.is_empty() {
        return Err(ApiError::BadRequest("no files uploaded".to_string()));
    }
    Ok(contents)
}

async fn handle_tutor_search(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<TutorSearchResponse>, ApiError> {
    let contents = read_files(multipart).await?;
    Ok(Json(state.tutor.tutor_search(&contents).await))
}

#[derive(Debug, Deserialize)]
struct SyllabusParams {
    #[serde(default = "default_lang")]
    lang: String,
}

fn default_lang() -> String {
    "en".to_string()
}

async fn handle_syllabus(
    State(state): State<AppState>,
    Query(params): Query<SyllabusParams>,
    Json(body): Json<TutorSyllabusRequest>,
) -> Result<Json<SyllabusResponse>, ApiError> {
    let syllabus = state.tutor.tutor_manager(&body, &params.lang).await?;
    Ok(Json(SyllabusResponse {
        syllabus,
        documents: body.documents,
        extracts: body.extracts,
    }))
}

async fn handle_syllabus_feedback(
    State(state): State<AppState>,
    Json(body): Json<SyllabusFeedback>,
) -> Result<Json<SyllabusResponse>, ApiError> {
    Ok(Json(state.tutor.syllabus_feedback(body).await?))
}
