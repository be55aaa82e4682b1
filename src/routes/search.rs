use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use welearn_core::models::{
    CollectionSchema, EnhancedSearchQuery, ScoredPoint, SdgFilter, SearchMethod, SearchQuery,
};

use super::optional_json;
use crate::error::ApiError;
use crate::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/collections", get(handle_collections))
        .route("/collections/{collection_query}", post(handle_collection_search))
        .route("/by_slices", post(handle_by_slices))
        .route("/multiple_by_slices", post(handle_multiple_by_slices))
        .route("/by_document", post(handle_by_document))
}

// ============ Parameters ============

#[derive(Debug, Deserialize)]
struct CollectionSearchParams {
    query: String,
    #[serde(default = "default_collection")]
    collection: String,
    #[serde(default = "default_collection_results")]
    nb_results: usize,
}

fn default_collection() -> String {
    "conversation".to_string()
}

fn default_collection_results() -> usize {
    10
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default = "default_nb_results")]
    nb_results: usize,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default = "default_influence")]
    influence_factor: f32,
    #[serde(default = "default_relevance")]
    relevance_factor: f32,
    #[serde(default = "default_concatenate")]
    concatenate: bool,
}

fn default_nb_results() -> usize {
    30
}

fn default_influence() -> f32 {
    2.0
}

fn default_relevance() -> f32 {
    1.0
}

fn default_concatenate() -> bool {
    true
}

impl SearchParams {
    fn enhance(self, body: SearchQuery) -> Result<EnhancedSearchQuery, ApiError> {
        let query = body
            .query
            .filter(|q| !q.is_empty())
            .ok_or(ApiError::EmptyQuery)?;
        Ok(EnhancedSearchQuery {
            query,
            corpora: body.corpora,
            sdg_filter: body.sdg_filter,
            nb_results: self.nb_results,
            subject: self.subject,
            influence_factor: self.influence_factor,
            relevance_factor: self.relevance_factor,
            concatenate: self.concatenate,
        })
    }
}

/// A missing collection answers 404 with its bare message.
fn search_error(e: anyhow::Error) -> Response {
    match ApiError::from(e) {
        ApiError::CollectionNotFound(message) => (StatusCode::NOT_FOUND, Json(message)).into_response(),
        other => other.into_response(),
    }
}

fn points_or_null(points: Vec<ScoredPoint>) -> Response {
    if points.is_empty() {
        return (StatusCode::NOT_FOUND, Json(Value::Null)).into_response();
    }
    Json(points).into_response()
}

// ============ Handlers ============

async fn handle_collections(
    State(state): State<AppState>,
) -> Result<Json<Vec<CollectionSchema>>, ApiError> {
    Ok(Json(state.metadata.collections().await?))
}

async fn handle_collection_search(
    State(state): State<AppState>,
    Path(collection_query): Path<String>,
    Query(params): Query<CollectionSearchParams>,
    body: Bytes,
) -> Response {
    let filter: SdgFilter = match optional_json(&body) {
        Ok(f) => f,
        Err(e) => return e.into_response(),
    };
    if params.query.trim().is_empty() {
        return ApiError::EmptyQuery.into_response();
    }
    info!(%collection_query, collection = %params.collection, "collection search");

    let mut qp = EnhancedSearchQuery::new(params.query);
    qp.corpora = Some(vec![params.collection]);
    qp.sdg_filter = filter.sdg_filter;
    qp.nb_results = params.nb_results;

    match state.search.search_handler(&qp, SearchMethod::ByDocument).await {
        Ok(points) if points.is_empty() => {
            (StatusCode::PARTIAL_CONTENT, Json("No results found")).into_response()
        }
        Ok(points) => Json(points).into_response(),
        Err(e) => search_error(e),
    }
}

async fn run_search(
    state: &AppState,
    params: SearchParams,
    body: SearchQuery,
    method: Option<SearchMethod>,
) -> Response {
    let qp = match params.enhance(body) {
        Ok(qp) => qp,
        Err(e) => return e.into_response(),
    };
    let result = match method {
        Some(method) => state.search.search_handler(&qp, method).await,
        None => state.search.search_multi_inputs(&qp).await,
    };
    match result {
        Ok(points) => points_or_null(points),
        Err(e) => search_error(e),
    }
}

async fn handle_by_slices(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
    Json(body): Json<SearchQuery>,
) -> Response {
    run_search(&state, params, body, Some(SearchMethod::BySlices)).await
}

async fn handle_multiple_by_slices(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
    Json(body): Json<SearchQuery>,
) -> Response {
    run_search(&state, params, body, None).await
}

async fn handle_by_document(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
    Json(body): Json<SearchQuery>,
) -> Response {
    run_search(&state, params, body, Some(SearchMethod::ByDocument)).await
}
