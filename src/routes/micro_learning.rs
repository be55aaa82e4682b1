use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::error::ApiError;
use crate::micro_learning::Journey;
use crate::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/subject_list", get(handle_subject_list))
        .route("/full_journey", get(handle_full_journey))
}

async fn handle_subject_list(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.micro_learning.subject_list().await?))
}

#[derive(Debug, Deserialize)]
struct JourneyParams {
    lang: String,
    sdg: i64,
    subject: String,
}

async fn handle_full_journey(
    State(state): State<AppState>,
    Query(params): Query<JourneyParams>,
) -> Result<Json<Journey>, ApiError> {
    let journey = state
        .micro_learning
        .full_journey(&params.lang, params.sdg, &params.subject)
        .await?;
    Ok(Json(journey))
}
