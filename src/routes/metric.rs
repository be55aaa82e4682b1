use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tracing::error;

use welearn_core::models::{CorpusQtyDocInfo, CorpusQtyRow};

use crate::error::ApiError;
use crate::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/nb_docs_info_per_corpus", get(handle_nb_docs_info_per_corpus))
}

/// Validate every row. Invalid rows are dropped and turn the status into
/// 206; nothing valid out of a non-empty input is a 500.
fn validate_rows(rows: &[CorpusQtyRow]) -> (StatusCode, Vec<CorpusQtyDocInfo>) {
    if rows.is_empty() {
        return (StatusCode::OK, Vec::new());
    }
    let mut status = StatusCode::OK;
    let mut valid = Vec::with_capacity(rows.len());
    for row in rows {
        match row.validate() {
            Ok(info) => valid.push(info),
            Err(e) => {
                error!(corpus = %row.source_name, error = %e, "invalid corpus row");
                status = StatusCode::PARTIAL_CONTENT;
            }
        }
    }
    if valid.is_empty() {
        status = StatusCode::INTERNAL_SERVER_ERROR;
    }
    (status, valid)
}

async fn handle_nb_docs_info_per_corpus(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Vec<CorpusQtyDocInfo>>), ApiError> {
    let rows = state.metadata.corpus_doc_counts().await?;
    let (status, valid) = validate_rows(&rows);
    Ok((status, Json(valid)))
}
