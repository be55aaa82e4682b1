//! Inferred users, their sessions and their bookmarks.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use welearn_core::models::Bookmark;
use welearn_core::store::BookmarkChange;

use crate::error::ApiError;
use crate::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/user", get(handle_user))
        .route("/session", get(handle_session))
        .route(
            "/bookmarks",
            get(handle_bookmarks)
                .post(handle_add_bookmark)
                .delete(handle_delete_bookmarks),
        )
}

#[derive(Debug, Default, Deserialize)]
struct UserParams {
    #[serde(default)]
    user_id: Option<Uuid>,
    #[serde(default)]
    session_id: Option<Uuid>,
    #[serde(default)]
    document_id: Option<Uuid>,
}

impl UserParams {
    fn user_id(&self) -> Result<Uuid, ApiError> {
        self.user_id
            .ok_or_else(|| ApiError::BadRequest("user_id is required".to_string()))
    }

    fn document_id(&self) -> Result<Uuid, ApiError> {
        self.document_id
            .ok_or_else(|| ApiError::BadRequest("document_id is required".to_string()))
    }
}

fn user_not_found() -> ApiError {
    ApiError::NotFound("User not found".to_string())
}

fn bookmark_result(change: BookmarkChange, user_id: Uuid, document_id: Uuid) -> Result<Json<Value>, ApiError> {
    match change {
        BookmarkChange::Done => Ok(Json(json!({ "user_id": user_id, "document_id": document_id }))),
        BookmarkChange::UserNotFound => Err(user_not_found()),
        BookmarkChange::AlreadyExists => Err(ApiError::Conflict("Bookmark already exists".to_string())),
        BookmarkChange::NotFound => Err(ApiError::NotFound("Bookmark not found".to_string())),
    }
}

async fn handle_user(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
) -> Result<Json<Value>, ApiError> {
    let user_id = state.metadata.get_or_create_user(params.user_id).await?;
    Ok(Json(json!({ "user_id": user_id })))
}

async fn handle_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UserParams>,
) -> Result<Json<Value>, ApiError> {
    let user_id = params.user_id()?;
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let session_id = state
        .metadata
        .get_or_create_session(user_id, params.session_id, host)
        .await?
        .ok_or_else(user_not_found)?;
    Ok(Json(json!({ "session_id": session_id })))
}

async fn handle_bookmarks(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
) -> Result<Json<Vec<Bookmark>>, ApiError> {
    let bookmarks = state
        .metadata
        .bookmarks(params.user_id()?)
        .await?
        .ok_or_else(user_not_found)?;
    Ok(Json(bookmarks))
}

async fn handle_add_bookmark(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
) -> Result<Json<Value>, ApiError> {
    let (user_id, document_id) = (params.user_id()?, params.document_id()?);
    let change = state.metadata.add_bookmark(user_id, document_id).await?;
    bookmark_result(change, user_id, document_id)
}

/// With `document_id`, delete that bookmark; without, delete them all.
async fn handle_delete_bookmarks(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
) -> Result<Json<Value>, ApiError> {
    let user_id = params.user_id()?;
    match params.document_id {
        Some(document_id) => {
            let change = state.metadata.delete_bookmark(user_id, document_id).await?;
            bookmark_result(change, user_id, document_id)
        }
        None => {
            let deleted = state
                .metadata
                .delete_bookmarks(user_id)
                .await?
                .ok_or_else(user_not_found)?;
            Ok(Json(json!({ "user_id": user_id, "deleted": deleted })))
        }
    }
}
