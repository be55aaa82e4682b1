//! `/api/v1` routers.
//!
//! | Prefix | Module |
//! |--------|--------|
//! | `/search` | [`search`] |
//! | `/qna` | [`qna`] |
//! | `/tutor` | [`tutor`] |
//! | `/micro_learning` | [`micro_learning`] |
//! | `/metric` | [`metric`] |
//! | `/user` | [`user`] |
//!
//! Every route here sits behind [`require_api_key`].

mod metric;
mod micro_learning;
mod qna;
mod search;
mod tutor;
mod user;

use axum::{body::Bytes, middleware, Router};
use serde::de::DeserializeOwned;

use crate::error::ApiError;
use crate::middleware::require_api_key;
use crate::server::AppState;

pub fn api_router(state: &AppState) -> Router<AppState> {
    Router::new()
        .nest("/search", search::router())
        .nest("/qna", qna::router())
        .nest("/tutor", tutor::router())
        .nest("/micro_learning", micro_learning::router())
        .nest("/metric", metric::router())
        .nest("/user", user::router())
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
}

/// Parse an optional JSON body; an empty body yields the default value.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use welearn_core::models::SdgFilter;

    #[test]
    fn test_optional_json() {
        let empty: SdgFilter = optional_json(&Bytes::new()).unwrap();
        assert!(empty.sdg_filter.is_none());

        let body: SdgFilter = optional_json(&Bytes::from_static(br#"{"sdg_filter":[3,7]}"#)).unwrap();
        assert_eq!(body.sdg_filter, Some(vec![3, 7]));

        let err = optional_json::<SdgFilter>(&Bytes::from_static(b"{")).unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
    }
}
