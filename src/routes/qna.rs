//! Question answering: reformulation, sourced answers, rephrasing, the
//! streamed variants and the conversational agent.

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::post,
    Json, Router,
};
use futures::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tracing::{error, info};
use uuid::Uuid;

use welearn_core::models::{
    AgentContext, AgentResponse, Context, Document, Message, QueryStatus,
    ReformulatedQueryResponse, ReformulatedQuestionsResponse,
};

use crate::error::ApiError;
use crate::middleware::{X_CONVERSATION_ID, X_MESSAGE_ID, X_SESSION_ID};
use crate::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/reformulate/query", post(handle_reformulate_query))
        .route("/reformulate/questions", post(handle_new_questions))
        .route("/chat/rephrase", post(handle_rephrase))
        .route("/chat/rephrase_stream", post(handle_rephrase_stream))
        .route("/chat/answer", post(handle_answer))
        .route("/stream", post(handle_stream))
        .route("/chat/agent", post(handle_agent))
        .route("/chat/document_click", post(handle_document_click))
}

/// A validated chat body.
struct ChatParams {
    query: String,
    history: Vec<Message>,
    sources: Vec<Document>,
    subject: Option<String>,
}

fn chat_params(state: &AppState, mut body: Context) -> Result<ChatParams, ApiError> {
    body.sources.truncate(state.config.chat.max_sources);
    let query = body
        .query
        .filter(|q| !q.trim().is_empty())
        .ok_or(ApiError::EmptyQuery)?;
    Ok(ChatParams {
        query,
        history: body.history,
        sources: body.sources,
        subject: body.subject,
    })
}

/// Keep domain errors, replace unexpected failures with a pipeline error.
fn pipeline_error(e: anyhow::Error, fallback: fn() -> ApiError) -> ApiError {
    match ApiError::from(e) {
        ApiError::Internal(_) => fallback(),
        other => other,
    }
}

fn sse(stream: BoxStream<'static, anyhow::Result<String>>) -> Response {
    let events = stream.filter_map(|chunk| async move {
        match chunk {
            Ok(delta) => Some(Ok::<Event, Infallible>(Event::default().data(delta))),
            Err(e) => {
                error!(error = %e, "stream interrupted");
                None
            }
        }
    });
    Sse::new(events).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// ============ Reformulation ============

async fn handle_reformulate_query(
    State(state): State<AppState>,
    Json(body): Json<Context>,
) -> Result<Json<ReformulatedQueryResponse>, ApiError> {
    let params = chat_params(&state, body)?;
    let reformulated = state
        .chat
        .reformulate_user_query(&params.query, &params.history)
        .await
        .map_err(|e| pipeline_error(e, ApiError::reformulate))?;
    if reformulated.query_status == Some(QueryStatus::Invalid) {
        return Err(ApiError::InvalidQuestion);
    }
    Ok(Json(reformulated))
}

async fn handle_new_questions(
    State(state): State<AppState>,
    Json(body): Json<Context>,
) -> Result<Json<ReformulatedQuestionsResponse>, ApiError> {
    let params = chat_params(&state, body)?;
    Ok(Json(
        state
            .chat
            .get_new_questions(&params.query, &params.history)
            .await?,
    ))
}

// ============ Rephrase ============

async fn handle_rephrase(
    State(state): State<AppState>,
    Json(body): Json<Context>,
) -> Result<Json<String>, ApiError> {
    let params = chat_params(&state, body)?;
    let content = state
        .chat
        .rephrase_message(
            &params.sources,
            &params.query,
            &params.history,
            params.subject.as_deref(),
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Error while rephrasing the query");
            ApiError::rephrase()
        })?;
    Ok(Json(content))
}

async fn handle_rephrase_stream(
    State(state): State<AppState>,
    Json(body): Json<Context>,
) -> Result<Response, ApiError> {
    let params = chat_params(&state, body)?;
    let stream = state
        .chat
        .rephrase_message_stream(
            &params.sources,
            &params.query,
            &params.history,
            params.subject.as_deref(),
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Error while rephrasing the query");
            ApiError::rephrase()
        })?;
    Ok(sse(stream))
}

// ============ Answers ============

async fn handle_answer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Context>,
) -> Result<Response, ApiError> {
    let params = chat_params(&state, body)?;
    let answer = state
        .chat
        .chat_message(
            &params.query,
            &params.history,
            &params.sources,
            params.subject.as_deref(),
        )
        .await
        .map_err(|e| pipeline_error(e, ApiError::answer))?;

    let collection = state
        .data_collection
        .for_origin(header_str(&headers, header::ORIGIN.as_str()))
        .await;
    let conversation_id = header_str(&headers, X_CONVERSATION_ID).and_then(|c| Uuid::parse_str(c.trim()).ok());
    let registered = collection
        .register_chat_data(
            header_str(&headers, X_SESSION_ID),
            &params.query,
            conversation_id,
            &answer,
            &params.sources,
        )
        .await?;

    let mut response = Json(answer).into_response();
    if let Some((conversation_id, message_id)) = registered {
        for (name, id) in [(X_CONVERSATION_ID, conversation_id), (X_MESSAGE_ID, message_id)] {
            if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
                response.headers_mut().insert(name, value);
            }
        }
    }
    Ok(response)
}

async fn handle_stream(
    State(state): State<AppState>,
    Json(body): Json<Context>,
) -> Result<Response, ApiError> {
    let params = chat_params(&state, body)?;
    info!(subject = ?params.subject, "q_and_a_stream");
    let stream = state
        .chat
        .chat_message_stream(
            &params.query,
            &params.history,
            &params.sources,
            params.subject.as_deref(),
        )
        .await
        .map_err(|e| pipeline_error(e, ApiError::stream))?;
    Ok(sse(stream))
}

// ============ Agent ============

async fn handle_agent(
    State(state): State<AppState>,
    Json(body): Json<AgentContext>,
) -> Result<Json<AgentResponse>, ApiError> {
    let response = state
        .agent
        .run(body)
        .await
        .map_err(|e| pipeline_error(e, ApiError::agent))?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct DocumentClick {
    doc_id: Uuid,
    message_id: Uuid,
}

async fn handle_document_click(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DocumentClick>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let collection = state
        .data_collection
        .for_origin(header_str(&headers, header::ORIGIN.as_str()))
        .await;
    collection
        .register_document_click(body.doc_id, body.message_id)
        .await?;
    Ok(Json(json!({ "registered": collection.should_collect })))
}
