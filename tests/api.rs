//! End-to-end tests of the HTTP API over in-memory stores and a scripted LLM.

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use welearn_api::config::Config;
use welearn_api::embedding::Embedder;
use welearn_api::llm::ScriptedLlm;
use welearn_api::server::{build_router, AppState};
use welearn_core::models::{CorpusQtyRow, MetaDocument, PointId};
use welearn_core::store::memory::{InMemoryMetadataStore, InMemoryVectorStore};
use welearn_core::store::MetadataStore;

const API_KEY: &str = "welearn-test-key";
const COLLECTION: &str = "collection_welearn_en_all-minilm-l6-v2";
const MODEL: &str = "all-minilm-l6-v2";
const EN_QUERY: &str = "What are the effects of climate change on agriculture and food security?";

struct FlatEmbedder;

#[async_trait]
impl Embedder for FlatEmbedder {
    async fn embed(&self, _model: &str, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }
}

fn vectors() -> InMemoryVectorStore {
    let store = InMemoryVectorStore::new();
    store.create_collection(COLLECTION).unwrap();
    let points = [
        (1, vec![1.0, 0.0], "Drought and crop yields", 13),
        (2, vec![0.9, 0.1], "Soil health in a warming world", 2),
    ];
    for (id, vector, title, sdg) in points {
        store
            .upsert(
                COLLECTION,
                PointId::Num(id),
                vector,
                json!({
                    "document_id": format!("00000000-0000-4000-8000-00000000000{}", id),
                    "document_title": title,
                    "document_url": format!("https://example.org/{}", id),
                    "document_corpus": "ted",
                    "document_sdg": [sdg],
                    "slice_content": format!("{} slice", title),
                    "slice_sdg": sdg,
                }),
            )
            .unwrap();
    }
    store
}

struct Harness {
    app: Router,
    metadata: Arc<InMemoryMetadataStore>,
    chat: Arc<ScriptedLlm>,
}

fn harness_with(config: Config, chat: ScriptedLlm, tutor: ScriptedLlm) -> Harness {
    let metadata = Arc::new(InMemoryMetadataStore::new());
    metadata
        .add_api_key_digest(Sha256::digest(API_KEY.as_bytes()).to_vec())
        .unwrap();
    let chat = Arc::new(chat);
    let state = AppState::new(
        config,
        Arc::new(vectors()),
        metadata.clone(),
        Arc::new(FlatEmbedder),
        chat.clone(),
        Arc::new(tutor),
    );
    Harness {
        app: build_router(state).unwrap(),
        metadata,
        chat,
    }
}

fn harness(chat: ScriptedLlm) -> Harness {
    harness_with(Config::default(), chat, ScriptedLlm::new())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-api-key", API_KEY)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> Response {
    app.clone().oneshot(req).await.unwrap()
}

async fn body_bytes(resp: Response) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(resp: Response) -> Value {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}

// ============ Root & health ============

#[tokio::test]
async fn test_root_and_health() {
    let h = harness(ScriptedLlm::new());

    let resp = send(&h.app, get("/")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["title"], "WeLearn");
    assert_eq!(body["api_version"], "/api/v1");

    let resp = send(&h.app, get("/health")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-process-time"));
    assert_eq!(body_json(resp).await, json!({ "status": "OK" }));
}

// ============ Middleware ============

#[tokio::test]
async fn test_api_key_required() {
    let h = harness(ScriptedLlm::new());

    let req = Request::builder()
        .uri("/api/v1/search/collections")
        .body(Body::empty())
        .unwrap();
    let resp = send(&h.app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    assert_eq!(body["detail"]["code"], "UNAUTHORIZED");
    assert_eq!(body["detail"]["message"], "Missing or invalid API key");

    let req = Request::builder()
        .uri("/api/v1/search/collections")
        .header("x-api-key", "wrong")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&h.app, req).await.status(), StatusCode::UNAUTHORIZED);

    let resp = send(&h.app, get("/api/v1/search/collections")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!([]));
}

#[tokio::test]
async fn test_api_key_can_be_disabled() {
    let mut config = Config::default();
    config.server.require_api_key = false;
    let h = harness_with(config, ScriptedLlm::new(), ScriptedLlm::new());
    let req = Request::builder()
        .uri("/api/v1/search/collections")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&h.app, req).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_request_monitor_registers_session_calls() {
    let h = harness(ScriptedLlm::new());
    let session_id = Uuid::new_v4();
    let req = Request::builder()
        .uri("/api/v1/search/collections")
        .header("x-api-key", API_KEY)
        .header("x-session-id", session_id.to_string())
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&h.app, req).await.status(), StatusCode::OK);

    let mut recorded = Vec::new();
    for _ in 0..50 {
        recorded = h.metadata.endpoint_requests().unwrap();
        if !recorded.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        recorded,
        vec![(session_id, "/api/v1/search/collections".to_string(), 200)]
    );
}

#[tokio::test]
async fn test_cors_allows_matching_origin() {
    let mut config = Config::default();
    config.server.client_origins_regex = r"https://.*\.welearn\.test".to_string();
    let h = harness_with(config, ScriptedLlm::new(), ScriptedLlm::new());

    let preflight = |origin: &str| {
        Request::builder()
            .method("OPTIONS")
            .uri("/api/v1/search/by_slices")
            .header("origin", origin)
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap()
    };
    let resp = send(&h.app, preflight("https://app.welearn.test")).await;
    assert_eq!(
        resp.headers()["access-control-allow-origin"],
        "https://app.welearn.test"
    );
    assert_eq!(resp.headers()["access-control-allow-credentials"], "true");

    let resp = send(&h.app, preflight("https://evil.example")).await;
    assert!(!resp.headers().contains_key("access-control-allow-origin"));
}

// ============ Search ============

#[tokio::test]
async fn test_search_by_slices() {
    let h = harness(ScriptedLlm::new());
    let resp = send(
        &h.app,
        post_json("/api/v1/search/by_slices?nb_results=5", json!({ "query": EN_QUERY })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    let hits = body.as_array().unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0]["payload"]["document_title"], "Drought and crop yields");
}

#[tokio::test]
async fn test_search_errors() {
    let h = harness(ScriptedLlm::new());

    let resp = send(&h.app, post_json("/api/v1/search/by_slices", json!({ "query": "" }))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["detail"]["code"], "EMPTY_QUERY");

    let resp = send(
        &h.app,
        post_json(
            "/api/v1/search/by_slices",
            json!({ "query": "La technologie peut-elle aider l'humanité à atténuer les effets du changement climatique ?" }),
        ),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(resp).await, json!("No collection found for this language fr"));

    let resp = send(
        &h.app,
        post_json("/api/v1/search/by_document", json!({ "query": EN_QUERY, "sdg_filter": [17] })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(resp).await, Value::Null);
}

#[tokio::test]
async fn test_search_by_document_filters_sdg() {
    let h = harness(ScriptedLlm::new());
    let resp = send(
        &h.app,
        post_json("/api/v1/search/by_document", json!({ "query": EN_QUERY, "sdg_filter": [2] })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["payload"]["slice_sdg"], 2);
}

#[tokio::test]
async fn test_multiple_by_slices_merges_queries() {
    let h = harness(ScriptedLlm::new());
    let resp = send(
        &h.app,
        post_json(
            "/api/v1/search/multiple_by_slices",
            json!({ "query": [EN_QUERY, "How can farmers adapt their practices to longer droughts?"] }),
        ),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await.as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_collection_search_without_results() {
    let h = harness(ScriptedLlm::new());
    let uri = format!(
        "/api/v1/search/collections/conversation?query={}",
        "What%20are%20the%20effects%20of%20climate%20change%20on%20agriculture%3F"
    );
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap();
    let resp = send(&h.app, req).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body_json(resp).await, json!("No results found"));
}

// ============ Q&A ============

#[tokio::test]
async fn test_reformulate_query() {
    let h = harness(
        ScriptedLlm::new()
            .reply(r#"{"REF_TO_PAST": false}"#)
            .reply(
                r#"{"STANDALONE_QUESTION_EN": "How does drought affect crops?",
                    "STANDALONE_QUESTION_FR": "Comment la sécheresse affecte-t-elle les cultures ?",
                    "USER_LANGUAGE": "en", "QUERY_STATUS": "VALID"}"#,
            ),
    );
    let resp = send(
        &h.app,
        post_json("/api/v1/qna/reformulate/query", json!({ "query": "and drought?", "sources": [] })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["STANDALONE_QUESTION_EN"], "How does drought affect crops?");
    assert_eq!(body["QUERY_STATUS"], "VALID");
}

#[tokio::test]
async fn test_reformulate_query_invalid_and_empty() {
    let h = harness(ScriptedLlm::new().reply(r#"{"REF_TO_PAST": true}"#));
    let resp = send(
        &h.app,
        post_json("/api/v1/qna/reformulate/query", json!({ "query": "what did you say before?" })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["detail"]["code"], "INVALID_QUESTION");

    let resp = send(&h.app, post_json("/api/v1/qna/reformulate/query", json!({ "query": "" }))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["detail"]["code"], "EMPTY_QUERY");
}

#[tokio::test]
async fn test_reformulate_parse_failure() {
    let h = harness(
        ScriptedLlm::new()
            .reply(r#"{"REF_TO_PAST": false}"#)
            .reply("I cannot do that."),
    );
    let resp = send(
        &h.app,
        post_json("/api/v1/qna/reformulate/query", json!({ "query": EN_QUERY })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(resp).await["detail"]["code"], "REFORMULATE_ERROR");
}

#[tokio::test]
async fn test_new_questions() {
    let h = harness(ScriptedLlm::new().reply("What is drought? %% How do soils recover? %% "));
    let resp = send(
        &h.app,
        post_json("/api/v1/qna/reformulate/questions", json!({ "query": EN_QUERY })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        body_json(resp).await["NEW_QUESTIONS"],
        json!(["What is drought?", "How do soils recover?"])
    );
}

#[tokio::test]
async fn test_chat_answer_registers_data() {
    let mut config = Config::default();
    config.data_collection.origin_prefix = "welearn".to_string();
    let h = harness_with(
        config,
        ScriptedLlm::new().reply("Droughts reduce yields [Doc 1]."),
        ScriptedLlm::new(),
    );
    h.metadata.set_campaign_active(true).unwrap();
    let user = h.metadata.get_or_create_user(None).await.unwrap();
    let session = h
        .metadata
        .get_or_create_session(user, None, "localhost")
        .await
        .unwrap()
        .unwrap();

    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/qna/chat/answer")
        .header("x-api-key", API_KEY)
        .header("content-type", "application/json")
        .header("origin", "https://www.welearn.test")
        .header("x-session-id", session.to_string())
        .body(Body::from(json!({ "query": EN_QUERY, "sources": [] }).to_string()))
        .unwrap();
    let resp = send(&h.app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let conversation_id = resp.headers()["x-conversation-id"].to_str().unwrap().to_string();
    assert!(resp.headers().contains_key("x-message-id"));
    assert_eq!(body_json(resp).await, json!("Droughts reduce yields [Doc 1]."));

    let messages = h.metadata.messages().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].conversation_id.to_string(), conversation_id);
}

#[tokio::test]
async fn test_chat_answer_without_session_during_campaign() {
    let h = harness(ScriptedLlm::new().reply("answer"));
    h.metadata.set_campaign_active(true).unwrap();
    let resp = send(&h.app, post_json("/api/v1/qna/chat/answer", json!({ "query": EN_QUERY }))).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["detail"]["code"], "SESSION_ID_NOT_FOUND");
}

#[tokio::test]
async fn test_stream_is_server_sent_events() {
    let h = harness(ScriptedLlm::new().reply("Droughts reduce yields"));
    let resp = send(&h.app, post_json("/api/v1/qna/stream", json!({ "query": EN_QUERY }))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let body = String::from_utf8(body_bytes(resp).await).unwrap();
    assert!(body.contains("data: Droughts "));
    assert!(body.contains("data: yields"));
}

#[tokio::test]
async fn test_rephrase_failure_is_rephrase_error() {
    let h = harness(ScriptedLlm::new().fail("upstream down"));
    let resp = send(&h.app, post_json("/api/v1/qna/chat/rephrase", json!({ "query": "simpler please" }))).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(resp).await["detail"]["code"], "REPHRASE_ERROR");
}

#[tokio::test]
async fn test_sources_truncated_to_max() {
    let h = harness(ScriptedLlm::new().reply("ok"));
    let sources: Vec<Value> = (0..10)
        .map(|i| json!({ "score": 0.9, "payload": { "document_title": format!("Title {}", i), "slice_content": "text" } }))
        .collect();
    let resp = send(
        &h.app,
        post_json("/api/v1/qna/chat/rephrase", json!({ "query": "simpler please", "sources": sources })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let requests = h.chat.requests();
    let prompt = format!("{:?}", requests[0].last().unwrap());
    assert!(prompt.contains("Title 6"));
    assert!(!prompt.contains("Title 7"));
}

#[tokio::test]
async fn test_agent_answers() {
    let h = harness(ScriptedLlm::new().reply("Hello from the agent."));
    let resp = send(
        &h.app,
        post_json("/api/v1/qna/chat/agent", json!({ "query": EN_QUERY, "thread_id": "thread-1" })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["content"], "Hello from the agent.");
    assert_eq!(body["thread_id"], "thread-1");
}

// ============ Tutor ============

fn multipart(files: &[(&str, &str)]) -> Request<Body> {
    let boundary = "welearn-boundary";
    let mut body = String::new();
    for (name, content) in files {
        body.push_str(&format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{n}\"\r\nContent-Type: text/plain\r\n\r\n{c}\r\n",
            b = boundary,
            n = name,
            c = content
        ));
    }
    body.push_str(&format!("--{}--\r\n", boundary));
    Request::builder()
        .method("POST")
        .uri("/api/v1/tutor/search")
        .header("x-api-key", API_KEY)
        .header("content-type", format!("multipart/form-data; boundary={}", boundary))
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_tutor_search() {
    let tutor = ScriptedLlm::new().reply(
        r#"{"extracts": [{"original_document": "Document 1",
            "summary": "Climate change reduces agricultural yields through longer droughts.",
            "themes": ["climate", "agriculture"]}]}"#,
    );
    let h = harness_with(Config::default(), ScriptedLlm::new(), tutor);
    let resp = send(&h.app, multipart(&[("course.txt", "Droughts and crops in the Sahel.")])).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["extracts"][0]["themes"], json!(["climate", "agriculture"]));
    assert_eq!(body["nb_results"], 2);
}

#[tokio::test]
async fn test_tutor_search_rejects_empty_file() {
    let h = harness(ScriptedLlm::new());
    let resp = send(&h.app, multipart(&[("empty.txt", "   ")])).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["detail"]["message"], "added files are empty");
}

#[tokio::test]
async fn test_syllabus_feedback_requires_syllabus() {
    let h = harness(ScriptedLlm::new());
    let resp = send(
        &h.app,
        post_json(
            "/api/v1/tutor/syllabus/feedback",
            json!({ "syllabus": [], "feedback": "shorter", "documents": [], "extracts": [] }),
        ),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

// ============ Micro-learning & metric ============

#[tokio::test]
async fn test_subject_list() {
    let h = harness(ScriptedLlm::new());
    h.metadata
        .add_meta_document(
            MODEL,
            MetaDocument {
                title: "Agronomy".to_string(),
                full_content: String::new(),
                type_title: "subject".to_string(),
                sdg_related: vec![],
                embedding: vec![],
            },
        )
        .unwrap();
    let resp = send(&h.app, get("/api/v1/micro_learning/subject_list")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!(["Agronomy"]));

    let resp = send(
        &h.app,
        get("/api/v1/micro_learning/full_journey?lang=en&sdg=2&subject=Law"),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(resp).await["detail"]["code"], "SUBJECT_NOT_FOUND");
}

#[tokio::test]
async fn test_metric_partial_content() {
    let h = harness(ScriptedLlm::new());
    h.metadata
        .add_corpus_row(CorpusQtyRow {
            source_name: "ted".to_string(),
            main_url: Some("https://ted.com".to_string()),
            qty_total: Some(120),
            qty_in_qdrant: Some(118),
        })
        .unwrap();
    h.metadata
        .add_corpus_row(CorpusQtyRow {
            source_name: "broken".to_string(),
            ..CorpusQtyRow::default()
        })
        .unwrap();
    let resp = send(&h.app, get("/api/v1/metric/nb_docs_info_per_corpus")).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    let body = body_json(resp).await;
    assert_eq!(body, json!([{ "corpus": "ted", "url": "https://ted.com", "qty_total": 120, "qty_in_qdrant": 118 }]));
}

// ============ Users ============

#[tokio::test]
async fn test_user_session_and_bookmarks() {
    let h = harness(ScriptedLlm::new());

    let body = body_json(send(&h.app, get("/api/v1/user/user")).await).await;
    let user_id: Uuid = body["user_id"].as_str().unwrap().parse().unwrap();

    let req = Request::builder()
        .uri(format!("/api/v1/user/session?user_id={}", user_id))
        .header("x-api-key", API_KEY)
        .header("host", "api.welearn.test")
        .body(Body::empty())
        .unwrap();
    let body = body_json(send(&h.app, req).await).await;
    let session_id: Uuid = body["session_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(
        h.metadata.session_host(session_id).unwrap().as_deref(),
        Some("api.welearn.test")
    );

    let document_id = Uuid::new_v4();
    let uri = format!("/api/v1/user/bookmarks?user_id={}&document_id={}", user_id, document_id);
    let add = || {
        Request::builder()
            .method("POST")
            .uri(&uri)
            .header("x-api-key", API_KEY)
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(send(&h.app, add()).await.status(), StatusCode::OK);
    assert_eq!(send(&h.app, add()).await.status(), StatusCode::CONFLICT);

    let list = body_json(send(&h.app, get(&format!("/api/v1/user/bookmarks?user_id={}", user_id))).await).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let delete = |uri: String| {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .header("x-api-key", API_KEY)
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(send(&h.app, delete(uri.clone())).await.status(), StatusCode::OK);
    assert_eq!(send(&h.app, delete(uri.clone())).await.status(), StatusCode::NOT_FOUND);

    let unknown = format!("/api/v1/user/bookmarks?user_id={}", Uuid::new_v4());
    assert_eq!(send(&h.app, get(&unknown)).await.status(), StatusCode::NOT_FOUND);
}
