//! Storage abstractions for the WeLearn API.
//!
//! Two async traits split the backends:
//!
//! | Trait | Production backend | Test backend |
//! |-------|--------------------|--------------|
//! | [`VectorStore`] | Qdrant REST (`welearn_api::qdrant`) | [`memory::InMemoryVectorStore`] |
//! | [`MetadataStore`] | Postgres via sqlx (`welearn_api::pg_store`) | [`memory::InMemoryMetadataStore`] |
//!
//! Implementations must be `Send + Sync` to live behind an `Arc` in the
//! server state.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{
    Bookmark, CollectionSchema, CorpusQtyRow, Document, MetaDocument, ScoredPoint,
};

// ============ Vector search ============

/// A payload condition. Keys may be dotted paths into nested objects
/// (e.g. `document_details.readability`).
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The payload value (or any element of an array value) is one of `any`.
    MatchAny { key: String, any: Vec<Value> },
    /// The payload value (or any element of an array value) equals `value`.
    MatchValue { key: String, value: Value },
    /// The numeric payload value lies in `[gte, lte]`.
    Range {
        key: String,
        gte: Option<f64>,
        lte: Option<f64>,
    },
}

impl Condition {
    pub fn match_any(key: &str, any: Vec<Value>) -> Self {
        Condition::MatchAny {
            key: key.to_string(),
            any,
        }
    }

    pub fn match_value(key: &str, value: Value) -> Self {
        Condition::MatchValue {
            key: key.to_string(),
            value,
        }
    }

    pub fn range(key: &str, gte: Option<f64>, lte: Option<f64>) -> Self {
        Condition::Range {
            key: key.to_string(),
            gte,
            lte,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Condition::MatchAny { key, .. }
            | Condition::MatchValue { key, .. }
            | Condition::Range { key, .. } => key,
        }
    }
}

/// Conjunction of conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub must: Vec<Condition>,
}

/// Parameters of a nearest-neighbour query.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub vector: Vec<f32>,
    pub filter: Option<Filter>,
    pub limit: usize,
    pub with_vectors: bool,
    /// Payload keys to return; `None` returns the whole payload.
    pub payload_keys: Option<Vec<String>>,
    pub score_threshold: Option<f32>,
}

impl SearchRequest {
    pub fn new(vector: Vec<f32>, limit: usize) -> Self {
        Self {
            vector,
            filter: None,
            limit,
            with_vectors: false,
            payload_keys: None,
            score_threshold: None,
        }
    }
}

/// Vector database operations.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Names of all collections.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Nearest points to `req.vector`, best first.
    async fn search(&self, collection: &str, req: &SearchRequest) -> Result<Vec<ScoredPoint>>;

    /// Nearest points grouped by the payload field `group_by`, returning the
    /// best `group_size` hits of up to `req.limit` groups, flattened.
    async fn search_groups(
        &self,
        collection: &str,
        req: &SearchRequest,
        group_by: &str,
        group_size: usize,
    ) -> Result<Vec<ScoredPoint>>;
}

// ============ Relational metadata ============

/// Outcome of a bookmark mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookmarkChange {
    Done,
    UserNotFound,
    AlreadyExists,
    NotFound,
}

/// Relational operations backing collections, users, micro-learning,
/// metrics, data quality and data collection.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    // ---- corpora ----

    /// `(source_name, lang, model title)` of every corpus/model pair.
    async fn collections(&self) -> Result<Vec<CollectionSchema>>;

    /// Corpus rows joined with their document counts.
    async fn corpus_doc_counts(&self) -> Result<Vec<CorpusQtyRow>>;

    // ---- security & monitoring ----

    /// Whether an active API key has this SHA-256 digest.
    async fn check_api_key(&self, digest: &[u8]) -> Result<bool>;

    async fn register_endpoint(&self, session_id: Uuid, endpoint: &str, http_code: u16)
        -> Result<()>;

    // ---- meta documents ----

    /// Meta documents of type `subject` for an embedding model.
    async fn subjects(&self, model: &str) -> Result<Vec<MetaDocument>>;

    async fn subject(&self, title: &str, model: &str) -> Result<Option<MetaDocument>>;

    /// Meta documents whose type is one of `types` and that relate to `sdg`.
    async fn journey_documents(
        &self,
        types: &[&str],
        sdg: i64,
        model: &str,
    ) -> Result<Vec<MetaDocument>>;

    // ---- users ----

    /// Returns `user_id` if it exists, otherwise a newly created user.
    async fn get_or_create_user(&self, user_id: Option<Uuid>) -> Result<Uuid>;

    /// `None` when the user does not exist.
    async fn get_or_create_session(
        &self,
        user_id: Uuid,
        session_id: Option<Uuid>,
        host: &str,
    ) -> Result<Option<Uuid>>;

    /// `None` when the user does not exist.
    async fn bookmarks(&self, user_id: Uuid) -> Result<Option<Vec<Bookmark>>>;

    async fn add_bookmark(&self, user_id: Uuid, document_id: Uuid) -> Result<BookmarkChange>;

    async fn delete_bookmark(&self, user_id: Uuid, document_id: Uuid) -> Result<BookmarkChange>;

    /// Number of deleted bookmarks, `None` when the user does not exist.
    async fn delete_bookmarks(&self, user_id: Uuid) -> Result<Option<u64>>;

    // ---- data quality ----

    async fn write_data_quality_error(&self, document_id: Uuid, error_info: &str) -> Result<Uuid>;

    async fn write_process_state(&self, document_id: Uuid, state: &str) -> Result<Uuid>;

    // ---- data collection ----

    async fn current_campaign_active(&self) -> Result<bool>;

    async fn user_from_session(&self, session_id: Uuid) -> Result<Option<Uuid>>;

    /// Stores the user query; creates a conversation when none is given.
    /// Returns the conversation id.
    async fn write_user_query(
        &self,
        user_id: Uuid,
        query: &str,
        conversation_id: Option<Uuid>,
    ) -> Result<Uuid>;

    /// Stores the answer and the documents returned with it. Returns the
    /// message id.
    async fn write_chat_answer(
        &self,
        user_id: Uuid,
        answer: &str,
        sources: &[Document],
        conversation_id: Uuid,
    ) -> Result<Uuid>;

    async fn update_returned_document_click(&self, document_id: Uuid, message_id: Uuid)
        -> Result<()>;
}

/// Resolve a dotted key inside a JSON payload.
pub fn payload_path<'a>(payload: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut current = payload.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Evaluate a single condition against a payload.
pub fn condition_matches(cond: &Condition, payload: &serde_json::Map<String, Value>) -> bool {
    let value = match payload_path(payload, cond.key()) {
        Some(v) => v,
        None => return false,
    };
    let candidates: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    match cond {
        Condition::MatchAny { any, .. } => candidates.iter().any(|c| any.iter().any(|a| values_eq(a, c))),
        Condition::MatchValue { value, .. } => candidates.iter().any(|c| values_eq(value, c)),
        Condition::Range { gte, lte, .. } => match value.as_f64() {
            Some(n) => gte.map_or(true, |g| n >= g) && lte.map_or(true, |l| n <= l),
            None => false,
        },
    }
}

fn values_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

impl Filter {
    pub fn matches(&self, payload: Option<&serde_json::Map<String, Value>>) -> bool {
        if self.must.is_empty() {
            return true;
        }
        match payload {
            Some(p) => self.must.iter().all(|c| condition_matches(c, p)),
            None => false,
        }
    }
}
