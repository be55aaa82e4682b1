//! In-memory [`VectorStore`] and [`MetadataStore`] implementations for
//! tests.
//!
//! State lives in `HashMap`s and `Vec`s behind `std::sync::RwLock`.
//! Vector search is brute-force cosine similarity over every stored point,
//! with the same filter, threshold and grouping semantics as the Qdrant
//! backend.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::{
    Bookmark, CollectionSchema, CorpusQtyRow, Document, MetaDocument, PointId, ScoredPoint,
};
use crate::vector::cosine_similarity;

use super::{payload_path, BookmarkChange, MetadataStore, SearchRequest, VectorStore};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

// ============ Vector store ============

#[derive(Debug, Clone)]
struct StoredPoint {
    id: PointId,
    vector: Vec<f32>,
    payload: Map<String, Value>,
}

/// Brute-force vector store keyed by collection name.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Vec<StoredPoint>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty collection. Existing points are kept.
    pub fn create_collection(&self, name: &str) -> Result<()> {
        write(&self.collections)?.entry(name.to_string()).or_default();
        Ok(())
    }

    /// Insert a point, creating the collection if needed.
    pub fn upsert(&self, collection: &str, id: PointId, vector: Vec<f32>, payload: Value) -> Result<()> {
        let payload = match payload {
            Value::Object(map) => map,
            other => return Err(anyhow!("payload must be a JSON object, got {}", other)),
        };
        let mut collections = write(&self.collections)?;
        let points = collections.entry(collection.to_string()).or_default();
        points.retain(|p| p.id != id);
        points.push(StoredPoint {
            id,
            vector,
            payload,
        });
        Ok(())
    }

    fn ranked(&self, collection: &str, req: &SearchRequest) -> Result<Vec<ScoredPoint>> {
        let collections = read(&self.collections)?;
        let points = match collections.get(collection) {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };

        let mut hits: Vec<ScoredPoint> = points
            .iter()
            .filter(|p| req.filter.as_ref().map_or(true, |f| f.matches(Some(&p.payload))))
            .map(|p| ScoredPoint {
                id: p.id.clone(),
                version: Some(0),
                score: cosine_similarity(&req.vector, &p.vector),
                payload: Some(project(&p.payload, req.payload_keys.as_deref())),
                vector: req.with_vectors.then(|| p.vector.clone()),
            })
            .filter(|hit| req.score_threshold.map_or(true, |t| hit.score >= t))
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(hits)
    }
}

/// Keep only the requested payload keys. A dotted key keeps its nested
/// value under the same nesting.
fn project(payload: &Map<String, Value>, keys: Option<&[String]>) -> Map<String, Value> {
    let keys = match keys {
        Some(k) => k,
        None => return payload.clone(),
    };
    let mut out = Map::new();
    for key in keys {
        let value = match payload_path(payload, key) {
            Some(v) => v.clone(),
            None => continue,
        };
        let parts: Vec<&str> = key.split('.').collect();
        insert_path(&mut out, &parts, value);
    }
    out
}

fn insert_path(map: &mut Map<String, Value>, parts: &[&str], value: Value) {
    match parts {
        [] => {}
        [last] => {
            map.insert(last.to_string(), value);
        }
        [head, rest @ ..] => {
            let entry = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(inner) = entry {
                insert_path(inner, rest, value);
            }
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = read(&self.collections)?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn search(&self, collection: &str, req: &SearchRequest) -> Result<Vec<ScoredPoint>> {
        let mut hits = self.ranked(collection, req)?;
        hits.truncate(req.limit);
        Ok(hits)
    }

    async fn search_groups(
        &self,
        collection: &str,
        req: &SearchRequest,
        group_by: &str,
        group_size: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let hits = self.ranked(collection, req)?;
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<ScoredPoint>> = HashMap::new();

        for hit in hits {
            let key = match hit.payload.as_ref().and_then(|p| payload_path(p, group_by)) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => continue,
            };
            if !groups.contains_key(&key) {
                if order.len() >= req.limit {
                    continue;
                }
                order.push(key.clone());
            }
            let group = groups.entry(key).or_default();
            if group.len() < group_size {
                group.push(hit);
            }
        }

        Ok(order
            .into_iter()
            .flat_map(|k| groups.remove(&k).unwrap_or_default())
            .collect())
    }
}

// ============ Metadata store ============

#[derive(Debug, Clone)]
struct StoredSession {
    user_id: Uuid,
    end_at: NaiveDateTime,
    host: String,
}

/// A chat message recorded by data collection.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub content: String,
}

/// A document returned with an answer, and whether it was clicked.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedReturnedDocument {
    pub message_id: Uuid,
    pub document_id: Uuid,
    pub is_clicked: bool,
}

/// Relational metadata held in memory.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    collections: RwLock<Vec<CollectionSchema>>,
    corpus_rows: RwLock<Vec<CorpusQtyRow>>,
    api_keys: RwLock<HashSet<Vec<u8>>>,
    endpoint_requests: RwLock<Vec<(Uuid, String, u16)>>,
    meta_documents: RwLock<Vec<(String, MetaDocument)>>,
    users: RwLock<HashSet<Uuid>>,
    sessions: RwLock<HashMap<Uuid, StoredSession>>,
    bookmarks: RwLock<Vec<Bookmark>>,
    data_quality_errors: RwLock<Vec<(Uuid, String)>>,
    process_states: RwLock<Vec<(Uuid, String)>>,
    campaign_active: RwLock<bool>,
    messages: RwLock<Vec<RecordedMessage>>,
    returned_documents: RwLock<Vec<RecordedReturnedDocument>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- seeding ----

    pub fn add_collection(&self, schema: CollectionSchema) -> Result<()> {
        write(&self.collections)?.push(schema);
        Ok(())
    }

    pub fn add_corpus_row(&self, row: CorpusQtyRow) -> Result<()> {
        write(&self.corpus_rows)?.push(row);
        Ok(())
    }

    /// Register an active API key by its SHA-256 digest.
    pub fn add_api_key_digest(&self, digest: Vec<u8>) -> Result<()> {
        write(&self.api_keys)?.insert(digest);
        Ok(())
    }

    pub fn add_meta_document(&self, model: &str, doc: MetaDocument) -> Result<()> {
        write(&self.meta_documents)?.push((model.to_string(), doc));
        Ok(())
    }

    pub fn add_user(&self, user_id: Uuid) -> Result<()> {
        write(&self.users)?.insert(user_id);
        Ok(())
    }

    pub fn set_campaign_active(&self, active: bool) -> Result<()> {
        *write(&self.campaign_active)? = active;
        Ok(())
    }

    // ---- inspection ----

    pub fn endpoint_requests(&self) -> Result<Vec<(Uuid, String, u16)>> {
        Ok(read(&self.endpoint_requests)?.clone())
    }

    pub fn data_quality_errors(&self) -> Result<Vec<(Uuid, String)>> {
        Ok(read(&self.data_quality_errors)?.clone())
    }

    pub fn process_states(&self) -> Result<Vec<(Uuid, String)>> {
        Ok(read(&self.process_states)?.clone())
    }

    pub fn messages(&self) -> Result<Vec<RecordedMessage>> {
        Ok(read(&self.messages)?.clone())
    }

    pub fn returned_documents(&self) -> Result<Vec<RecordedReturnedDocument>> {
        Ok(read(&self.returned_documents)?.clone())
    }

    /// Host recorded for a session.
    pub fn session_host(&self, session_id: Uuid) -> Result<Option<String>> {
        Ok(read(&self.sessions)?.get(&session_id).map(|s| s.host.clone()))
    }

    fn user_exists(&self, user_id: Uuid) -> Result<bool> {
        Ok(read(&self.users)?.contains(&user_id))
    }

    fn record_message(&self, conversation_id: Uuid, user_id: Uuid, role: &str, content: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        write(&self.messages)?.push(RecordedMessage {
            id,
            conversation_id,
            user_id,
            role: role.to_string(),
            content: content.to_string(),
        });
        Ok(id)
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn collections(&self) -> Result<Vec<CollectionSchema>> {
        Ok(read(&self.collections)?.clone())
    }

    async fn corpus_doc_counts(&self) -> Result<Vec<CorpusQtyRow>> {
        Ok(read(&self.corpus_rows)?.clone())
    }

    async fn check_api_key(&self, digest: &[u8]) -> Result<bool> {
        Ok(read(&self.api_keys)?.contains(digest))
    }

    async fn register_endpoint(&self, session_id: Uuid, endpoint: &str, http_code: u16) -> Result<()> {
        write(&self.endpoint_requests)?.push((session_id, endpoint.to_string(), http_code));
        Ok(())
    }

    async fn subjects(&self, model: &str) -> Result<Vec<MetaDocument>> {
        Ok(read(&self.meta_documents)?
            .iter()
            .filter(|(m, d)| m == model && d.type_title == "subject")
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn subject(&self, title: &str, model: &str) -> Result<Option<MetaDocument>> {
        Ok(read(&self.meta_documents)?
            .iter()
            .find(|(m, d)| m == model && d.type_title == "subject" && d.title == title)
            .map(|(_, d)| d.clone()))
    }

    async fn journey_documents(&self, types: &[&str], sdg: i64, model: &str) -> Result<Vec<MetaDocument>> {
        Ok(read(&self.meta_documents)?
            .iter()
            .filter(|(m, d)| {
                m == model && types.contains(&d.type_title.as_str()) && d.sdg_related.contains(&sdg)
            })
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn get_or_create_user(&self, user_id: Option<Uuid>) -> Result<Uuid> {
        let mut users = write(&self.users)?;
        if let Some(id) = user_id {
            if users.contains(&id) {
                return Ok(id);
            }
        }
        let id = Uuid::new_v4();
        users.insert(id);
        Ok(id)
    }

    async fn get_or_create_session(
        &self,
        user_id: Uuid,
        session_id: Option<Uuid>,
        host: &str,
    ) -> Result<Option<Uuid>> {
        if !self.user_exists(user_id)? {
            return Ok(None);
        }
        let now = Utc::now().naive_utc();
        let mut sessions = write(&self.sessions)?;
        if let Some(id) = session_id {
            if let Some(s) = sessions.get(&id) {
                if s.user_id == user_id && s.end_at > now {
                    return Ok(Some(id));
                }
            }
        }
        let id = Uuid::new_v4();
        sessions.insert(
            id,
            StoredSession {
                user_id,
                end_at: now + Duration::hours(24),
                host: host.to_string(),
            },
        );
        Ok(Some(id))
    }

    async fn bookmarks(&self, user_id: Uuid) -> Result<Option<Vec<Bookmark>>> {
        if !self.user_exists(user_id)? {
            return Ok(None);
        }
        Ok(Some(
            read(&self.bookmarks)?
                .iter()
                .filter(|b| b.inferred_user_id == user_id)
                .cloned()
                .collect(),
        ))
    }

    async fn add_bookmark(&self, user_id: Uuid, document_id: Uuid) -> Result<BookmarkChange> {
        if !self.user_exists(user_id)? {
            return Ok(BookmarkChange::UserNotFound);
        }
        let mut bookmarks = write(&self.bookmarks)?;
        if bookmarks
            .iter()
            .any(|b| b.inferred_user_id == user_id && b.document_id == document_id)
        {
            return Ok(BookmarkChange::AlreadyExists);
        }
        bookmarks.push(Bookmark {
            document_id,
            inferred_user_id: user_id,
            created_at: Utc::now().naive_utc(),
        });
        Ok(BookmarkChange::Done)
    }

    async fn delete_bookmark(&self, user_id: Uuid, document_id: Uuid) -> Result<BookmarkChange> {
        if !self.user_exists(user_id)? {
            return Ok(BookmarkChange::UserNotFound);
        }
        let mut bookmarks = write(&self.bookmarks)?;
        let before = bookmarks.len();
        bookmarks.retain(|b| !(b.inferred_user_id == user_id && b.document_id == document_id));
        if bookmarks.len() == before {
            Ok(BookmarkChange::NotFound)
        } else {
            Ok(BookmarkChange::Done)
        }
    }

    async fn delete_bookmarks(&self, user_id: Uuid) -> Result<Option<u64>> {
        if !self.user_exists(user_id)? {
            return Ok(None);
        }
        let mut bookmarks = write(&self.bookmarks)?;
        let before = bookmarks.len();
        bookmarks.retain(|b| b.inferred_user_id != user_id);
        Ok(Some((before - bookmarks.len()) as u64))
    }

    async fn write_data_quality_error(&self, document_id: Uuid, error_info: &str) -> Result<Uuid> {
        let mut errors = write(&self.data_quality_errors)?;
        if errors.iter().any(|(d, _)| *d == document_id) {
            return Err(anyhow!("data quality error already logged for {}", document_id));
        }
        errors.push((document_id, error_info.to_string()));
        Ok(Uuid::new_v4())
    }

    async fn write_process_state(&self, document_id: Uuid, state: &str) -> Result<Uuid> {
        write(&self.process_states)?.push((document_id, state.to_string()));
        Ok(Uuid::new_v4())
    }

    async fn current_campaign_active(&self) -> Result<bool> {
        Ok(*read(&self.campaign_active)?)
    }

    async fn user_from_session(&self, session_id: Uuid) -> Result<Option<Uuid>> {
        Ok(read(&self.sessions)?.get(&session_id).map(|s| s.user_id))
    }

    async fn write_user_query(&self, user_id: Uuid, query: &str, conversation_id: Option<Uuid>) -> Result<Uuid> {
        let conversation_id = conversation_id.unwrap_or_else(Uuid::new_v4);
        self.record_message(conversation_id, user_id, "user", query)?;
        Ok(conversation_id)
    }

    async fn write_chat_answer(
        &self,
        user_id: Uuid,
        answer: &str,
        sources: &[Document],
        conversation_id: Uuid,
    ) -> Result<Uuid> {
        let message_id = self.record_message(conversation_id, user_id, "assistant", answer)?;
        let mut returned = write(&self.returned_documents)?;
        for doc in sources {
            if let Ok(document_id) = Uuid::parse_str(&doc.payload.document_id) {
                returned.push(RecordedReturnedDocument {
                    message_id,
                    document_id,
                    is_clicked: false,
                });
            }
        }
        Ok(message_id)
    }

    async fn update_returned_document_click(&self, document_id: Uuid, message_id: Uuid) -> Result<()> {
        for doc in write(&self.returned_documents)?.iter_mut() {
            if doc.document_id == document_id && doc.message_id == message_id {
                doc.is_clicked = true;
            }
        }
        Ok(())
    }
}
