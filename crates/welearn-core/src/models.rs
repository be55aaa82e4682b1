//! Core data models shared by the search, chat, and tutor pipelines.
//!
//! Field names follow the JSON wire format consumed by the front-end and
//! stored in the vector database payloads, so several structs keep
//! upper-case or `document_*` names verbatim through serde renames.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============ Vector store points ============

/// Identifier of a vector-store point: either an unsigned integer or a UUID string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointId {
    Num(u64),
    Uuid(String),
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointId::Num(n) => write!(f, "{}", n),
            PointId::Uuid(s) => write!(f, "{}", s),
        }
    }
}

/// A slice returned by a similarity search, with its score, payload, and
/// (optionally) its embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: PointId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub score: f32,
    #[serde(default)]
    pub payload: Option<Map<String, Value>>,
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
}

impl ScoredPoint {
    /// Returns a top-level payload value as a string slice, if present and a string.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.as_ref()?.get(key)?.as_str()
    }

    /// The `document_id` this slice belongs to.
    pub fn document_id(&self) -> Option<&str> {
        self.payload_str("document_id")
    }
}

/// Payload stored alongside every slice in the vector database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentPayload {
    pub document_corpus: String,
    pub document_desc: String,
    pub document_details: Map<String, Value>,
    pub document_id: String,
    pub document_lang: String,
    pub document_sdg: Vec<i64>,
    pub document_title: String,
    pub document_url: String,
    pub slice_content: String,
    pub slice_sdg: Option<i64>,
}

/// A scored document as exchanged with clients (chat sources, tutor results).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub score: f32,
    pub payload: DocumentPayload,
}

impl Document {
    /// Converts a search hit into a typed document, tolerating missing fields.
    pub fn from_point(point: &ScoredPoint) -> Self {
        let payload = point
            .payload
            .clone()
            .and_then(|p| serde_json::from_value(Value::Object(p)).ok())
            .unwrap_or_default();
        Self {
            score: point.score,
            payload,
        }
    }
}

// ============ Collections ============

/// A vector collection parsed from its `collection_welearn_{lang}_{model}` name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub lang: String,
    pub model: String,
    pub name: String,
}

/// A corpus entry as listed by `GET /search/collections`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub corpus: String,
    pub name: String,
    pub lang: String,
    pub model: String,
}

impl CollectionSchema {
    pub fn new(name: String, lang: String, model: String) -> Self {
        Self {
            corpus: format!("{}_{}_{}", name, lang, model),
            name,
            lang,
            model,
        }
    }
}

// ============ Search ============

/// A query that is either a single string or a batch of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryInput {
    One(String),
    Many(Vec<String>),
}

impl QueryInput {
    /// True when there is no non-blank text to search for.
    pub fn is_empty(&self) -> bool {
        match self {
            QueryInput::One(q) => q.trim().is_empty(),
            QueryInput::Many(qs) => qs.iter().all(|q| q.trim().is_empty()),
        }
    }

    /// Flattens the input into a list of queries.
    pub fn into_vec(self) -> Vec<String> {
        match self {
            QueryInput::One(q) => vec![q],
            QueryInput::Many(qs) => qs,
        }
    }
}

impl From<&str> for QueryInput {
    fn from(q: &str) -> Self {
        QueryInput::One(q.to_string())
    }
}

impl From<String> for QueryInput {
    fn from(q: String) -> Self {
        QueryInput::One(q)
    }
}

impl From<Vec<String>> for QueryInput {
    fn from(qs: Vec<String>) -> Self {
        QueryInput::Many(qs)
    }
}

/// Optional SDG restriction sent as a request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SdgFilter {
    #[serde(default)]
    pub sdg_filter: Option<Vec<i64>>,
}

/// Body of the slice/document search endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub query: Option<QueryInput>,
    #[serde(default)]
    pub corpora: Option<Vec<String>>,
    #[serde(default)]
    pub sdg_filter: Option<Vec<i64>>,
}

/// Fully-resolved search parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedSearchQuery {
    pub query: QueryInput,
    pub corpora: Option<Vec<String>>,
    pub sdg_filter: Option<Vec<i64>>,
    pub nb_results: usize,
    pub subject: Option<String>,
    pub influence_factor: f32,
    pub relevance_factor: f32,
    pub concatenate: bool,
}

impl EnhancedSearchQuery {
    pub fn new(query: impl Into<QueryInput>) -> Self {
        Self {
            query: query.into(),
            corpora: None,
            sdg_filter: None,
            nb_results: 30,
            subject: None,
            influence_factor: 2.0,
            relevance_factor: 1.0,
            concatenate: true,
        }
    }

    /// A copy of these parameters targeting a different single query.
    pub fn with_query(&self, query: String) -> Self {
        Self {
            query: QueryInput::One(query),
            ..self.clone()
        }
    }

    /// The query as a single string. Batches are joined with a space.
    pub fn query_text(&self) -> String {
        match &self.query {
            QueryInput::One(q) => q.clone(),
            QueryInput::Many(qs) => qs.join(" "),
        }
    }
}

/// Inclusive numeric range on a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub gte: Option<f64>,
    pub lte: Option<f64>,
}

/// Payload restrictions applied to a vector search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    pub slice_sdg: Option<Vec<i64>>,
    pub document_corpus: Option<Vec<String>>,
    pub readability: Option<ValueRange>,
}

/// Whether results are individual slices or one best slice per document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMethod {
    BySlices,
    ByDocument,
}

// ============ Chat ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Conversation context sent by the chat front-end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub sources: Vec<Document>,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    Valid,
    Invalid,
    RefToPast,
}

/// Standalone reformulation of the user's last question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReformulatedQueryResponse {
    #[serde(rename = "STANDALONE_QUESTION_EN", default)]
    pub standalone_question_en: Option<String>,
    #[serde(rename = "STANDALONE_QUESTION_FR", default)]
    pub standalone_question_fr: Option<String>,
    #[serde(rename = "USER_LANGUAGE", default)]
    pub user_language: Option<String>,
    #[serde(rename = "QUERY_STATUS", default)]
    pub query_status: Option<QueryStatus>,
}

/// Follow-up questions suggested to the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReformulatedQuestionsResponse {
    #[serde(rename = "NEW_QUESTIONS")]
    pub new_questions: Vec<String>,
}

/// Input of the conversational agent endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub sdg_filter: Option<Vec<i64>>,
    #[serde(default)]
    pub corpora: Option<Vec<String>>,
}

/// Output of the conversational agent endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub content: Option<String>,
    pub docs: Option<Vec<ScoredPoint>>,
    pub thread_id: String,
}

// ============ Tutor ============

/// Summary and themes extracted from one uploaded document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractorOutput {
    #[serde(default)]
    pub original_document: String,
    pub summary: String,
    #[serde(default)]
    pub themes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractorOutputList {
    pub extracts: Vec<ExtractorOutput>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TutorSearchResponse {
    pub extracts: Vec<ExtractorOutput>,
    pub nb_results: usize,
    pub documents: Vec<ScoredPoint>,
}

/// Request body of `POST /tutor/syllabus`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TutorSyllabusRequest {
    #[serde(default)]
    pub extracts: Vec<ExtractorOutput>,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub course_title: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// One syllabus draft together with the agent that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyllabusResponseAgent {
    pub content: String,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "default".to_string()
}

impl SyllabusResponseAgent {
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyllabusResponse {
    pub syllabus: Vec<SyllabusResponseAgent>,
    pub documents: Vec<Document>,
    pub extracts: Vec<ExtractorOutput>,
}

/// Request body of `POST /tutor/syllabus/feedback`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyllabusFeedback {
    pub syllabus: Vec<SyllabusResponseAgent>,
    pub feedback: String,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub extracts: Vec<ExtractorOutput>,
}

// ============ Micro learning & metrics ============

/// Kind of a micro-learning journey section, mapped from meta-document types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JourneySectionType {
    Introduction,
    Target,
}

impl JourneySectionType {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "introduction" => Some(Self::Introduction),
            "target" => Some(Self::Target),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Introduction => "introduction",
            Self::Target => "target",
        }
    }

    /// Readability band of documents suited to this section.
    pub fn readability(&self) -> ValueRange {
        match self {
            Self::Introduction => ValueRange {
                gte: Some(60.0),
                lte: Some(100.0),
            },
            Self::Target => ValueRange {
                gte: Some(0.0),
                lte: Some(60.0),
            },
        }
    }
}

/// A meta document (SDG introduction/target text or subject description).
#[derive(Debug, Clone, PartialEq)]
pub struct MetaDocument {
    pub title: String,
    pub full_content: String,
    pub type_title: String,
    pub sdg_related: Vec<i64>,
    pub embedding: Vec<u8>,
}

/// One section of a micro-learning journey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneySection {
    pub title: String,
    pub content: String,
    pub documents: Vec<ScoredPoint>,
}

/// Document counts of one corpus, as reported by the metric endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusQtyDocInfo {
    pub corpus: String,
    pub url: String,
    pub qty_total: i64,
    pub qty_in_qdrant: i64,
}

/// Raw joined row behind [`CorpusQtyDocInfo`]; any field may be missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorpusQtyRow {
    pub source_name: String,
    pub main_url: Option<String>,
    pub qty_total: Option<i64>,
    pub qty_in_qdrant: Option<i64>,
}

impl CorpusQtyRow {
    /// Validates the row into a reportable entry.
    pub fn validate(&self) -> Result<CorpusQtyDocInfo, String> {
        let url = self
            .main_url
            .clone()
            .ok_or_else(|| format!("corpus {} has no url", self.source_name))?;
        let qty_total = self
            .qty_total
            .ok_or_else(|| format!("corpus {} has no document count", self.source_name))?;
        let qty_in_qdrant = self
            .qty_in_qdrant
            .ok_or_else(|| format!("corpus {} has no indexed count", self.source_name))?;
        Ok(CorpusQtyDocInfo {
            corpus: self.source_name.clone(),
            url,
            qty_total,
            qty_in_qdrant,
        })
    }
}

// ============ Users ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    pub document_id: uuid::Uuid,
    pub inferred_user_id: uuid::Uuid,
    pub created_at: chrono::NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_id_untagged() {
        let num: PointId = serde_json::from_str("42").unwrap();
        assert_eq!(num, PointId::Num(42));
        let uuid: PointId = serde_json::from_str("\"a-b\"").unwrap();
        assert_eq!(uuid.to_string(), "a-b");
    }

    #[test]
    fn test_collection_schema_corpus() {
        let c = CollectionSchema::new("conversation".into(), "fr".into(), "model".into());
        assert_eq!(c.corpus, "conversation_fr_model");
    }

    #[test]
    fn test_query_input_empty() {
        assert!(QueryInput::from("  ").is_empty());
        assert!(QueryInput::Many(vec![]).is_empty());
        assert!(!QueryInput::Many(vec!["".into(), "x".into()]).is_empty());
    }

    #[test]
    fn test_reformulated_query_wire_names() {
        let raw = r#"{"STANDALONE_QUESTION_EN":"q","QUERY_STATUS":"REF_TO_PAST"}"#;
        let r: ReformulatedQueryResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(r.standalone_question_en.as_deref(), Some("q"));
        assert_eq!(r.query_status, Some(QueryStatus::RefToPast));
        assert!(r.user_language.is_none());
    }

    #[test]
    fn test_document_from_point_tolerates_partial_payload() {
        let mut payload = Map::new();
        payload.insert("document_title".into(), Value::String("t".into()));
        let point = ScoredPoint {
            id: PointId::Num(1),
            version: None,
            score: 0.7,
            payload: Some(payload),
            vector: None,
        };
        let doc = Document::from_point(&point);
        assert_eq!(doc.payload.document_title, "t");
        assert_eq!(doc.score, 0.7);
    }

    #[test]
    fn test_corpus_row_validation() {
        let row = CorpusQtyRow {
            source_name: "ted".into(),
            main_url: Some("https://ted.com".into()),
            qty_total: Some(10),
            qty_in_qdrant: None,
        };
        assert!(row.validate().is_err());
    }
}
