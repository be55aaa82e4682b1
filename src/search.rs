//! Semantic search over the WeLearn vector collections.
//!
//! # Pipeline
//!
//! ```text
//! query ──► detect language ──► collection_welearn_{lang}_{model}
//!                                        │
//!        subject vector (optional) ──► embed(model, query) + factor·subject
//!                                        │
//!                      filters (slice_sdg, document_corpus)
//!                                        │
//!                 by slices ─────────────┴────────── by document
//!                 (score ≥ threshold)          (group_by document_id, 1 hit)
//!                                        │
//!                         data-quality dedup (background logging)
//!                                        │
//!                          MMR re-rank (θ = relevance_factor)
//!                                        │
//!                       concatenate slices of the same document
//! ```
//!
//! Collection names are cached after the first successful listing.

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, error, info};
use uuid::Uuid;

use welearn_core::lang::detect_language;
use welearn_core::models::{
    Collection, EnhancedSearchQuery, ScoredPoint, SearchFilters, SearchMethod,
};
use welearn_core::quality::remove_duplicates;
use welearn_core::ranking::{concatenate_same_doc_id_slices, sort_slices_using_mmr};
use welearn_core::store::{Condition, Filter, MetadataStore, SearchRequest, VectorStore};
use welearn_core::vector::flavor_with_subject;

use crate::config::SearchConfig;
use crate::embedding::Embedder;
use crate::error::ApiError;

/// Payload fields returned with every hit.
pub const PAYLOAD_KEYS: [&str; 17] = [
    "document_title",
    "document_id",
    "document_url",
    "document_lang",
    "document_corpus",
    "document_desc",
    "document_sdg",
    "slice_content",
    "slice_sdg",
    "document_scrape_date",
    "document_details.authors",
    "document_details.author",
    "document_details.publisher",
    "document_details.journal",
    "document_details.duration",
    "document_details.readability",
    "document_details.source",
];

const DEDUP_KEYS: [&str; 2] = ["document_id", "slice_content"];

pub struct SearchService {
    vectors: Arc<dyn VectorStore>,
    metadata: Arc<dyn MetadataStore>,
    embedder: Arc<dyn Embedder>,
    config: SearchConfig,
    collections: RwLock<Option<Vec<String>>>,
    subject_vectors: OnceCell<HashMap<String, Vec<f32>>>,
}

impl SearchService {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        metadata: Arc<dyn MetadataStore>,
        embedder: Arc<dyn Embedder>,
        config: SearchConfig,
    ) -> Self {
        Self {
            vectors,
            metadata,
            embedder,
            config,
            collections: RwLock::new(None),
            subject_vectors: OnceCell::new(),
        }
    }

    pub fn vectors(&self) -> &Arc<dyn VectorStore> {
        &self.vectors
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    // ============ Collections ============

    /// List the vector collections and refresh the cache.
    pub async fn get_collections(&self) -> Result<Vec<String>> {
        let names = self.vectors.list_collections().await?;
        info!(collections = ?names, "collections");
        *self.collections.write().await = Some(names.clone());
        Ok(names)
    }

    async fn cached_collections(&self) -> Result<Vec<String>> {
        if let Some(names) = self.collections.read().await.as_ref() {
            return Ok(names.clone());
        }
        self.get_collections().await
    }

    /// First collection whose name starts with `{prefix}{lang}`.
    pub async fn get_collection_by_language(&self, lang: &str) -> Result<Collection> {
        let prefix = format!("{}{}", self.config.collection_prefix, lang);
        let names = self.cached_collections().await?;
        let name = names
            .iter()
            .find(|name| name.starts_with(&prefix))
            .ok_or_else(|| {
                ApiError::CollectionNotFound(format!("No collection found for this language {}", lang))
            })?;
        self.collection_info(name)
    }

    /// Parse `{prefix}{lang}_{model}`.
    pub fn collection_info(&self, name: &str) -> Result<Collection> {
        let rest = name
            .strip_prefix(&self.config.collection_prefix)
            .unwrap_or(name);
        let (lang, model) = rest
            .split_once('_')
            .ok_or_else(|| anyhow!("Malformed collection name: {}", name))?;
        Ok(Collection {
            lang: lang.to_string(),
            model: model.to_string(),
            name: name.to_string(),
        })
    }

    // ============ Embeddings ============

    /// Embed `query` with `model`, biased toward `subject_vector` when given.
    pub async fn get_query_embed(
        &self,
        model: &str,
        query: &str,
        subject_vector: Option<&[f32]>,
        influence_factor: f32,
    ) -> Result<Vec<f32>> {
        let started = Instant::now();
        let embedding = self.embedder.embed(model, query).await?;
        debug!(
            model,
            query_length = query.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "query embedded"
        );
        match subject_vector {
            Some(subject) => {
                debug!(influence_factor, "adding subject vector");
                Ok(flavor_with_subject(&embedding, subject, influence_factor))
            }
            None => Ok(embedding),
        }
    }

    /// Vector of a subject, looked up case-insensitively in the subject
    /// vectors file. Missing file or subject yields `None`.
    pub async fn subject_vector(&self, subject: Option<&str>) -> Option<Vec<f32>> {
        let subject = subject.filter(|s| !s.is_empty())?;
        let vectors = self
            .subject_vectors
            .get_or_init(|| async { load_subject_vectors(self.config.subject_vectors_path.as_deref()).await })
            .await;
        info!(subject, "loading subject vector");
        let vector = vectors.get(&subject.to_lowercase()).cloned();
        if vector.is_none() {
            error!(subject, "Subject vector not found");
        }
        vector
    }

    // ============ Search ============

    /// One `MatchAny` per non-empty list, plus a readability range. `None`
    /// when nothing restricts the search.
    pub fn build_filters(&self, filters: Option<&SearchFilters>) -> Option<Filter> {
        let filters = filters?;
        let mut must = Vec::new();
        if let Some(sdgs) = filters.slice_sdg.as_ref().filter(|v| !v.is_empty()) {
            must.push(Condition::match_any(
                "slice_sdg",
                sdgs.iter().map(|s| json!(s)).collect(),
            ));
        }
        if let Some(corpora) = filters.document_corpus.as_ref().filter(|v| !v.is_empty()) {
            must.push(Condition::match_any(
                "document_corpus",
                corpora.iter().map(|c| json!(c)).collect(),
            ));
        }
        if let Some(range) = filters.readability {
            must.push(Condition::range(
                "document_details.readability",
                range.gte,
                range.lte,
            ));
        }
        if must.is_empty() {
            return None;
        }
        Some(Filter { must })
    }

    fn request(
        &self,
        embedding: Vec<f32>,
        filter: Option<Filter>,
        nb_results: usize,
        with_vectors: bool,
    ) -> SearchRequest {
        let mut req = SearchRequest::new(embedding, nb_results);
        req.filter = filter;
        req.with_vectors = with_vectors;
        req.payload_keys = Some(PAYLOAD_KEYS.iter().map(|k| k.to_string()).collect());
        req
    }

    /// Nearest slices above the score threshold, deduplicated.
    pub async fn search(
        &self,
        collection: &str,
        embedding: Vec<f32>,
        filters: Option<&SearchFilters>,
        nb_results: usize,
        with_vectors: bool,
    ) -> Result<Vec<ScoredPoint>> {
        self.search_filtered(collection, embedding, self.build_filters(filters), nb_results, with_vectors)
            .await
    }

    /// [`search`](Self::search) with an already built vector-store filter.
    pub async fn search_filtered(
        &self,
        collection: &str,
        embedding: Vec<f32>,
        filter: Option<Filter>,
        nb_results: usize,
        with_vectors: bool,
    ) -> Result<Vec<ScoredPoint>> {
        let mut req = self.request(embedding, filter, nb_results, with_vectors);
        req.score_threshold = Some(self.config.score_threshold);
        let hits = self.vectors.search(collection, &req).await?;
        debug!(collection, nb_results = hits.len(), "search");
        self.deduplicate(hits)
    }

    /// Best slice of each of the nearest documents.
    pub async fn search_group_by_document(
        &self,
        collection: &str,
        embedding: Vec<f32>,
        filters: Option<&SearchFilters>,
        nb_results: usize,
    ) -> Result<Vec<ScoredPoint>> {
        debug!(collection, "search_group_by_document");
        let req = self.request(embedding, self.build_filters(filters), nb_results, true);
        let hits = self
            .vectors
            .search_groups(collection, &req, "document_id", 1)
            .await?;
        self.deduplicate(hits)
    }

    fn deduplicate(&self, hits: Vec<ScoredPoint>) -> Result<Vec<ScoredPoint>> {
        let dedup = remove_duplicates(&DEDUP_KEYS, hits, false)?;
        if !dedup.duplicates.is_empty() {
            let metadata = Arc::clone(&self.metadata);
            let duplicates = dedup.duplicates;
            tokio::spawn(async move {
                log_duplicates(metadata.as_ref(), &duplicates).await;
            });
        }
        Ok(dedup.kept)
    }

    /// Full search for one query string.
    #[tracing::instrument(skip(self, qp), fields(nb_results = qp.nb_results))]
    pub async fn search_handler(
        &self,
        qp: &EnhancedSearchQuery,
        method: SearchMethod,
    ) -> Result<Vec<ScoredPoint>> {
        let started = Instant::now();
        let query = qp.query_text();
        let lang = detect_language(&query)?;
        let subject_vector = self.subject_vector(qp.subject.as_deref()).await;
        let collection = self.get_collection_by_language(&lang).await?;
        let embedding = self
            .get_query_embed(
                &collection.model,
                &query,
                subject_vector.as_deref(),
                qp.influence_factor,
            )
            .await?;

        let filters = SearchFilters {
            slice_sdg: qp.sdg_filter.clone(),
            document_corpus: qp.corpora.clone(),
            readability: None,
        };
        let data = match method {
            SearchMethod::BySlices => {
                self.search(&collection.name, embedding, Some(&filters), qp.nb_results, true)
                    .await?
            }
            SearchMethod::ByDocument => {
                self.search_group_by_document(&collection.name, embedding, Some(&filters), qp.nb_results)
                    .await?
            }
        };

        let mut sorted = sort_slices_using_mmr(data, qp.relevance_factor);
        if qp.concatenate {
            sorted = concatenate_same_doc_id_slices(sorted);
        }
        info!(
            collection = %collection.name,
            results = sorted.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "search_handler"
        );
        Ok(sorted)
    }

    /// Search every query of the batch by slices, concurrently, and merge
    /// the results in input order.
    pub async fn search_multi_inputs(&self, qp: &EnhancedSearchQuery) -> Result<Vec<ScoredPoint>> {
        let queries = qp.query.clone().into_vec();
        let params: Vec<EnhancedSearchQuery> = queries.into_iter().map(|q| qp.with_query(q)).collect();
        let results = join_all(
            params
                .iter()
                .map(|p| self.search_handler(p, SearchMethod::BySlices)),
        )
        .await;

        let mut all = Vec::new();
        for result in results {
            all.extend(result?);
        }
        Ok(all)
    }
}

async fn load_subject_vectors(path: Option<&std::path::Path>) -> HashMap<String, Vec<f32>> {
    let path = match path {
        Some(p) => p,
        None => {
            error!("search.subject_vectors_path is not configured");
            return HashMap::new();
        }
    };
    let parsed = async {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read subject vectors: {}", path.display()))?;
        let map: HashMap<String, Vec<f32>> =
            serde_json::from_str(&raw).with_context(|| "Invalid subject vectors file")?;
        Ok::<_, anyhow::Error>(map)
    }
    .await;
    match parsed {
        Ok(map) => map
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect(),
        Err(e) => {
            error!(error = %e, "subject vectors unavailable");
            HashMap::new()
        }
    }
}

/// Record duplicated documents as data-quality errors and mark them invalid.
/// Documents already recorded are skipped.
pub async fn log_duplicates(metadata: &dyn MetadataStore, duplicates: &[ScoredPoint]) {
    info!(total = duplicates.len(), "duplicated points found");
    let mut seen: Vec<Uuid> = Vec::new();
    for point in duplicates {
        let raw_id = match point.document_id() {
            Some(id) => id,
            None => {
                error!(point = %point.id, "Duplicated point found but no document id in payload");
                continue;
            }
        };
        let doc_id = match Uuid::parse_str(raw_id) {
            Ok(id) => id,
            Err(_) => {
                error!(document_id = raw_id, "duplicated document id is not a uuid");
                continue;
            }
        };
        if seen.contains(&doc_id) {
            continue;
        }
        seen.push(doc_id);

        let info = format!("Duplicated point found in data quality check: {}", point.id);
        match metadata.write_data_quality_error(doc_id, &info).await {
            Ok(id) => info!(%doc_id, error_id = %id, "data quality error logged"),
            Err(e) => {
                info!(%doc_id, error = %e, "document already logged in data quality errors");
                continue;
            }
        }
        match metadata.write_process_state(doc_id, "document_is_invalid").await {
            Ok(id) => info!(%doc_id, state_id = %id, "process state updated"),
            Err(e) => error!(%doc_id, error = %e, "failed to update process state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use welearn_core::models::{PointId, ValueRange};
    use welearn_core::store::memory::{InMemoryMetadataStore, InMemoryVectorStore};

    /// Maps a few words onto axes so similarity is predictable.
    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed(&self, _model: &str, text: &str) -> Result<Vec<f32>> {
            let t = text.to_lowercase();
            Ok(vec![
                if t.contains("climate") { 1.0 } else { 0.0 },
                if t.contains("water") { 1.0 } else { 0.0 },
                0.1,
            ])
        }
    }

    const COLLECTION: &str = "collection_welearn_en_all-minilm-l6-v2";

    fn service(metadata: Arc<InMemoryMetadataStore>) -> SearchService {
        let vectors = InMemoryVectorStore::new();
        vectors.create_collection(COLLECTION).unwrap();
        let doc_a = "7f0c5a44-7d1e-4a51-b3f4-1c2d3e4f5a61";
        let doc_b = "7f0c5a44-7d1e-4a51-b3f4-1c2d3e4f5a62";
        let points = [
            (1, vec![1.0, 0.0, 0.1], doc_a, "Climate change slice one", 13),
            (2, vec![0.9, 0.1, 0.1], doc_a, "Climate change slice two", 13),
            (3, vec![0.9, 0.1, 0.1], doc_a, "Climate change slice two", 13),
            (4, vec![0.7, 0.3, 0.1], doc_b, "Climate and water", 6),
        ];
        for (id, v, doc, content, sdg) in points {
            vectors
                .upsert(
                    COLLECTION,
                    PointId::Num(id),
                    v,
                    json!({
                        "document_id": doc,
                        "document_title": format!("Doc {}", doc),
                        "document_corpus": "ted",
                        "slice_content": content,
                        "slice_sdg": sdg,
                        "document_details": {"readability": 55.0, "internal": "x"},
                    }),
                )
                .unwrap();
        }
        SearchService::new(
            Arc::new(vectors),
            metadata,
            Arc::new(AxisEmbedder),
            SearchConfig::default(),
        )
    }

    #[test]
    fn test_collection_info() {
        let svc = service(Arc::new(InMemoryMetadataStore::new()));
        let c = svc.collection_info(COLLECTION).unwrap();
        assert_eq!(c.lang, "en");
        assert_eq!(c.model, "all-minilm-l6-v2");
        assert!(svc.collection_info("collection_welearn_en").is_err());
    }

    #[tokio::test]
    async fn test_collection_by_language() {
        let svc = service(Arc::new(InMemoryMetadataStore::new()));
        assert_eq!(svc.get_collection_by_language("en").await.unwrap().name, COLLECTION);

        let err: ApiError = svc.get_collection_by_language("fr").await.unwrap_err().into();
        assert_eq!(err.code(), "COLL_NOT_FOUND");
        assert_eq!(err.to_string(), "No collection found for this language fr");
    }

    #[test]
    fn test_build_filters() {
        let svc = service(Arc::new(InMemoryMetadataStore::new()));
        assert!(svc.build_filters(None).is_none());

        let filters = SearchFilters {
            slice_sdg: Some(vec![13]),
            document_corpus: Some(vec![]),
            readability: Some(ValueRange {
                gte: Some(0.0),
                lte: Some(60.0),
            }),
        };
        let f = svc.build_filters(Some(&filters)).unwrap();
        assert_eq!(f.must.len(), 2);
        assert_eq!(f.must[0].key(), "slice_sdg");
        assert_eq!(f.must[1].key(), "document_details.readability");
    }

    #[tokio::test]
    async fn test_search_handler_concatenates_and_dedups() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let svc = service(metadata.clone());
        let qp = EnhancedSearchQuery::new("What are the effects of climate change on our planet?");

        let hits = svc.search_handler(&qp, SearchMethod::BySlices).await.unwrap();
        assert_eq!(hits.len(), 2);
        let first = hits[0].payload_str("slice_content").unwrap();
        assert_eq!(first, "Climate change slice one\n\nClimate change slice two");

        // Only requested payload keys come back.
        let details = hits[0].payload.as_ref().unwrap()["document_details"].as_object().unwrap();
        assert!(details.contains_key("readability"));
        assert!(!details.contains_key("internal"));

        // The duplicate slice was logged in the background.
        for _ in 0..50 {
            if !metadata.process_states().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(metadata.data_quality_errors().unwrap().len(), 1);
        assert_eq!(metadata.process_states().unwrap()[0].1, "document_is_invalid");
    }

    #[tokio::test]
    async fn test_search_handler_sdg_filter_and_by_document() {
        let svc = service(Arc::new(InMemoryMetadataStore::new()));
        let mut qp = EnhancedSearchQuery::new("How is climate linked to clean water access?");
        qp.sdg_filter = Some(vec![6]);
        let hits = svc.search_handler(&qp, SearchMethod::BySlices).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload_str("slice_content"), Some("Climate and water"));

        let qp = EnhancedSearchQuery::new("How is climate linked to clean water access?");
        let docs = svc.search_handler(&qp, SearchMethod::ByDocument).await.unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_language() {
        let svc = service(Arc::new(InMemoryMetadataStore::new()));
        let qp = EnhancedSearchQuery::new("Wie wirkt sich der Klimawandel auf die Landwirtschaft aus?");
        let err: ApiError = svc
            .search_handler(&qp, SearchMethod::BySlices)
            .await
            .unwrap_err()
            .into();
        assert_eq!(err.code(), "LANG_NOT_SUPPORTED");
    }

    #[tokio::test]
    async fn test_subject_vector_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subjects.json");
        std::fs::write(&path, r#"{"physics": [0.0, 1.0, 0.0]}"#).unwrap();
        let mut svc = service(Arc::new(InMemoryMetadataStore::new()));
        svc.config.subject_vectors_path = Some(path);

        assert_eq!(svc.subject_vector(Some("Physics")).await, Some(vec![0.0, 1.0, 0.0]));
        assert_eq!(svc.subject_vector(Some("history")).await, None);
        assert_eq!(svc.subject_vector(None).await, None);

        let v = svc
            .get_query_embed("m", "climate", Some(&[0.0, 1.0, 0.0]), 2.0)
            .await
            .unwrap();
        assert_eq!(v, vec![1.0, 2.0, 0.1]);
    }

    #[tokio::test]
    async fn test_multi_inputs_in_order() {
        let svc = service(Arc::new(InMemoryMetadataStore::new()));
        let mut qp = EnhancedSearchQuery::new("x");
        qp.query = welearn_core::models::QueryInput::Many(vec![
            "How does climate change affect the oceans?".into(),
            "Which regions lack access to clean water and climate resilience?".into(),
        ]);
        qp.concatenate = false;
        let hits = svc.search_multi_inputs(&qp).await.unwrap();
        assert!(hits.len() >= 4);
    }
}
