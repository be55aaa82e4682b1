//! Micro-learning journeys: for one SDG, the introduction and target meta
//! documents, each paired with corpus documents close to it and to a
//! subject.
//!
//! | Section | Readability range |
//! |---------|-------------------|
//! | `introduction` | 60..=100 |
//! | `target` | 0..=60 |

use anyhow::{anyhow, Result};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use welearn_core::models::{JourneySection, JourneySectionType};
use welearn_core::store::{Condition, Filter, MetadataStore};
use welearn_core::vector::{blob_to_vec, flavor_with_subject};

use crate::error::ApiError;
use crate::search::SearchService;

const JOURNEY_TYPES: [&str; 2] = ["introduction", "target"];
const DISCIPLINE_FACTOR: f32 = 2.0;
const JOURNEY_RESULTS: usize = 10;

pub type Journey = BTreeMap<String, Vec<JourneySection>>;

pub struct MicroLearningService {
    search: Arc<SearchService>,
    metadata: Arc<dyn MetadataStore>,
}

impl MicroLearningService {
    pub fn new(search: Arc<SearchService>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { search, metadata }
    }

    fn collection(&self) -> &str {
        &self.search.config().journey_collection
    }

    fn model(&self) -> Result<String> {
        Ok(self.search.collection_info(self.collection())?.model)
    }

    /// Titles of the subject meta documents.
    pub async fn subject_list(&self) -> Result<Vec<String>> {
        let subjects = self.metadata.subjects(&self.model()?).await?;
        Ok(subjects.into_iter().map(|s| s.title).collect())
    }

    pub async fn full_journey(&self, lang: &str, sdg: i64, subject: &str) -> Result<Journey> {
        let model = self.model()?;
        let sdg_docs = self
            .metadata
            .journey_documents(&JOURNEY_TYPES, sdg, &model)
            .await?;
        let subject_doc = self
            .metadata
            .subject(subject, &model)
            .await?
            .ok_or(ApiError::SubjectNotFound)?;
        if sdg_docs.is_empty() {
            return Err(ApiError::NotFound(format!("SDG '{}' not found in meta documents.", sdg)).into());
        }
        info!(lang, sdg, subject, sections = sdg_docs.len(), "full journey");

        let subject_embedding = blob_to_vec(&subject_doc.embedding);
        let mut journey = Journey::new();
        for doc in sdg_docs {
            let section = JourneySectionType::parse(&doc.type_title).ok_or_else(|| {
                anyhow!(
                    "Meta document type '{}' is not a valid journey section",
                    doc.type_title
                )
            })?;
            let sdg_embedding = blob_to_vec(&doc.embedding);
            if sdg_embedding.len() != subject_embedding.len() {
                warn!(
                    title = %doc.title,
                    sdg_dims = sdg_embedding.len(),
                    subject_dims = subject_embedding.len(),
                    "embedding dimensions differ"
                );
            }
            let embedding = flavor_with_subject(&sdg_embedding, &subject_embedding, DISCIPLINE_FACTOR);

            let band = section.readability();
            let filter = Filter {
                must: vec![
                    Condition::match_value("document_sdg", json!(sdg)),
                    Condition::range("document_details.readability", band.gte, band.lte),
                ],
            };
            let documents = self
                .search
                .search_filtered(self.collection(), embedding, Some(filter), JOURNEY_RESULTS, false)
                .await?;

            let entries = journey.entry(section.as_str().to_string()).or_default();
            if !documents.is_empty() {
                entries.push(JourneySection {
                    title: doc.title,
                    content: doc.full_content,
                    documents,
                });
            }
        }
        Ok(journey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchConfig;
    use crate::embedding::Embedder;
    use async_trait::async_trait;
    use welearn_core::models::{MetaDocument, PointId};
    use welearn_core::store::memory::{InMemoryMetadataStore, InMemoryVectorStore};
    use welearn_core::vector::vec_to_blob;

    const MODEL: &str = "all-minilm-l6-v2";
    const COLLECTION: &str = "collection_welearn_en_all-minilm-l6-v2";

    struct NoEmbedder;

    #[async_trait]
    impl Embedder for NoEmbedder {
        async fn embed(&self, _model: &str, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.0, 0.0])
        }
    }

    fn meta(title: &str, kind: &str, sdgs: Vec<i64>, v: &[f32]) -> MetaDocument {
        MetaDocument {
            title: title.to_string(),
            full_content: format!("{} content", title),
            type_title: kind.to_string(),
            sdg_related: sdgs,
            embedding: vec_to_blob(v),
        }
    }

    fn service() -> (MicroLearningService, Arc<InMemoryMetadataStore>) {
        let vectors = InMemoryVectorStore::new();
        vectors.create_collection(COLLECTION).unwrap();
        let points = [
            (1, vec![1.0, 0.2], 6, 75.0),
            (2, vec![0.2, 1.0], 6, 30.0),
            (3, vec![1.0, 0.2], 13, 75.0),
        ];
        for (id, v, sdg, readability) in points {
            vectors
                .upsert(
                    COLLECTION,
                    PointId::Num(id),
                    v,
                    json!({
                        "document_id": format!("doc-{}", id),
                        "slice_content": format!("slice {}", id),
                        "document_sdg": [sdg],
                        "document_details": {"readability": readability},
                    }),
                )
                .unwrap();
        }

        let metadata = Arc::new(InMemoryMetadataStore::new());
        metadata.add_meta_document(MODEL, meta("Biology", "subject", vec![], &[0.0, 0.0])).unwrap();
        metadata.add_meta_document(MODEL, meta("Physics", "subject", vec![], &[0.1, 0.0])).unwrap();
        metadata.add_meta_document(MODEL, meta("Clean water", "introduction", vec![6], &[1.0, 0.0])).unwrap();
        metadata.add_meta_document(MODEL, meta("Target 6.1", "target", vec![6], &[0.0, 1.0])).unwrap();
        metadata.add_meta_document(MODEL, meta("Climate", "introduction", vec![13], &[1.0, 0.0])).unwrap();

        let search = Arc::new(SearchService::new(
            Arc::new(vectors),
            metadata.clone(),
            Arc::new(NoEmbedder),
            SearchConfig::default(),
        ));
        (MicroLearningService::new(search, metadata.clone()), metadata)
    }

    #[tokio::test]
    async fn test_subject_list() {
        let (svc, _) = service();
        assert_eq!(svc.subject_list().await.unwrap(), vec!["Biology", "Physics"]);
    }

    #[tokio::test]
    async fn test_full_journey_sections_and_readability() {
        let (svc, _) = service();
        let journey = svc.full_journey("en", 6, "Biology").await.unwrap();

        let intro = &journey["introduction"];
        assert_eq!(intro.len(), 1);
        assert_eq!(intro[0].title, "Clean water");
        assert_eq!(intro[0].content, "Clean water content");
        let ids: Vec<_> = intro[0].documents.iter().map(|d| d.document_id()).collect();
        assert_eq!(ids, vec![Some("doc-1")]);
        assert!(intro[0].documents[0].vector.is_none());

        let target = &journey["target"];
        assert_eq!(target[0].documents[0].document_id(), Some("doc-2"));
    }

    #[tokio::test]
    async fn test_full_journey_not_found() {
        let (svc, _) = service();
        let err: ApiError = svc.full_journey("en", 6, "Law").await.unwrap_err().into();
        assert_eq!(err.code(), "SUBJECT_NOT_FOUND");

        let err: ApiError = svc.full_journey("en", 17, "Biology").await.unwrap_err().into();
        assert_eq!(err.to_string(), "SDG '17' not found in meta documents.");
    }
}
