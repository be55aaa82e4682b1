//! Postgres implementation of [`MetadataStore`].
//!
//! Tables live in three schemas:
//!
//! | Schema | Tables |
//! |--------|--------|
//! | `corpus_related` | `corpus`, `corpus_name_embedding_model_lang`, `qty_document_in_qdrant_per_corpus`, `qty_document_per_corpus`, `embedding_model` |
//! | `document_related` | `meta_document`, `meta_document_type`, `error_data_quality`, `process_state` |
//! | `user_related` | `api_key_management`, `infered_user`, `session`, `bookmark`, `endpoint_request`, `data_collection_campaign`, `chat_message`, `returned_document` |
//!
//! The schema is owned by the ingestion pipeline; this service never
//! migrates it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use welearn_core::models::{Bookmark, CollectionSchema, CorpusQtyRow, Document, MetaDocument};
use welearn_core::store::{BookmarkChange, MetadataStore};

const APP_NAME: &str = "welearn-api";

pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn user_exists(&self, user_id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT id FROM user_related.infered_user WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn bookmark_exists(&self, user_id: Uuid, document_id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            "SELECT document_id FROM user_related.bookmark WHERE inferred_user_id = $1 AND document_id = $2",
        )
        .bind(user_id)
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn insert_message(&self, user_id: Uuid, conversation_id: Uuid, role: &str, content: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO user_related.chat_message (id, inferred_user_id, conversation_id, role, textual_content, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(user_id)
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .bind(Utc::now().naive_utc())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to store {} message", role))?;
        Ok(id)
    }
}

fn meta_document_from_row(row: &PgRow) -> Result<MetaDocument> {
    let sdg_related: Option<Vec<i32>> = row.try_get("sdg_related")?;
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;
    Ok(MetaDocument {
        title: row.try_get("title")?,
        full_content: row.try_get::<Option<String>, _>("full_content")?.unwrap_or_default(),
        type_title: row.try_get("type_title")?,
        sdg_related: sdg_related
            .unwrap_or_default()
            .into_iter()
            .map(i64::from)
            .collect(),
        embedding: embedding.unwrap_or_default(),
    })
}

const META_DOCUMENT_SELECT: &str = "SELECT md.title, md.full_content, mdt.title AS type_title, md.sdg_related, md.embedding \
     FROM document_related.meta_document md \
     JOIN document_related.meta_document_type mdt ON md.meta_document_type_id = mdt.id \
     JOIN corpus_related.embedding_model em ON md.embedding_model_id = em.id";

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn collections(&self) -> Result<Vec<CollectionSchema>> {
        let rows = sqlx::query(
            "SELECT source_name, lang, title FROM corpus_related.corpus_name_embedding_model_lang",
        )
        .fetch_all(&self.pool)
        .await
        .with_context(|| "Failed to list collections")?;

        rows.iter()
            .map(|row| {
                Ok(CollectionSchema::new(
                    row.try_get("source_name")?,
                    row.try_get("lang")?,
                    row.try_get("title")?,
                ))
            })
            .collect()
    }

    async fn corpus_doc_counts(&self) -> Result<Vec<CorpusQtyRow>> {
        let rows = sqlx::query(
            "SELECT c.source_name, c.main_url, qp.document_count AS qty_total, qq.document_in_qdrant AS qty_in_qdrant \
             FROM corpus_related.corpus c \
             JOIN corpus_related.qty_document_in_qdrant_per_corpus qq ON c.source_name = qq.source_name \
             JOIN corpus_related.qty_document_per_corpus qp ON c.source_name = qp.source_name",
        )
        .fetch_all(&self.pool)
        .await
        .with_context(|| "Failed to read corpus document counts")?;

        rows.iter()
            .map(|row| {
                Ok(CorpusQtyRow {
                    source_name: row.try_get("source_name")?,
                    main_url: row.try_get("main_url")?,
                    qty_total: row.try_get("qty_total")?,
                    qty_in_qdrant: row.try_get("qty_in_qdrant")?,
                })
            })
            .collect()
    }

    async fn check_api_key(&self, digest: &[u8]) -> Result<bool> {
        let row = sqlx::query(
            "SELECT is_active FROM user_related.api_key_management WHERE digest = $1",
        )
        .bind(digest)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(row.try_get::<bool, _>("is_active")?),
            None => Ok(false),
        }
    }

    async fn register_endpoint(&self, session_id: Uuid, endpoint: &str, http_code: u16) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_related.endpoint_request (id, session_id, endpoint_name, http_code) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(endpoint)
        .bind(i32::from(http_code))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to register endpoint request {}", endpoint))?;
        Ok(())
    }

    async fn subjects(&self, model: &str) -> Result<Vec<MetaDocument>> {
        let rows = sqlx::query(&format!(
            "{} WHERE mdt.title = 'subject' AND em.title = $1",
            META_DOCUMENT_SELECT
        ))
        .bind(model)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(meta_document_from_row).collect()
    }

    async fn subject(&self, title: &str, model: &str) -> Result<Option<MetaDocument>> {
        let row = sqlx::query(&format!(
            "{} WHERE mdt.title = 'subject' AND md.title = $1 AND em.title = $2 LIMIT 1",
            META_DOCUMENT_SELECT
        ))
        .bind(title)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(meta_document_from_row).transpose()
    }

    async fn journey_documents(&self, types: &[&str], sdg: i64, model: &str) -> Result<Vec<MetaDocument>> {
        let types: Vec<String> = types.iter().map(|t| t.to_string()).collect();
        let rows = sqlx::query(&format!(
            "{} WHERE mdt.title = ANY($1) AND $2 = ANY(md.sdg_related) AND em.title = $3",
            META_DOCUMENT_SELECT
        ))
        .bind(&types)
        .bind(sdg as i32)
        .bind(model)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(meta_document_from_row).collect()
    }

    async fn get_or_create_user(&self, user_id: Option<Uuid>) -> Result<Uuid> {
        if let Some(id) = user_id {
            if self.user_exists(id).await? {
                return Ok(id);
            }
        }
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO user_related.infered_user (id) VALUES ($1)")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| "Failed to create user")?;
        Ok(id)
    }

    async fn get_or_create_session(
        &self,
        user_id: Uuid,
        session_id: Option<Uuid>,
        host: &str,
    ) -> Result<Option<Uuid>> {
        if !self.user_exists(user_id).await? {
            return Ok(None);
        }
        let now: NaiveDateTime = Utc::now().naive_utc();
        if let Some(id) = session_id {
            let row = sqlx::query(
                "SELECT id FROM user_related.session WHERE id = $1 AND inferred_user_id = $2 AND end_at > $3",
            )
            .bind(id)
            .bind(user_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            if row.is_some() {
                return Ok(Some(id));
            }
        }

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO user_related.session (id, inferred_user_id, created_at, end_at, host) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(user_id)
        .bind(now)
        .bind(now + Duration::hours(24))
        .bind(host)
        .execute(&self.pool)
        .await
        .with_context(|| "Failed to create session")?;
        Ok(Some(id))
    }

    async fn bookmarks(&self, user_id: Uuid) -> Result<Option<Vec<Bookmark>>> {
        if !self.user_exists(user_id).await? {
            return Ok(None);
        }
        let rows = sqlx::query(
            "SELECT document_id, inferred_user_id, created_at FROM user_related.bookmark WHERE inferred_user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        let bookmarks = rows
            .iter()
            .map(|row| {
                Ok(Bookmark {
                    document_id: row.try_get("document_id")?,
                    inferred_user_id: row.try_get("inferred_user_id")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(bookmarks))
    }

    async fn add_bookmark(&self, user_id: Uuid, document_id: Uuid) -> Result<BookmarkChange> {
        if !self.user_exists(user_id).await? {
            return Ok(BookmarkChange::UserNotFound);
        }
        if self.bookmark_exists(user_id, document_id).await? {
            return Ok(BookmarkChange::AlreadyExists);
        }
        sqlx::query(
            "INSERT INTO user_related.bookmark (document_id, inferred_user_id, created_at) VALUES ($1, $2, $3)",
        )
        .bind(document_id)
        .bind(user_id)
        .bind(Utc::now().naive_utc())
        .execute(&self.pool)
        .await?;
        Ok(BookmarkChange::Done)
    }

    async fn delete_bookmark(&self, user_id: Uuid, document_id: Uuid) -> Result<BookmarkChange> {
        if !self.user_exists(user_id).await? {
            return Ok(BookmarkChange::UserNotFound);
        }
        let result = sqlx::query(
            "DELETE FROM user_related.bookmark WHERE inferred_user_id = $1 AND document_id = $2",
        )
        .bind(user_id)
        .bind(document_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            Ok(BookmarkChange::NotFound)
        } else {
            Ok(BookmarkChange::Done)
        }
    }

    async fn delete_bookmarks(&self, user_id: Uuid) -> Result<Option<u64>> {
        if !self.user_exists(user_id).await? {
            return Ok(None);
        }
        let result = sqlx::query("DELETE FROM user_related.bookmark WHERE inferred_user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(Some(result.rows_affected()))
    }

    async fn write_data_quality_error(&self, document_id: Uuid, error_info: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO document_related.error_data_quality (id, document_id, slice_id, error_raiser, error_info) \
             VALUES ($1, $2, NULL, $3, $4)",
        )
        .bind(id)
        .bind(document_id)
        .bind(APP_NAME)
        .bind(error_info)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn write_process_state(&self, document_id: Uuid, state: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO document_related.process_state (id, document_id, title) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(document_id)
            .bind(state)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn current_campaign_active(&self) -> Result<bool> {
        let row = sqlx::query(
            "SELECT is_active FROM user_related.data_collection_campaign \
             WHERE start_at <= $1 AND (end_at IS NULL OR end_at > $1) \
             ORDER BY start_at DESC LIMIT 1",
        )
        .bind(Utc::now().naive_utc())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(row.try_get::<bool, _>("is_active")?),
            None => Ok(false),
        }
    }

    async fn user_from_session(&self, session_id: Uuid) -> Result<Option<Uuid>> {
        let row = sqlx::query("SELECT inferred_user_id FROM user_related.session WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("inferred_user_id")?)),
            None => Ok(None),
        }
    }

    async fn write_user_query(&self, user_id: Uuid, query: &str, conversation_id: Option<Uuid>) -> Result<Uuid> {
        let conversation_id = conversation_id.unwrap_or_else(Uuid::new_v4);
        self.insert_message(user_id, conversation_id, "user", query).await?;
        Ok(conversation_id)
    }

    async fn write_chat_answer(
        &self,
        user_id: Uuid,
        answer: &str,
        sources: &[Document],
        conversation_id: Uuid,
    ) -> Result<Uuid> {
        let message_id = self
            .insert_message(user_id, conversation_id, "assistant", answer)
            .await?;
        for doc in sources {
            let document_id = match Uuid::parse_str(&doc.payload.document_id) {
                Ok(id) => id,
                Err(_) => {
                    tracing::warn!(document_id = %doc.payload.document_id, "skipping returned document without uuid");
                    continue;
                }
            };
            sqlx::query(
                "INSERT INTO user_related.returned_document (id, message_id, document_id, is_clicked) VALUES ($1, $2, $3, false)",
            )
            .bind(Uuid::new_v4())
            .bind(message_id)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(message_id)
    }

    async fn update_returned_document_click(&self, document_id: Uuid, message_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE user_related.returned_document SET is_clicked = true WHERE document_id = $1 AND message_id = $2",
        )
        .bind(document_id)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
