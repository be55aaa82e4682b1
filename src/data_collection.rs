//! Opt-in recording of chat exchanges and source clicks during a data
//! collection campaign.
//!
//! A request is collected when its `Origin`, stripped of scheme and `www.`,
//! starts with `data_collection.origin_prefix` and a campaign is active.
//! The campaign flag is read from the metadata store at most every 6 hours.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use welearn_core::models::Document;
use welearn_core::store::MetadataStore;

use crate::error::ApiError;

const CAMPAIGN_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// `https://www.welearn.example/` → `welearn.example`.
pub fn strip_origin(origin: &str) -> String {
    let origin = origin.trim();
    let rest = ["https://", "http://"]
        .iter()
        .find_map(|scheme| origin.strip_prefix(scheme))
        .map(|r| r.strip_prefix("www.").unwrap_or(r))
        .unwrap_or(origin);
    rest.trim_matches('/').to_string()
}

pub struct DataCollectionService {
    metadata: Arc<dyn MetadataStore>,
    origin_prefix: String,
    campaign: Mutex<Option<(bool, Instant)>>,
}

/// Per-request view: whether this request is collected.
pub struct DataCollection {
    metadata: Arc<dyn MetadataStore>,
    pub should_collect: bool,
}

impl DataCollectionService {
    pub fn new(metadata: Arc<dyn MetadataStore>, origin_prefix: &str) -> Self {
        Self {
            metadata,
            origin_prefix: origin_prefix.trim().to_string(),
            campaign: Mutex::new(None),
        }
    }

    async fn campaign_active(&self) -> bool {
        let mut cached = self.campaign.lock().await;
        if let Some((active, at)) = *cached {
            if at.elapsed() < CAMPAIGN_TTL {
                return active;
            }
        }
        match self.metadata.current_campaign_active().await {
            Ok(active) => {
                *cached = Some((active, Instant::now()));
                active
            }
            Err(e) => {
                error!(error = %e, "failed to read data collection campaign");
                false
            }
        }
    }

    pub async fn for_origin(&self, origin: Option<&str>) -> DataCollection {
        let origin = strip_origin(origin.unwrap_or_default());
        let is_campaign = self.campaign_active().await;
        let should_collect = is_campaign && origin.starts_with(&self.origin_prefix);
        info!(
            origin = %origin,
            origin_prefix = %self.origin_prefix,
            is_campaign,
            should_collect,
            "data_collection"
        );
        DataCollection {
            metadata: Arc::clone(&self.metadata),
            should_collect,
        }
    }
}

impl DataCollection {
    /// Store the query and the answer with its sources. Returns
    /// `(conversation_id, message_id)`, or `None` when not collecting.
    pub async fn register_chat_data(
        &self,
        session_id: Option<&str>,
        query: &str,
        conversation_id: Option<Uuid>,
        answer: &str,
        sources: &[Document],
    ) -> Result<Option<(Uuid, Uuid)>> {
        if !self.should_collect {
            info!("data_collection is not enabled.");
            return Ok(None);
        }
        let session_id = session_id
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .ok_or(ApiError::SessionIdNotFound)?;
        let user_id = self
            .metadata
            .user_from_session(session_id)
            .await?
            .ok_or(ApiError::UserNotFound)?;

        let conversation_id = self
            .metadata
            .write_user_query(user_id, query, conversation_id)
            .await?;
        let message_id = self
            .metadata
            .write_chat_answer(user_id, answer, sources, conversation_id)
            .await?;
        info!(%conversation_id, %message_id, sources = sources.len(), "chat data registered");
        Ok(Some((conversation_id, message_id)))
    }

    pub async fn register_document_click(&self, document_id: Uuid, message_id: Uuid) -> Result<()> {
        if !self.should_collect {
            info!("data_collection is not enabled.");
            return Ok(());
        }
        self.metadata
            .update_returned_document_click(document_id, message_id)
            .await
    }
}
