//! Qdrant REST client.
//!
//! Implements [`VectorStore`] over three endpoints:
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | `list_collections` | `GET /collections` |
//! | `search` | `POST /collections/{c}/points/search` |
//! | `search_groups` | `POST /collections/{c}/points/search/groups` |
//!
//! Search failures are logged and yield an empty hit list, so one broken
//! collection does not fail a whole request. Listing collections
//! propagates errors.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, error};

use welearn_core::models::ScoredPoint;
use welearn_core::store::{Condition, Filter, SearchRequest, VectorStore};

use crate::config::QdrantConfig;

pub struct QdrantStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl QdrantStore {
    pub fn new(base_url: &str, config: &QdrantConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .with_context(|| "Failed to build Qdrant HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => req.header("api-key", key),
            None => req,
        }
    }

    async fn post_result(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Qdrant request failed: {}", path))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("Qdrant error {} on {}: {}", status, path, text);
        }
        let mut json: Value = resp.json().await?;
        json.get_mut("result")
            .map(Value::take)
            .ok_or_else(|| anyhow!("Qdrant response has no result field"))
    }
}

/// Qdrant JSON for a single condition.
pub fn condition_to_json(cond: &Condition) -> Value {
    match cond {
        Condition::MatchAny { key, any } => json!({"key": key, "match": {"any": any}}),
        Condition::MatchValue { key, value } => json!({"key": key, "match": {"value": value}}),
        Condition::Range { key, gte, lte } => {
            let mut range = Map::new();
            if let Some(g) = gte {
                range.insert("gte".into(), json!(g));
            }
            if let Some(l) = lte {
                range.insert("lte".into(), json!(l));
            }
            json!({"key": key, "range": range})
        }
    }
}

pub fn filter_to_json(filter: &Filter) -> Value {
    json!({"must": filter.must.iter().map(condition_to_json).collect::<Vec<_>>()})
}

fn search_body(req: &SearchRequest) -> Value {
    let mut body = json!({
        "vector": req.vector,
        "limit": req.limit,
        "with_vector": req.with_vectors,
        "with_payload": match &req.payload_keys {
            Some(keys) => json!({"include": keys}),
            None => json!(true),
        },
    });
    if let Some(filter) = &req.filter {
        body["filter"] = filter_to_json(filter);
    }
    if let Some(threshold) = req.score_threshold {
        body["score_threshold"] = json!(threshold);
    }
    body
}

fn parse_points(value: Value) -> Result<Vec<ScoredPoint>> {
    serde_json::from_value(value).with_context(|| "Invalid Qdrant points")
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let resp = self
            .request(reqwest::Method::GET, "/collections")
            .send()
            .await
            .with_context(|| "Failed to reach Qdrant")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("Qdrant error {} listing collections", status);
        }
        let json: Value = resp.json().await?;
        let names = json["result"]["collections"]
            .as_array()
            .ok_or_else(|| anyhow!("Qdrant response has no collections list"))?
            .iter()
            .filter_map(|c| c["name"].as_str().map(str::to_string))
            .collect();
        Ok(names)
    }

    async fn search(&self, collection: &str, req: &SearchRequest) -> Result<Vec<ScoredPoint>> {
        let path = format!("/collections/{}/points/search", collection);
        let result = self
            .post_result(&path, &search_body(req))
            .await
            .and_then(parse_points);
        match result {
            Ok(points) => {
                debug!(collection, hits = points.len(), "qdrant search");
                Ok(points)
            }
            Err(e) => {
                error!(collection, error = %e, "qdrant search failed");
                Ok(Vec::new())
            }
        }
    }

    async fn search_groups(
        &self,
        collection: &str,
        req: &SearchRequest,
        group_by: &str,
        group_size: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let path = format!("/collections/{}/points/search/groups", collection);
        let mut body = search_body(req);
        body["group_by"] = json!(group_by);
        body["group_size"] = json!(group_size);

        let result = self.post_result(&path, &body).await.and_then(|result| {
            let groups = result["groups"]
                .as_array()
                .ok_or_else(|| anyhow!("Qdrant response has no groups"))?;
            let mut points = Vec::new();
            for group in groups {
                points.extend(parse_points(group["hits"].clone())?);
            }
            Ok(points)
        });
        match result {
            Ok(points) => Ok(points),
            Err(e) => {
                error!(collection, error = %e, "qdrant group search failed");
                Ok(Vec::new())
            }
        }
    }
}

/// `GET {url}/collections` and return the `status` Qdrant reports in the
/// body. Fails on network errors and on a body that is not JSON.
pub async fn probe(url: &str, api_key: Option<&str>, timeout: Duration) -> Result<String> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let mut req = client.get(format!("{}/collections", url.trim_end_matches('/')));
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        req = req.header("api-key", key);
    }
    let resp = req.send().await.with_context(|| "Qdrant probe failed")?;
    let body: Value = resp
        .json()
        .await
        .with_context(|| "Qdrant probe returned invalid JSON")?;
    reported_status(&body)
}

/// The string `status` field of a Qdrant response body.
fn reported_status(body: &Value) -> Result<String> {
    match body.get("status") {
        Some(Value::String(status)) => Ok(status.clone()),
        other => bail!("Qdrant reported no status string: {:?}", other),
    }
}
