//! Qdrant REST backend.
//!
//! Talks to a Qdrant instance over its HTTP API. All writes go through
//! `?wait=true` so a successful response means the batch is applied — a
//! failed call persists nothing the engine will ever observe as complete.
//! Branch filtering is pushed down as a `must_not` match on the
//! `hidden_branches` payload field, keeping branch-visibility cost at the
//! index level rather than in-process.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::models::{ContentPoint, PointPayload, ScoredPoint};
use crate::store::VectorBackend;

const SCROLL_PAGE: usize = 512;

pub struct QdrantBackend {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    distance: String,
}

impl QdrantBackend {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            distance: config.distance.clone(),
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    async fn post_json(&self, url: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self.client.post(url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Qdrant error {} on {}: {}", status, url, text);
        }
        Ok(response.json().await?)
    }

    async fn put_json(&self, url: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self.client.put(url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Qdrant error {} on {}: {}", status, url, text);
        }
        Ok(response.json().await?)
    }

    fn parse_payload(value: &serde_json::Value) -> Result<PointPayload> {
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("Malformed point payload: {e}"))
    }

    /// Scroll all points matching `filter`, following pagination offsets.
    async fn scroll(&self, filter: serde_json::Value) -> Result<Vec<ContentPoint>> {
        let mut out = Vec::new();
        let mut offset: Option<serde_json::Value> = None;

        loop {
            let mut body = json!({
                "limit": SCROLL_PAGE,
                "with_payload": true,
                "with_vector": false,
            });
            if !filter.is_null() {
                body["filter"] = filter.clone();
            }
            if let Some(off) = &offset {
                body["offset"] = off.clone();
            }

            let resp = self.post_json(&self.url("/points/scroll"), body).await?;
            let result = &resp["result"];

            for record in result["points"].as_array().unwrap_or(&Vec::new()) {
                let id = record["id"]
                    .as_str()
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| anyhow::anyhow!("Qdrant point without UUID id"))?;
                let payload = Self::parse_payload(&record["payload"])?;
                out.push(ContentPoint {
                    id,
                    vector: Vec::new(),
                    payload,
                });
            }

            match &result["next_page_offset"] {
                serde_json::Value::Null => break,
                next => offset = Some(next.clone()),
            }
        }

        Ok(out)
    }
}

#[async_trait]
impl VectorBackend for QdrantBackend {
    async fn ensure_collection(&self, dims: usize) -> Result<()> {
        let exists = self
            .client
            .get(self.url(""))
            .send()
            .await?
            .status()
            .is_success();
        if exists {
            return Ok(());
        }

        self.put_json(
            &self.url(""),
            json!({
                "vectors": { "size": dims, "distance": self.distance }
            }),
        )
        .await?;
        Ok(())
    }

    async fn existing_ids(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let id_strings: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let resp = self
            .post_json(
                &self.url("/points"),
                json!({
                    "ids": id_strings,
                    "with_payload": false,
                    "with_vector": false,
                }),
            )
            .await?;

        let mut found = HashSet::new();
        for record in resp["result"].as_array().unwrap_or(&Vec::new()) {
            if let Some(id) = record["id"].as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                found.insert(id);
            }
        }
        Ok(found)
    }

    async fn upsert(&self, points: &[ContentPoint]) -> Result<()> {
        let body_points: Vec<serde_json::Value> = points
            .iter()
            .map(|p| {
                Ok(json!({
                    "id": p.id.to_string(),
                    "vector": p.vector,
                    "payload": serde_json::to_value(&p.payload)?,
                }))
            })
            .collect::<Result<_>>()?;

        self.put_json(
            &format!("{}?wait=true", self.url("/points")),
            json!({ "points": body_points }),
        )
        .await?;
        Ok(())
    }

    async fn set_hidden_branches(&self, updates: &[(Uuid, Vec<String>)]) -> Result<()> {
        // Points sharing the same new hidden set go out in one call.
        let mut grouped: Vec<(&Vec<String>, Vec<String>)> = Vec::new();
        for (id, hidden) in updates {
            match grouped.iter_mut().find(|(h, _)| *h == hidden) {
                Some((_, ids)) => ids.push(id.to_string()),
                None => grouped.push((hidden, vec![id.to_string()])),
            }
        }

        for (hidden, ids) in grouped {
            self.post_json(
                &format!("{}?wait=true", self.url("/points/payload")),
                json!({
                    "payload": { "hidden_branches": hidden },
                    "points": ids,
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        branch: &str,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let resp = self
            .post_json(
                &self.url("/points/search"),
                json!({
                    "vector": vector,
                    "limit": limit,
                    "with_payload": true,
                    "filter": {
                        "must_not": [
                            { "key": "hidden_branches", "match": { "value": branch } }
                        ]
                    }
                }),
            )
            .await?;

        let mut out = Vec::new();
        for record in resp["result"].as_array().unwrap_or(&Vec::new()) {
            let id = record["id"]
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| anyhow::anyhow!("Qdrant point without UUID id"))?;
            let score = record["score"].as_f64().unwrap_or(0.0) as f32;
            let payload = Self::parse_payload(&record["payload"])?;
            out.push(ScoredPoint { id, score, payload });
        }
        Ok(out)
    }

    async fn scroll_all(&self) -> Result<Vec<ContentPoint>> {
        self.scroll(serde_json::Value::Null).await
    }

    async fn scroll_by_path(&self, path: &str) -> Result<Vec<ContentPoint>> {
        self.scroll(json!({
            "must": [ { "key": "path", "match": { "value": path } } ]
        }))
        .await
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<()> {
        let id_strings: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        self.post_json(
            &format!("{}?wait=true", self.url("/points/delete")),
            json!({ "points": id_strings }),
        )
        .await?;
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let resp = self
            .post_json(&self.url("/points/count"), json!({ "exact": true }))
            .await?;
        Ok(resp["result"]["count"].as_u64().unwrap_or(0) as usize)
    }
}
