//! In-process vector backend.
//!
//! Selected with `storage.backend = "memory"`. Holds points in a map and
//! scores queries with brute-force cosine similarity. Exists so the engine
//! runs without a Qdrant instance — small trees, CI, and the test suite.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::models::{ContentPoint, ScoredPoint};
use crate::store::VectorBackend;

#[derive(Default)]
pub struct MemoryBackend {
    points: Mutex<HashMap<Uuid, ContentPoint>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorBackend for MemoryBackend {
    async fn ensure_collection(&self, _dims: usize) -> Result<()> {
        Ok(())
    }

    async fn existing_ids(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        let points = self.points.lock().unwrap();
        Ok(ids.iter().filter(|id| points.contains_key(id)).copied().collect())
    }

    async fn upsert(&self, batch: &[ContentPoint]) -> Result<()> {
        // Single lock over the whole batch: all points land together.
        let mut points = self.points.lock().unwrap();
        for point in batch {
            points.insert(point.id, point.clone());
        }
        Ok(())
    }

    async fn set_hidden_branches(&self, updates: &[(Uuid, Vec<String>)]) -> Result<()> {
        let mut points = self.points.lock().unwrap();
        for (id, hidden) in updates {
            if let Some(point) = points.get_mut(id) {
                point.payload.hidden_branches = hidden.clone();
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        branch: &str,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let points = self.points.lock().unwrap();
        let mut scored: Vec<ScoredPoint> = points
            .values()
            .filter(|p| p.is_visible_on(branch))
            .map(|p| ScoredPoint {
                id: p.id,
                score: cosine_similarity(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn scroll_all(&self) -> Result<Vec<ContentPoint>> {
        let points = self.points.lock().unwrap();
        Ok(points.values().cloned().collect())
    }

    async fn scroll_by_path(&self, path: &str) -> Result<Vec<ContentPoint>> {
        let points = self.points.lock().unwrap();
        Ok(points
            .values()
            .filter(|p| p.payload.path == path)
            .cloned()
            .collect())
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<()> {
        let mut points = self.points.lock().unwrap();
        for id in ids {
            points.remove(id);
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.points.lock().unwrap().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::point_id;
    use crate::models::PointPayload;

    fn sample_point(path: &str, commit: &str, index: usize, vector: Vec<f32>) -> ContentPoint {
        ContentPoint {
            id: point_id(path, commit, index),
            vector,
            payload: PointPayload {
                path: path.to_string(),
                commit: commit.to_string(),
                branch: "main".to_string(),
                chunk_index: index,
                total_chunks: 1,
                start_line: 1,
                end_line: 10,
                text: "fn main() {}".to_string(),
                language: "rust".to_string(),
                project_id: "proj".to_string(),
                content_hash: "hash".to_string(),
                hidden_branches: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let backend = MemoryBackend::new();
        let p = sample_point("a.rs", "c1", 0, vec![1.0, 0.0]);
        backend.upsert(&[p.clone()]).await.unwrap();
        backend.upsert(&[p.clone()]).await.unwrap();
        assert_eq!(backend.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn search_filters_hidden_branches() {
        let backend = MemoryBackend::new();
        let mut p = sample_point("a.rs", "c1", 0, vec![1.0, 0.0]);
        p.payload.hidden_branches = vec!["feature".to_string()];
        backend.upsert(&[p]).await.unwrap();

        let on_main = backend.search(&[1.0, 0.0], "main", 10).await.unwrap();
        assert_eq!(on_main.len(), 1);

        let on_feature = backend.search(&[1.0, 0.0], "feature", 10).await.unwrap();
        assert!(on_feature.is_empty());
    }

    #[tokio::test]
    async fn search_ranks_by_similarity() {
        let backend = MemoryBackend::new();
        backend
            .upsert(&[
                sample_point("a.rs", "c1", 0, vec![1.0, 0.0]),
                sample_point("b.rs", "c1", 0, vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let results = backend.search(&[1.0, 0.1], "main", 2).await.unwrap();
        assert_eq!(results[0].payload.path, "a.rs");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn scroll_by_path_scopes_to_file() {
        let backend = MemoryBackend::new();
        backend
            .upsert(&[
                sample_point("a.rs", "c1", 0, vec![1.0]),
                sample_point("a.rs", "c1", 1, vec![1.0]),
                sample_point("b.rs", "c1", 0, vec![1.0]),
            ])
            .await
            .unwrap();
        assert_eq!(backend.scroll_by_path("a.rs").await.unwrap().len(), 2);
    }
}
