//! Content-addressable storage with per-branch visibility.
//!
//! [`ContentStore`] wraps an external vector database behind the
//! [`VectorBackend`] trait. Points are immutable once written; the only
//! field ever mutated afterwards is the `hidden_branches` set, which makes
//! content invisible to specific branches without deleting it. Deterministic
//! point identifiers (see [`crate::identity::point_id`]) make upserts
//! idempotent and existence checks a direct id lookup.

pub mod memory;
pub mod qdrant;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::identity::point_id;
use crate::models::{ContentPoint, ScoredPoint};

/// Narrow interface over the backing vector database.
///
/// Implementations must provide batched atomic upsert (a failed call
/// persists nothing from the batch) and index-level filtering on the
/// `hidden_branches` payload field.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Create the collection if it does not exist.
    async fn ensure_collection(&self, dims: usize) -> Result<()>;

    /// Which of `ids` already exist.
    async fn existing_ids(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>>;

    /// Atomic multi-point upsert: all points persist, or none do.
    async fn upsert(&self, points: &[ContentPoint]) -> Result<()>;

    /// Overwrite the `hidden_branches` payload field for each listed point.
    async fn set_hidden_branches(&self, updates: &[(Uuid, Vec<String>)]) -> Result<()>;

    /// Similarity search restricted to points visible on `branch`
    /// (`branch ∉ hidden_branches`, evaluated by the backend).
    async fn search(&self, vector: &[f32], branch: &str, limit: usize)
        -> Result<Vec<ScoredPoint>>;

    /// Every stored point, payload only (vectors elided).
    async fn scroll_all(&self) -> Result<Vec<ContentPoint>>;

    /// Every stored point for one file path.
    async fn scroll_by_path(&self, path: &str) -> Result<Vec<ContentPoint>>;

    async fn delete(&self, ids: &[Uuid]) -> Result<()>;

    async fn count(&self) -> Result<usize>;
}

/// One visibility mutation: hide or reveal a (path, commit) pair on a branch.
#[derive(Debug, Clone)]
pub struct VisibilityUpdate {
    pub path: String,
    /// Restrict to one commit's points; `None` applies to every commit of
    /// the path.
    pub commit: Option<String>,
    pub branch: String,
    pub hidden: bool,
}

/// The content-visibility store: the sole owner of content points.
pub struct ContentStore {
    backend: Box<dyn VectorBackend>,
    visibility_batch_size: usize,
}

impl ContentStore {
    pub fn new(backend: Box<dyn VectorBackend>, visibility_batch_size: usize) -> Self {
        Self {
            backend,
            visibility_batch_size,
        }
    }

    pub async fn init(&self, dims: usize) -> Result<()> {
        self.backend.ensure_collection(dims).await
    }

    /// O(1) existence check via the deterministic identifier. Side-effect
    /// free.
    pub async fn content_exists(&self, path: &str, commit: &str, chunk_index: usize) -> Result<bool> {
        let id = point_id(path, commit, chunk_index);
        Ok(self.backend.existing_ids(&[id]).await?.contains(&id))
    }

    /// Whether any content exists for (path, commit). Chunk 0 is always
    /// written when a file is indexed, so checking it suffices.
    pub async fn file_indexed(&self, path: &str, commit: &str) -> Result<bool> {
        self.content_exists(path, commit, 0).await
    }

    /// Atomic multi-point upsert; fails the whole batch on any error.
    pub async fn put_content_batch(&self, points: &[ContentPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        self.backend.upsert(points).await
    }

    /// Mutate visibility of one (path, commit, branch) triple.
    pub async fn set_hidden(
        &self,
        path: &str,
        commit: &str,
        branch: &str,
        hidden: bool,
    ) -> Result<usize> {
        let update = VisibilityUpdate {
            path: path.to_string(),
            commit: Some(commit.to_string()),
            branch: branch.to_string(),
            hidden,
        };
        self.update_visibility_batch(std::slice::from_ref(&update)).await
    }

    /// Apply a set of visibility mutations, grouped into fixed-size backend
    /// batches to bound round trips. Returns the number of points touched.
    ///
    /// Updates for different files are independent; only per-point
    /// atomicity is guaranteed, matching the concurrency model.
    pub async fn update_visibility_batch(&self, entries: &[VisibilityUpdate]) -> Result<usize> {
        let mut pending: Vec<(Uuid, Vec<String>)> = Vec::new();
        let mut touched = 0usize;

        for entry in entries {
            let points = self.backend.scroll_by_path(&entry.path).await?;
            for point in points {
                if let Some(commit) = &entry.commit {
                    if &point.payload.commit != commit {
                        continue;
                    }
                }
                let mut hidden_branches = point.payload.hidden_branches.clone();
                let present = hidden_branches.iter().any(|b| b == &entry.branch);
                if entry.hidden && !present {
                    hidden_branches.push(entry.branch.clone());
                } else if !entry.hidden && present {
                    hidden_branches.retain(|b| b != &entry.branch);
                } else {
                    continue;
                }
                pending.push((point.id, hidden_branches));
                touched += 1;

                if pending.len() >= self.visibility_batch_size {
                    self.backend.set_hidden_branches(&pending).await?;
                    pending.clear();
                }
            }
        }

        if !pending.is_empty() {
            self.backend.set_hidden_branches(&pending).await?;
        }

        Ok(touched)
    }

    /// Make exactly one commit of `path` visible on `branch`: points at
    /// `commit` are revealed, points at any other commit are hidden. This
    /// is the visibility flip used when content for a (path, commit) pair
    /// already exists — O(points-of-one-file), no re-embedding.
    pub async fn set_exclusive_visibility(
        &self,
        path: &str,
        commit: &str,
        branch: &str,
    ) -> Result<usize> {
        let mut pending: Vec<(Uuid, Vec<String>)> = Vec::new();
        let mut touched = 0usize;

        for point in self.backend.scroll_by_path(path).await? {
            let hide = point.payload.commit != commit;
            let mut hidden_branches = point.payload.hidden_branches.clone();
            let present = hidden_branches.iter().any(|b| b == branch);
            if hide && !present {
                hidden_branches.push(branch.to_string());
            } else if !hide && present {
                hidden_branches.retain(|b| b != branch);
            } else {
                continue;
            }
            pending.push((point.id, hidden_branches));
            touched += 1;

            if pending.len() >= self.visibility_batch_size {
                self.backend.set_hidden_branches(&pending).await?;
                pending.clear();
            }
        }

        if !pending.is_empty() {
            self.backend.set_hidden_branches(&pending).await?;
        }

        Ok(touched)
    }

    /// Ranked similarity query over content visible on `branch`.
    pub async fn query_visible(
        &self,
        vector: &[f32],
        branch: &str,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        self.backend.search(vector, branch, limit).await
    }

    pub async fn list_all_for_file(&self, path: &str) -> Result<Vec<ContentPoint>> {
        self.backend.scroll_by_path(path).await
    }

    pub async fn list_all_points(&self) -> Result<Vec<ContentPoint>> {
        self.backend.scroll_all().await
    }

    /// Every branch name the store knows about: provenance branches plus
    /// every branch appearing in a hidden set.
    pub async fn list_all_branches(&self) -> Result<HashSet<String>> {
        let mut branches = HashSet::new();
        for point in self.backend.scroll_all().await? {
            branches.insert(point.payload.branch.clone());
            branches.extend(point.payload.hidden_branches.iter().cloned());
        }
        Ok(branches)
    }

    /// Commit identity currently visible on `branch`, per file path.
    /// Used by the reconciler's expected-vs-visible comparison.
    pub async fn visible_commits_by_path(&self, branch: &str) -> Result<HashMap<String, String>> {
        let mut map = HashMap::new();
        for point in self.backend.scroll_all().await? {
            if point.is_visible_on(branch) {
                map.insert(point.payload.path.clone(), point.payload.commit.clone());
            }
        }
        Ok(map)
    }

    pub async fn delete_points(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.backend.delete(ids).await
    }

    pub async fn point_count(&self) -> Result<usize> {
        self.backend.count().await
    }
}
