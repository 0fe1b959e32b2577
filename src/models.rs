//! Core data models used throughout delta-index.
//!
//! These types represent the files, chunks, and content points that flow
//! through the indexing pipeline and into the vector store.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resolved identity and provenance for one file on disk.
///
/// `commit` is either a real git commit hash or a synthetic
/// working-directory identifier (see `identity::working_dir_commit`), so
/// uncommitted edits get distinct, stable identity without touching history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Path relative to the indexing root, `/`-normalized.
    pub path: String,
    /// Hex SHA-256 over the file bytes.
    pub content_hash: String,
    /// Commit hash or synthetic working-directory identifier.
    pub commit: String,
    /// Branch the file was observed on (or the fallback label).
    pub branch: String,
    /// Stable identifier for the enclosing project.
    pub project_id: String,
    pub size: u64,
    pub mtime: i64,
}

/// One line-bounded segment of a file's content.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
}

/// Payload stored alongside each vector in the backing store.
///
/// Everything here is immutable after creation except `hidden_branches`:
/// the point is visible under branch B iff B is absent from that list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PointPayload {
    pub path: String,
    pub commit: String,
    /// Branch the content was first indexed on (provenance, not visibility).
    pub branch: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub language: String,
    pub project_id: String,
    pub content_hash: String,
    #[serde(default)]
    pub hidden_branches: Vec<String>,
}

/// One chunk of one file at one commit, ready for (or read from) the store.
#[derive(Debug, Clone)]
pub struct ContentPoint {
    /// Deterministic UUIDv5 over `path:commit:chunk_index`.
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

impl ContentPoint {
    pub fn is_visible_on(&self, branch: &str) -> bool {
        !self.payload.hidden_branches.iter().any(|b| b == branch)
    }
}

/// Result of comparing two branch tips: which tracked files changed.
///
/// Transient — produced and consumed within one branch-switch operation.
#[derive(Debug, Clone, Default)]
pub struct BranchDelta {
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
}

/// A point returned from `query_visible`, ranked by similarity.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: Uuid,
    pub score: f32,
    pub payload: PointPayload,
}

/// Counters accumulated over one indexing run.
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub chunks_written: usize,
    pub embed_calls: usize,
    pub time_ms: u64,
}

impl IndexStats {
    pub fn new() -> Self {
        Self::default()
    }
}
