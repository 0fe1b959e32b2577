//! Content identity and provenance metadata.
//!
//! Computes the deterministic identifiers that make writes idempotent: a
//! SHA-256 content fingerprint per file, a UUIDv5 per (path, commit, chunk)
//! triple, and a stable project identifier. For files that differ from their
//! last committed version, a synthetic working-directory commit identifier is
//! derived from modification time and size, so uncommitted edits get distinct
//! identity without touching git history.

use sha2::{Digest, Sha256};
use std::path::Path;
use uuid::Uuid;

use crate::git::RepoSnapshot;
use crate::models::FileMeta;

/// Namespace under which all content-point UUIDs are minted. Fixed so the
/// same (path, commit, chunk) triple hashes to the same id across runs and
/// machines.
const POINT_NAMESPACE: Uuid = Uuid::from_u128(0x8f3c_1d6a_42b7_4e09_9c5e_d11f_a0b2_c374);

/// Hex SHA-256 over raw file bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Deterministic identifier for one chunk of one file at one commit.
///
/// Identical inputs always yield the identical UUID, which is what lets the
/// store answer existence checks without a lookup table and makes
/// `put_content_batch` naturally idempotent.
pub fn point_id(path: &str, commit: &str, chunk_index: usize) -> Uuid {
    let name = format!("{path}:{commit}:{chunk_index}");
    Uuid::new_v5(&POINT_NAMESPACE, name.as_bytes())
}

/// Synthetic commit identifier for a file that differs from HEAD.
pub fn working_dir_commit(mtime: i64, size: u64) -> String {
    format!("wd-{mtime}-{size}")
}

/// Stable project identifier: short hash of the canonicalized root path.
pub fn project_id(root: &Path) -> String {
    let canonical = root
        .canonicalize()
        .unwrap_or_else(|_| root.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

/// Commit identity a file is expected to carry, from metadata alone.
///
/// Clean files take the commit that last touched them; dirty files (and
/// everything outside git) get the synthetic working-directory identifier.
/// The reconciler uses this for its O(1)-per-file comparison without
/// reading file bytes.
pub fn expected_commit(
    rel_path: &str,
    size: u64,
    mtime: i64,
    snapshot: Option<&RepoSnapshot>,
) -> String {
    match snapshot {
        Some(snap) if !snap.dirty_files.contains(rel_path) => snap
            .last_commit_by_path
            .get(rel_path)
            .cloned()
            .unwrap_or_else(|| snap.head.clone()),
        _ => working_dir_commit(mtime, size),
    }
}

/// Resolve full identity metadata for one file.
///
/// With a git snapshot, clean files take their last-touching commit and the
/// current branch; dirty files get a synthetic working-directory commit.
/// Without git, every file is treated as working-directory state on the
/// fallback branch label.
pub fn resolve_meta(
    rel_path: &str,
    bytes: &[u8],
    size: u64,
    mtime: i64,
    project: &str,
    snapshot: Option<&RepoSnapshot>,
) -> FileMeta {
    let hash = content_hash(bytes);

    let commit = expected_commit(rel_path, size, mtime, snapshot);
    let branch = match snapshot {
        Some(snap) => snap.branch.clone(),
        None => "local".to_string(),
    };

    FileMeta {
        path: rel_path.to_string(),
        content_hash: hash,
        commit,
        branch,
        project_id: project.to_string(),
        size,
        mtime,
    }
}

/// Language tag for the stored payload, from the file extension.
pub fn language_tag(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    match ext {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "jsx" => "javascript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "kt" | "kts" => "kotlin",
        "sh" | "bash" => "shell",
        "md" | "markdown" => "markdown",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        "sql" => "sql",
        "html" => "html",
        "css" => "css",
        _ => "text",
    }
}
