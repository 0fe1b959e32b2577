//! End-to-end engine tests over the in-process vector backend and a
//! deterministic stub embedding provider. Git-dependent scenarios skip
//! themselves when the `git` binary is unavailable.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use delta_index::config::{
    ChunkingConfig, Config, EmbeddingConfig, IndexingConfig, StateConfig, StorageConfig,
};
use delta_index::embedding::EmbeddingProvider;
use delta_index::models::ContentPoint;
use delta_index::pipeline::Pipeline;
use delta_index::progress::ProgressMode;
use delta_index::reconcile::Reconciler;
use delta_index::state::StateDb;
use delta_index::store::memory::MemoryBackend;
use delta_index::store::{ContentStore, VectorBackend, VisibilityUpdate};

/// Deterministic embeddings from text bytes; counts calls and can be told
/// to fail any batch containing a marker string.
struct StubProvider {
    calls: AtomicUsize,
    fail_marker: Mutex<Option<String>>,
}

impl StubProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_marker: Mutex::new(None),
        })
    }

    fn set_fail_marker(&self, marker: Option<&str>) {
        *self.fail_marker.lock().unwrap() = marker.map(|s| s.to_string());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for StubProvider {
    fn model_name(&self) -> &str {
        "stub"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = self.fail_marker.lock().unwrap().clone() {
            if texts.iter().any(|t| t.contains(&marker)) {
                bail!("stub provider: batch rejected");
            }
        }
        Ok(texts
            .iter()
            .map(|t| {
                let sum: u32 = t.bytes().map(u32::from).sum();
                vec![
                    (sum % 97) as f32,
                    (t.len() % 89) as f32,
                    t.lines().count() as f32,
                    1.0,
                ]
            })
            .collect())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    store: Arc<ContentStore>,
    state: Arc<StateDb>,
    provider: Arc<StubProvider>,
    reconciler: Reconciler,
}

fn test_config(root: &Path, state_path: &Path) -> Config {
    Config {
        storage: StorageConfig {
            backend: "memory".to_string(),
            url: String::new(),
            collection: "test".to_string(),
            distance: "Cosine".to_string(),
        },
        state: StateConfig {
            path: state_path.to_path_buf(),
        },
        embedding: EmbeddingConfig {
            provider: "disabled".to_string(),
            model: None,
            dims: Some(4),
            token_limit: 8192,
            safety_margin: 0.9,
            concurrency: 2,
            max_retries: 1,
            base_backoff_ms: 1,
            timeout_secs: 5,
        },
        chunking: ChunkingConfig {
            max_tokens: 50,
            overlap_lines: 0,
        },
        indexing: IndexingConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*.rs".to_string()],
            exclude_globs: Vec::new(),
            visibility_batch_size: 1000,
            max_file_bytes: 1_048_576,
        },
    }
}

async fn harness_with_backend(backend: Box<dyn VectorBackend>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("tree");
    std::fs::create_dir_all(&root).unwrap();

    let config = test_config(&root, &dir.path().join("state.db"));
    let store = Arc::new(ContentStore::new(backend, 1000));
    let state = Arc::new(
        StateDb::connect(&config.state.path, config.embedding.frontend_workers())
            .await
            .unwrap(),
    );
    state.migrate().await.unwrap();
    let provider = StubProvider::new();

    let pipeline = Arc::new(Pipeline::new(
        config.clone(),
        Arc::clone(&store),
        provider.clone() as Arc<dyn EmbeddingProvider>,
        Arc::clone(&state),
        CancellationToken::new(),
        ProgressMode::Off,
    ));
    let reconciler = Reconciler::new(
        config,
        Arc::clone(&store),
        Arc::clone(&state),
        pipeline,
    );

    Harness {
        _dir: dir,
        root,
        store,
        state,
        provider,
        reconciler,
    }
}

async fn harness() -> Harness {
    harness_with_backend(Box::new(MemoryBackend::new())).await
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(root: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn git_repo(root: &Path) {
    git(root, &["init", "-q"]);
    git(root, &["config", "user.email", "test@example.com"]);
    git(root, &["config", "user.name", "Test"]);
}

fn git_commit_all(root: &Path, message: &str) {
    git(root, &["add", "-A"]);
    git(root, &["commit", "-q", "-m", message]);
}

fn visible_paths(points: &[ContentPoint], branch: &str) -> HashSet<String> {
    points
        .iter()
        .filter(|p| p.is_visible_on(branch))
        .map(|p| p.payload.path.clone())
        .collect()
}

#[tokio::test]
async fn indexing_is_idempotent() {
    let h = harness().await;
    write(&h.root, "a.rs", "fn a() {}\nfn a2() {}\n");
    write(&h.root, "b.rs", "fn b() { println!(\"b\"); }\n");

    let first = h.reconciler.index_all(false).await.unwrap();
    assert_eq!(first.files_indexed, 2);
    let calls_after_first = h.provider.calls();
    assert!(calls_after_first > 0);

    // Second run: identical content identity, so the existence check
    // short-circuits and the provider is never called.
    let second = h.reconciler.index_all(false).await.unwrap();
    assert_eq!(second.files_indexed, 0);
    assert_eq!(second.files_skipped, 2);
    assert_eq!(h.provider.calls(), calls_after_first);
}

#[tokio::test]
async fn all_chunks_of_a_file_land_together() {
    let h = harness().await;
    // 50 max_tokens => 200 chars per chunk; this spans several chunks.
    let body = (0..40)
        .map(|i| format!("fn generated_{i}() {{ /* body of function {i} */ }}"))
        .collect::<Vec<_>>()
        .join("\n");
    write(&h.root, "big.rs", &body);

    h.reconciler.index_all(false).await.unwrap();

    let points = h.store.list_all_for_file("big.rs").await.unwrap();
    assert!(points.len() > 1);
    let total = points[0].payload.total_chunks;
    assert_eq!(points.len(), total);
    let indices: HashSet<usize> = points.iter().map(|p| p.payload.chunk_index).collect();
    assert_eq!(indices.len(), total);
    assert!(points.iter().all(|p| p.payload.total_chunks == total));
}

#[tokio::test]
async fn failed_embedding_batch_leaves_file_absent_until_retry() {
    let h = harness().await;
    write(&h.root, "good.rs", "fn good() {}\n");
    write(&h.root, "bad.rs", "fn bad() { POISON_MARKER }\n");

    h.provider.set_fail_marker(Some("POISON_MARKER"));
    let stats = h.reconciler.index_all(false).await.unwrap();
    assert_eq!(stats.files_indexed, 1);
    assert_eq!(stats.files_failed, 1);

    // Failure isolation: the good file is fully visible, the bad one has
    // no partial chunks anywhere.
    assert!(!h.store.list_all_for_file("good.rs").await.unwrap().is_empty());
    assert!(h.store.list_all_for_file("bad.rs").await.unwrap().is_empty());

    // Provider recovers; the next run picks the file up automatically.
    h.provider.set_fail_marker(None);
    let retry = h.reconciler.index_all(false).await.unwrap();
    assert_eq!(retry.files_failed, 0);
    assert_eq!(retry.files_indexed, 1);
    let points = h.store.list_all_for_file("bad.rs").await.unwrap();
    assert_eq!(points.len(), points[0].payload.total_chunks);
}

#[tokio::test]
async fn branch_switch_is_delta_sized_and_preserves_unchanged_content() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }

    let h = harness().await;
    git_repo(&h.root);
    write(&h.root, "a.rs", "fn alpha() {}\n");
    write(&h.root, "b.rs", "fn beta_original() {}\n");
    write(&h.root, "c.rs", "fn gamma() {}\n");
    git_commit_all(&h.root, "initial");
    git(&h.root, &["branch", "-M", "main"]);

    h.reconciler.index_all(false).await.unwrap();
    let calls_after_main = h.provider.calls();

    // Branch off and change only b.rs.
    git(&h.root, &["checkout", "-q", "-b", "feature"]);
    write(&h.root, "b.rs", "fn beta_rewritten_on_feature() { todo!() }\n");
    git_commit_all(&h.root, "rewrite beta");

    let stats = h.reconciler.switch(None).await.unwrap();
    assert_eq!(stats.files_indexed, 1);
    // O(δ): exactly one changed file, exactly its batches embedded.
    assert_eq!(h.provider.calls(), calls_after_main + 1);

    let points = h.store.list_all_points().await.unwrap();

    // a.rs and c.rs: untouched, visible on both branches.
    for branch in ["main", "feature"] {
        let vis = visible_paths(&points, branch);
        assert!(vis.contains("a.rs"), "a.rs missing on {branch}");
        assert!(vis.contains("c.rs"), "c.rs missing on {branch}");
        assert!(vis.contains("b.rs"), "b.rs missing on {branch}");
    }

    // b.rs resolves to different commits per branch.
    let b_points = h.store.list_all_for_file("b.rs").await.unwrap();
    let feature_commit: HashSet<&str> = b_points
        .iter()
        .filter(|p| p.is_visible_on("feature"))
        .map(|p| p.payload.commit.as_str())
        .collect();
    let main_commit: HashSet<&str> = b_points
        .iter()
        .filter(|p| p.is_visible_on("main"))
        .map(|p| p.payload.commit.as_str())
        .collect();
    assert_eq!(feature_commit.len(), 1);
    assert_eq!(main_commit.len(), 1);
    assert_ne!(feature_commit, main_commit);

    // Switching back re-uses the existing content: a visibility flip, no
    // embedding calls.
    let calls_before_back = h.provider.calls();
    git(&h.root, &["checkout", "-q", "main"]);
    let back = h.reconciler.switch(None).await.unwrap();
    assert_eq!(back.files_indexed, 0);
    assert_eq!(h.provider.calls(), calls_before_back);

    let points = h.store.list_all_points().await.unwrap();
    let b_on_main: Vec<&ContentPoint> = points
        .iter()
        .filter(|p| p.payload.path == "b.rs" && p.is_visible_on("main"))
        .collect();
    assert!(!b_on_main.is_empty());
    assert!(b_on_main
        .iter()
        .all(|p| p.payload.text.contains("beta_original")));
}

#[tokio::test]
async fn deleted_files_are_hidden_not_deleted() {
    let h = harness().await;
    write(&h.root, "keep.rs", "fn keep() {}\n");
    write(&h.root, "gone.rs", "fn gone() {}\n");

    h.reconciler.index_all(false).await.unwrap();
    std::fs::remove_file(h.root.join("gone.rs")).unwrap();
    h.reconciler.index_all(false).await.unwrap();

    let points = h.store.list_all_points().await.unwrap();
    let gone: Vec<&ContentPoint> = points
        .iter()
        .filter(|p| p.payload.path == "gone.rs")
        .collect();
    assert!(!gone.is_empty(), "hidden content must not be deleted");
    assert!(gone.iter().all(|p| !p.is_visible_on("local")));
}

#[tokio::test]
async fn gc_only_deletes_content_hidden_everywhere() {
    let h = harness().await;
    write(&h.root, "a.rs", "fn a() {}\n");
    write(&h.root, "b.rs", "fn b() {}\n");
    h.reconciler.index_all(false).await.unwrap();
    h.state.record_branch("other").await.unwrap();

    // Hide a.rs on every branch the engine knows about; b.rs only on one.
    h.store
        .update_visibility_batch(&[
            VisibilityUpdate {
                path: "a.rs".to_string(),
                commit: None,
                branch: "local".to_string(),
                hidden: true,
            },
            VisibilityUpdate {
                path: "a.rs".to_string(),
                commit: None,
                branch: "other".to_string(),
                hidden: true,
            },
            VisibilityUpdate {
                path: "b.rs".to_string(),
                commit: None,
                branch: "other".to_string(),
                hidden: true,
            },
        ])
        .await
        .unwrap();

    // The store derives its branch set from provenance plus hidden sets.
    let store_branches = h.store.list_all_branches().await.unwrap();
    assert!(store_branches.contains("local"));
    assert!(store_branches.contains("other"));

    let stats = h.reconciler.collect_garbage().await.unwrap();
    assert!(stats.points_deleted > 0);

    let remaining = h.store.list_all_points().await.unwrap();
    assert!(remaining.iter().all(|p| p.payload.path != "a.rs"));
    // b.rs is still visible on "local", so it survives.
    assert!(remaining.iter().any(|p| p.payload.path == "b.rs"));
}

#[tokio::test]
async fn reconcile_reindexes_only_mismatches() {
    let h = harness().await;
    write(&h.root, "stable.rs", "fn stable() {}\n");
    write(&h.root, "edited.rs", "fn edited_v1() {}\n");
    h.reconciler.index_all(false).await.unwrap();
    let calls = h.provider.calls();

    // Untouched tree: reconcile finds nothing to do.
    let noop = h.reconciler.reconcile().await.unwrap();
    assert_eq!(noop.files_indexed, 0);
    assert_eq!(h.provider.calls(), calls);

    // Edit one file (different length so the synthetic identity changes).
    write(&h.root, "edited.rs", "fn edited_v2_with_longer_body() {}\n");
    let fixed = h.reconciler.reconcile().await.unwrap();
    assert_eq!(fixed.files_indexed, 1);
    assert!(h.provider.calls() > calls);
}

#[tokio::test]
async fn query_visible_respects_branch_filter() {
    let h = harness().await;
    write(&h.root, "a.rs", "fn searchable() {}\n");
    h.reconciler.index_all(false).await.unwrap();

    let query = vec![1.0, 1.0, 1.0, 1.0];
    let hits = h.store.query_visible(&query, "local", 10).await.unwrap();
    assert_eq!(hits.len(), 1);

    // Hide the single (path, commit) pair on "local" only.
    let commit = hits[0].payload.commit.clone();
    let touched = h
        .store
        .set_hidden("a.rs", &commit, "local", true)
        .await
        .unwrap();
    assert!(touched > 0);

    let hidden = h.store.query_visible(&query, "local", 10).await.unwrap();
    assert!(hidden.is_empty());
    // Other branches still see it; vectors and text are untouched.
    let elsewhere = h.store.query_visible(&query, "elsewhere", 10).await.unwrap();
    assert_eq!(elsewhere.len(), 1);
    assert_eq!(elsewhere[0].payload.text, hits[0].payload.text);

    // And revealing it again restores the original visibility.
    h.store
        .set_hidden("a.rs", &commit, "local", false)
        .await
        .unwrap();
    assert_eq!(h.store.query_visible(&query, "local", 10).await.unwrap().len(), 1);
}

/// Provider that fires the shared cancellation token from inside its first
/// embedding call, then keeps answering normally — so in-flight files can
/// finish while queued ones are declined.
struct CancellingProvider {
    token: CancellationToken,
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for CancellingProvider {
    fn model_name(&self) -> &str {
        "cancelling"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.token.cancel();
        }
        Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
    }
}

#[tokio::test]
async fn cancellation_finishes_in_flight_files_and_starts_no_new_ones() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("tree");
    std::fs::create_dir_all(&root).unwrap();

    // Multi-chunk files (50 max_tokens => ~200 chars per chunk), far more
    // of them than the worker pool can have in flight at once.
    for i in 0..12 {
        let body = (0..10)
            .map(|line| format!("fn cancellable_{i}_{line}() {{ /* body text padding */ }}"))
            .collect::<Vec<_>>()
            .join("\n");
        write(&root, &format!("file_{i:02}.rs"), &body);
    }

    let config = test_config(&root, &dir.path().join("state.db"));
    let store = Arc::new(ContentStore::new(Box::new(MemoryBackend::new()), 1000));
    let state = Arc::new(
        StateDb::connect(&config.state.path, config.embedding.frontend_workers())
            .await
            .unwrap(),
    );
    state.migrate().await.unwrap();

    let cancel = CancellationToken::new();
    let provider = Arc::new(CancellingProvider {
        token: cancel.clone(),
        calls: AtomicUsize::new(0),
    });

    let pipeline = Arc::new(Pipeline::new(
        config.clone(),
        Arc::clone(&store),
        provider as Arc<dyn EmbeddingProvider>,
        Arc::clone(&state),
        cancel,
        ProgressMode::Off,
    ));
    let reconciler = Reconciler::new(config, Arc::clone(&store), Arc::clone(&state), pipeline);

    let stats = reconciler.index_all(false).await.unwrap();

    // The file whose embed call fired the cancellation still completes;
    // files not yet started are declined (4 workers, 12 files).
    assert!(stats.files_indexed >= 1);
    assert!(stats.files_indexed < 12);

    // Nothing half-written: every path present in the store carries its
    // complete chunk set, and a checkpoint exists iff the file landed.
    let points = store.list_all_points().await.unwrap();
    let mut by_path: std::collections::HashMap<&str, Vec<&ContentPoint>> =
        std::collections::HashMap::new();
    for point in &points {
        by_path.entry(&point.payload.path).or_default().push(point);
    }
    assert!(!by_path.is_empty());
    assert!(by_path.len() < 12);
    for (path, file_points) in &by_path {
        let total = file_points[0].payload.total_chunks;
        assert!(total > 1, "{path} should span several chunks");
        assert_eq!(file_points.len(), total, "{path} is partially written");
        assert!(state.checkpoint_get(path).await.unwrap().is_some());
    }
    for i in 0..12 {
        let rel = format!("file_{i:02}.rs");
        if !by_path.contains_key(rel.as_str()) {
            assert!(state.checkpoint_get(&rel).await.unwrap().is_none());
        }
    }
}

/// Delegating backend whose upsert can be made to fail, for the
/// storage-write error path.
struct FlakyBackend {
    inner: MemoryBackend,
    fail_writes: Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl VectorBackend for FlakyBackend {
    async fn ensure_collection(&self, dims: usize) -> Result<()> {
        self.inner.ensure_collection(dims).await
    }
    async fn existing_ids(&self, ids: &[uuid::Uuid]) -> Result<HashSet<uuid::Uuid>> {
        self.inner.existing_ids(ids).await
    }
    async fn upsert(&self, points: &[ContentPoint]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("storage unavailable");
        }
        self.inner.upsert(points).await
    }
    async fn set_hidden_branches(&self, updates: &[(uuid::Uuid, Vec<String>)]) -> Result<()> {
        self.inner.set_hidden_branches(updates).await
    }
    async fn search(
        &self,
        vector: &[f32],
        branch: &str,
        limit: usize,
    ) -> Result<Vec<delta_index::models::ScoredPoint>> {
        self.inner.search(vector, branch, limit).await
    }
    async fn scroll_all(&self) -> Result<Vec<ContentPoint>> {
        self.inner.scroll_all().await
    }
    async fn scroll_by_path(&self, path: &str) -> Result<Vec<ContentPoint>> {
        self.inner.scroll_by_path(path).await
    }
    async fn delete(&self, ids: &[uuid::Uuid]) -> Result<()> {
        self.inner.delete(ids).await
    }
    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}

#[tokio::test]
async fn storage_write_failure_is_retried_on_the_next_run() {
    let flag = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let flaky = Box::new(FlakyBackend {
        inner: MemoryBackend::new(),
        fail_writes: Arc::clone(&flag),
    });

    let h = harness_with_backend(flaky).await;
    write(&h.root, "a.rs", "fn a() {}\n");

    let stats = h.reconciler.index_all(false).await.unwrap();
    assert_eq!(stats.files_failed, 1);
    assert_eq!(h.store.point_count().await.unwrap(), 0);
    // No checkpoint was recorded for the failed file.
    assert!(h.state.checkpoint_get("a.rs").await.unwrap().is_none());

    flag.store(false, Ordering::SeqCst);
    let retry = h.reconciler.index_all(false).await.unwrap();
    assert_eq!(retry.files_indexed, 1);
    assert!(h.store.point_count().await.unwrap() > 0);
    assert!(h.state.checkpoint_get("a.rs").await.unwrap().is_some());
}
