//! The two-phase indexing pipeline.
//!
//! Phase 1 (hash) is a pool of T+2 workers that read file bytes, compute
//! content hashes, and resolve commit provenance into a shared path →
//! metadata map. It has no dependency on the embedding provider and runs
//! ahead of phase 2.
//!
//! Phase 2 (chunk/embed/write) is a second pool of T+2 workers, each
//! driving one file at a time: chunk, assemble token-bounded batches,
//! submit them to the embedding gateway (capped at T concurrent calls),
//! await the whole set, then write every chunk's content point in one
//! atomic batch. A file is checkpointed only after that write succeeds, so
//! no partially-indexed file is ever visible as complete.
//!
//! Cancellation is cooperative: workers finish the file in flight and
//! decline to start new ones.

use anyhow::{bail, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{assemble_batches, ChunkBatch};
use crate::chunk::chunk_lines;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::git::RepoSnapshot;
use crate::identity::{language_tag, point_id, resolve_meta};
use crate::models::{Chunk, ContentPoint, FileMeta, IndexStats, PointPayload};
use crate::progress::{render, ProgressMode, SlotStatus, SlotTable};
use crate::scan::{looks_binary, ScannedFile};
use crate::state::StateDb;
use crate::store::ContentStore;

/// Per-file work item flowing through phase 2. Owned exclusively by the
/// worker currently processing it; ownership transfers stage to stage.
struct FileUnit {
    file: ScannedFile,
    meta: FileMeta,
    chunks: Vec<Chunk>,
    batches: Vec<ChunkBatch>,
    /// Embedding per chunk index, reassembled in original chunk order.
    embeddings: HashMap<usize, Vec<f32>>,
}

pub struct Pipeline {
    config: Config,
    store: Arc<ContentStore>,
    provider: Arc<dyn EmbeddingProvider>,
    state: Arc<StateDb>,
    slots: Arc<SlotTable>,
    /// Gateway cap: at most T embedding calls in flight across all files.
    embed_permits: Arc<Semaphore>,
    embed_calls: AtomicUsize,
    cancel: CancellationToken,
    progress: ProgressMode,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: Arc<ContentStore>,
        provider: Arc<dyn EmbeddingProvider>,
        state: Arc<StateDb>,
        cancel: CancellationToken,
        progress: ProgressMode,
    ) -> Self {
        let t = config.embedding.concurrency;
        Self {
            config,
            store,
            provider,
            state,
            slots: Arc::new(SlotTable::new(t + 2)),
            embed_permits: Arc::new(Semaphore::new(t)),
            embed_calls: AtomicUsize::new(0),
            cancel,
            progress,
        }
    }

    pub fn embed_call_count(&self) -> usize {
        self.embed_calls.load(Ordering::Relaxed)
    }

    /// Index `files`, skipping any whose content identity is already in the
    /// store. With `force_full`, existence checks are bypassed and
    /// everything re-embeds.
    pub async fn run(
        self: Arc<Self>,
        files: Vec<ScannedFile>,
        snapshot: Option<RepoSnapshot>,
        project_id: String,
        force_full: bool,
    ) -> Result<IndexStats> {
        let started = Instant::now();
        let mut stats = IndexStats::new();
        stats.files_scanned = files.len();

        let branch = snapshot
            .as_ref()
            .map(|s| s.branch.clone())
            .unwrap_or_else(|| "local".to_string());
        info!(files = files.len(), branch = %branch, "indexing run started");

        // New content belongs to this branch only: it is born hidden on
        // every other branch the engine knows, and revealed elsewhere by
        // the reconciler's visibility flips when those branches earn it.
        let born_hidden: Arc<Vec<String>> = {
            let mut others: Vec<String> = self
                .state
                .known_branches()
                .await?
                .into_iter()
                .filter(|b| b != &branch)
                .collect();
            others.sort_unstable();
            Arc::new(others)
        };

        // ---- Phase 1: hash pool -------------------------------------------------
        let meta_map = self.hash_phase(files, snapshot, project_id).await;

        // ---- Phase 2: chunk / embed / write pool --------------------------------
        let queue: Arc<Mutex<VecDeque<(ScannedFile, FileMeta)>>> = {
            let mut ordered: Vec<(ScannedFile, FileMeta)> = meta_map.into_values().collect();
            ordered.sort_by(|a, b| a.0.rel.cmp(&b.0.rel));
            Arc::new(Mutex::new(ordered.into()))
        };

        let renderer = self.spawn_renderer();

        let counters = Arc::new(Mutex::new(IndexStats::new()));
        let mut workers = JoinSet::new();
        for _ in 0..self.config.embedding.frontend_workers() {
            let pipeline = Arc::clone(&self);
            let queue = Arc::clone(&queue);
            let counters = Arc::clone(&counters);
            let branch = branch.clone();
            let born_hidden = Arc::clone(&born_hidden);
            workers.spawn(async move {
                loop {
                    if pipeline.cancel.is_cancelled() {
                        break;
                    }
                    let next = queue.lock().unwrap().pop_front();
                    let Some((file, meta)) = next else { break };
                    let rel = file.rel.clone();
                    match pipeline
                        .process_file(file, meta, &branch, &born_hidden, force_full)
                        .await
                    {
                        Ok(FileOutcome::Indexed { chunks }) => {
                            let mut c = counters.lock().unwrap();
                            c.files_indexed += 1;
                            c.chunks_written += chunks;
                        }
                        Ok(FileOutcome::Skipped) => {
                            counters.lock().unwrap().files_skipped += 1;
                        }
                        Err(err) => {
                            warn!(file = %rel, error = %err, "file failed; will retry next run");
                            counters.lock().unwrap().files_failed += 1;
                        }
                    }
                }
            });
        }
        while workers.join_next().await.is_some() {}

        if let Some(handle) = renderer {
            handle.abort();
        }

        let c = counters.lock().unwrap().clone();
        stats.files_indexed = c.files_indexed;
        stats.files_skipped = c.files_skipped + (stats.files_scanned
            - c.files_indexed
            - c.files_skipped
            - c.files_failed);
        stats.files_failed = c.files_failed;
        stats.chunks_written = c.chunks_written;
        stats.embed_calls = self.embed_call_count();
        stats.time_ms = started.elapsed().as_millis() as u64;

        info!(
            indexed = stats.files_indexed,
            skipped = stats.files_skipped,
            failed = stats.files_failed,
            chunks = stats.chunks_written,
            "indexing run finished"
        );

        Ok(stats)
    }

    /// Phase 1: read bytes, hash, resolve provenance. Pure CPU/I-O, fully
    /// decoupled from the embedding provider.
    async fn hash_phase(
        &self,
        files: Vec<ScannedFile>,
        snapshot: Option<RepoSnapshot>,
        project_id: String,
    ) -> HashMap<String, (ScannedFile, FileMeta)> {
        let queue: Arc<Mutex<VecDeque<ScannedFile>>> = Arc::new(Mutex::new(files.into()));
        let results: Arc<Mutex<HashMap<String, (ScannedFile, FileMeta)>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let snapshot = Arc::new(snapshot);
        let project_id = Arc::new(project_id);

        let mut workers = JoinSet::new();
        for _ in 0..self.config.embedding.frontend_workers() {
            let cancel = self.cancel.clone();
            let queue = Arc::clone(&queue);
            let results = Arc::clone(&results);
            let snapshot = Arc::clone(&snapshot);
            let project_id = Arc::clone(&project_id);
            workers.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let next = queue.lock().unwrap().pop_front();
                    let Some(file) = next else { break };

                    let bytes = match tokio::fs::read(&file.abs).await {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            warn!(file = %file.rel, error = %err, "unreadable, skipping");
                            continue;
                        }
                    };
                    if looks_binary(&bytes) {
                        debug!(file = %file.rel, "binary, skipping");
                        continue;
                    }

                    let meta = resolve_meta(
                        &file.rel,
                        &bytes,
                        file.size,
                        file.mtime,
                        &project_id,
                        snapshot.as_ref().as_ref(),
                    );
                    results.lock().unwrap().insert(file.rel.clone(), (file, meta));
                }
            });
        }
        while workers.join_next().await.is_some() {}

        Arc::try_unwrap(results)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_default()
    }

    /// Phase 2 for one file. The returned outcome is only `Indexed` after
    /// the atomic batch write has succeeded and the checkpoint is recorded.
    async fn process_file(
        &self,
        file: ScannedFile,
        meta: FileMeta,
        branch: &str,
        born_hidden: &[String],
        force_full: bool,
    ) -> Result<FileOutcome> {
        // Idempotence short-circuit: identical content identity already in
        // the store costs one existence check, zero embedding calls.
        if !force_full && self.store.file_indexed(&meta.path, &meta.commit).await? {
            self.store
                .set_exclusive_visibility(&meta.path, &meta.commit, branch)
                .await?;
            self.state
                .checkpoint_put(&meta.path, &meta.commit, &meta.content_hash)
                .await?;
            debug!(file = %meta.path, "content already indexed, visibility ensured");
            return Ok(FileOutcome::Skipped);
        }

        let slot = self.slots.acquire(&file.rel, file.size).await;
        let result = self
            .process_file_in_slot(slot, file, meta, branch, born_hidden)
            .await;
        self.slots.release(slot);
        result
    }

    async fn process_file_in_slot(
        &self,
        slot: usize,
        file: ScannedFile,
        meta: FileMeta,
        branch: &str,
        born_hidden: &[String],
    ) -> Result<FileOutcome> {
        let mut unit = FileUnit {
            file,
            meta,
            chunks: Vec::new(),
            batches: Vec::new(),
            embeddings: HashMap::new(),
        };

        // Chunk
        self.slots.update(slot, SlotStatus::Chunking)?;
        let content = tokio::fs::read_to_string(&unit.file.abs).await?;
        unit.chunks = chunk_lines(
            &content,
            self.config.chunking.max_tokens,
            self.config.chunking.overlap_lines,
        );
        if unit.chunks.is_empty() {
            // Nothing to embed; record identity so reconcile leaves it alone.
            self.state
                .checkpoint_put(&unit.meta.path, &unit.meta.commit, &unit.meta.content_hash)
                .await?;
            return Ok(FileOutcome::Skipped);
        }

        // Token-aware batch assembly under the safety-margined limit.
        let limit = self.config.embedding.effective_token_limit();
        let provider = Arc::clone(&self.provider);
        unit.batches = assemble_batches(&unit.chunks, limit, |text| provider.count_tokens(text));

        // Submit every batch, then await the whole set for the file.
        self.slots.update(slot, SlotStatus::Vectorizing)?;
        let mut calls = JoinSet::new();
        for (batch_no, batch) in unit.batches.iter().enumerate() {
            let provider = Arc::clone(&self.provider);
            let permits = Arc::clone(&self.embed_permits);
            let indices = batch.chunk_indices.clone();
            let texts = batch.texts.clone();
            self.embed_calls.fetch_add(1, Ordering::Relaxed);
            calls.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("gateway semaphore closed");
                let vectors = provider.embed_batch(&texts).await?;
                Ok::<(usize, Vec<usize>, Vec<Vec<f32>>), anyhow::Error>((batch_no, indices, vectors))
            });
        }

        self.slots.update(slot, SlotStatus::Waiting)?;
        let mut batch_error = None;
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(Ok((_batch_no, indices, vectors))) => {
                    if vectors.len() != indices.len() {
                        batch_error =
                            Some(anyhow::anyhow!("provider returned mismatched vector count"));
                        continue;
                    }
                    for (chunk_index, vector) in indices.into_iter().zip(vectors) {
                        unit.embeddings.insert(chunk_index, vector);
                    }
                }
                Ok(Err(err)) => batch_error = Some(err),
                Err(err) => batch_error = Some(anyhow::anyhow!("embedding task panicked: {err}")),
            }
        }
        if let Some(err) = batch_error {
            // One failed batch fails the whole file; nothing is written.
            bail!("embedding failed for {}: {err}", unit.meta.path);
        }

        // Construct and atomically write every chunk's point.
        self.slots.update(slot, SlotStatus::Finalizing)?;
        let points = build_points(&unit, branch, born_hidden)?;
        let written = points.len();
        self.store.put_content_batch(&points).await?;

        // Older commits of this path stop being visible on this branch now
        // that the new content landed.
        self.store
            .set_exclusive_visibility(&unit.meta.path, &unit.meta.commit, branch)
            .await?;

        self.state
            .checkpoint_put(&unit.meta.path, &unit.meta.commit, &unit.meta.content_hash)
            .await?;

        self.slots.update(slot, SlotStatus::Complete)?;
        Ok(FileOutcome::Indexed { chunks: written })
    }

    fn spawn_renderer(&self) -> Option<tokio::task::JoinHandle<()>> {
        if self.progress == ProgressMode::Off {
            return None;
        }
        let slots = Arc::clone(&self.slots);
        let mode = self.progress;
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_millis(500));
            loop {
                tick.tick().await;
                render(&slots, mode);
            }
        }))
    }
}

enum FileOutcome {
    Indexed { chunks: usize },
    Skipped,
}

fn build_points(unit: &FileUnit, branch: &str, born_hidden: &[String]) -> Result<Vec<ContentPoint>> {
    let total = unit.chunks.len();
    let mut points = Vec::with_capacity(total);

    for chunk in &unit.chunks {
        let vector = unit
            .embeddings
            .get(&chunk.index)
            .ok_or_else(|| anyhow::anyhow!("missing embedding for chunk {}", chunk.index))?
            .clone();
        points.push(ContentPoint {
            id: point_id(&unit.meta.path, &unit.meta.commit, chunk.index),
            vector,
            payload: PointPayload {
                path: unit.meta.path.clone(),
                commit: unit.meta.commit.clone(),
                branch: branch.to_string(),
                chunk_index: chunk.index,
                total_chunks: total,
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                text: chunk.text.clone(),
                language: language_tag(&unit.meta.path).to_string(),
                project_id: unit.meta.project_id.clone(),
                content_hash: unit.meta.content_hash.clone(),
                hidden_branches: born_hidden.to_vec(),
            },
        });
    }

    Ok(points)
}
