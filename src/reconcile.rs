//! Reconciliation, branch switching, and garbage collection.
//!
//! The reconciler decides the pipeline's work set. A branch switch costs
//! O(δ): only files the history diff names are processed, and files whose
//! (path, commit) content already exists just get a visibility flip. The
//! full `reconcile` pass compares expected vs. currently-visible content
//! identity per tracked file — a mismatch, not absence, is what triggers
//! re-indexing, so untouched files cost one comparison each.
//!
//! The garbage collector deletes a point only when its hidden set covers
//! every known branch; content visible anywhere is never removed.

use anyhow::{bail, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::git::{GitRepo, RepoSnapshot};
use crate::identity::{expected_commit, project_id};
use crate::models::IndexStats;
use crate::pipeline::Pipeline;
use crate::scan::{scan_tree, ScannedFile};
use crate::state::StateDb;
use crate::store::{ContentStore, VisibilityUpdate};

pub struct Reconciler {
    config: Config,
    store: Arc<ContentStore>,
    state: Arc<StateDb>,
    pipeline: Arc<Pipeline>,
}

/// Outcome of one garbage-collection pass.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub points_scanned: usize,
    pub points_deleted: usize,
    pub known_branches: usize,
}

impl Reconciler {
    pub fn new(
        config: Config,
        store: Arc<ContentStore>,
        state: Arc<StateDb>,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        Self {
            config,
            store,
            state,
            pipeline,
        }
    }

    /// Re-detected on every operation so a repository initialized after the
    /// engine starts is still picked up.
    fn repo(&self) -> Option<GitRepo> {
        GitRepo::discover(&self.config.indexing.root)
    }

    /// Repository snapshot, or `None` when the tree is not a git working
    /// tree — or git itself is failing, in which case the whole tree is
    /// treated as the file set rather than failing the run.
    fn snapshot(&self) -> Option<RepoSnapshot> {
        let repo = self.repo()?;
        match repo.snapshot() {
            Ok(snap) => Some(snap),
            Err(err) => {
                warn!(error = %err, "git snapshot failed; falling back to working-tree metadata");
                None
            }
        }
    }

    async fn record_branch(&self, branch: &str) -> Result<()> {
        self.state.record_branch(branch).await?;
        self.state.set_tracked_branch(branch).await?;
        Ok(())
    }

    /// Index the whole tree (incremental unless `force_full`).
    pub async fn index_all(&self, force_full: bool) -> Result<IndexStats> {
        let files = scan_tree(&self.config.indexing)?;
        let snapshot = self.snapshot();
        let branch = snapshot
            .as_ref()
            .map(|s| s.branch.clone())
            .unwrap_or_else(|| "local".to_string());
        let project = project_id(&self.config.indexing.root);

        let on_disk: HashSet<String> = files.iter().map(|f| f.rel.clone()).collect();
        let stats = self
            .pipeline
            .clone()
            .run(files, snapshot, project, force_full)
            .await?;

        self.hide_missing(&on_disk, &branch).await?;
        self.record_branch(&branch).await?;
        Ok(stats)
    }

    /// React to a branch switch: process only the delta between the
    /// previously tracked branch and the branch the working tree is now on.
    pub async fn switch(&self, expected: Option<&str>) -> Result<IndexStats> {
        let Some(repo) = self.repo() else {
            // Without git there are no branches to switch between.
            return self.index_all(false).await;
        };

        let snapshot = match repo.snapshot() {
            Ok(snap) => snap,
            Err(err) => {
                warn!(error = %err, "git snapshot failed; indexing full tree instead");
                return self.index_all(false).await;
            }
        };

        if let Some(expected) = expected {
            if expected != snapshot.branch {
                bail!(
                    "working tree is on '{}', not '{}'; check out the branch first",
                    snapshot.branch,
                    expected
                );
            }
        }

        let old_branch = self.state.tracked_branch().await?;
        let new_branch = snapshot.branch.clone();

        let files = scan_tree(&self.config.indexing)?;
        let on_disk: HashSet<String> = files.iter().map(|f| f.rel.clone()).collect();

        let work_set: Vec<ScannedFile> = match &old_branch {
            Some(old) if old != &new_branch => {
                match repo.compute_delta(old, &new_branch) {
                    Ok(delta) => {
                        info!(
                            old = %old,
                            new = %new_branch,
                            changed = delta.changed.len(),
                            unchanged = delta.unchanged.len(),
                            "branch switch delta"
                        );
                        let changed: HashSet<String> = delta.changed.into_iter().collect();
                        // Dirty files need (re)indexing regardless of what
                        // the tip diff says.
                        files
                            .into_iter()
                            .filter(|f| {
                                changed.contains(&f.rel) || snapshot.dirty_files.contains(&f.rel)
                            })
                            .collect()
                    }
                    Err(err) => {
                        warn!(error = %err, "branch delta failed; processing full file set");
                        files
                    }
                }
            }
            // First run or same branch: everything is candidate work; the
            // pipeline's existence checks keep the real cost incremental.
            _ => files,
        };

        let project = project_id(&self.config.indexing.root);
        let stats = self
            .pipeline
            .clone()
            .run(work_set, Some(snapshot), project, false)
            .await?;

        // Content visible on the old branch but gone from this tree is
        // hidden for the new branch — never deleted.
        self.hide_missing(&on_disk, &new_branch).await?;
        self.record_branch(&new_branch).await?;
        Ok(stats)
    }

    /// Full reconcile pass: one identity comparison per tracked file,
    /// re-indexing only mismatches.
    pub async fn reconcile(&self) -> Result<IndexStats> {
        let files = scan_tree(&self.config.indexing)?;
        let snapshot = self.snapshot();
        let branch = snapshot
            .as_ref()
            .map(|s| s.branch.clone())
            .unwrap_or_else(|| "local".to_string());

        let visible = self.store.visible_commits_by_path(&branch).await?;
        let checkpoints = self.state.checkpoints_all().await?;

        let on_disk: HashSet<String> = files.iter().map(|f| f.rel.clone()).collect();
        let mut mismatched = Vec::new();
        for file in files {
            let expected = expected_commit(&file.rel, file.size, file.mtime, snapshot.as_ref());
            match visible.get(&file.rel) {
                Some(current) if current == &expected => {}
                Some(_) => mismatched.push(file),
                None => {
                    // Absent from the store is fine if the checkpoint says
                    // the file produced no content (empty or binary).
                    let recorded = checkpoints.get(&file.rel);
                    if recorded.map(|cp| cp.commit == expected) != Some(true) {
                        mismatched.push(file);
                    }
                }
            }
        }

        info!(mismatched = mismatched.len(), branch = %branch, "reconcile scheduled work");

        let project = project_id(&self.config.indexing.root);
        let stats = self
            .pipeline
            .clone()
            .run(mismatched, snapshot, project, false)
            .await?;

        self.hide_missing(&on_disk, &branch).await?;
        self.record_branch(&branch).await?;
        Ok(stats)
    }

    /// Hide content for paths that no longer exist in the working tree.
    async fn hide_missing(&self, on_disk: &HashSet<String>, branch: &str) -> Result<usize> {
        let visible = self.store.visible_commits_by_path(branch).await?;
        let mut updates = Vec::new();
        for path in visible.keys() {
            if !on_disk.contains(path) {
                updates.push(VisibilityUpdate {
                    path: path.clone(),
                    commit: None,
                    branch: branch.to_string(),
                    hidden: true,
                });
                self.state.checkpoint_remove(path).await?;
            }
        }
        if updates.is_empty() {
            return Ok(0);
        }
        let touched = self.store.update_visibility_batch(&updates).await?;
        info!(paths = updates.len(), points = touched, "hid content for removed files");
        Ok(touched)
    }

    /// Delete points hidden on every known branch.
    pub async fn collect_garbage(&self) -> Result<GcStats> {
        let points = self.store.list_all_points().await?;
        let mut known = self.state.known_branches().await?;
        for point in &points {
            known.insert(point.payload.branch.clone());
            known.extend(point.payload.hidden_branches.iter().cloned());
        }

        let mut stats = GcStats {
            points_scanned: points.len(),
            points_deleted: 0,
            known_branches: known.len(),
        };

        if known.is_empty() {
            return Ok(stats);
        }

        let doomed: Vec<Uuid> = points
            .iter()
            .filter(|p| {
                known.iter().all(|branch| {
                    p.payload.hidden_branches.iter().any(|h| h == branch)
                })
            })
            .map(|p| p.id)
            .collect();

        for chunk in doomed.chunks(self.config.indexing.visibility_batch_size) {
            self.store.delete_points(chunk).await?;
            stats.points_deleted += chunk.len();
        }

        info!(
            scanned = stats.points_scanned,
            deleted = stats.points_deleted,
            "garbage collection finished"
        );
        Ok(stats)
    }
}
