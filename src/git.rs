//! Git topology analysis.
//!
//! Everything the engine needs from version control goes through the `git`
//! binary: resolving the current branch and commit, diffing file names
//! between two refs, locating merge bases, and detecting uncommitted
//! changes relative to HEAD. Non-git directories are handled by the caller
//! via the metadata fallback in `identity`.

use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::models::BranchDelta;

/// Point-in-time view of the repository used by the hash phase. One
/// snapshot serves a whole run so per-file work stays O(1).
#[derive(Debug, Clone)]
pub struct RepoSnapshot {
    pub head: String,
    pub branch: String,
    /// Paths (relative, `/`-normalized) that differ from HEAD.
    pub dirty_files: HashSet<String>,
    /// For each committed path, the hash of the commit that last touched
    /// it. This — not HEAD — is a file's identity, so files untouched by
    /// recent commits keep stable identity and never re-embed.
    pub last_commit_by_path: HashMap<String, String>,
}

/// Handle on a git working tree.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    /// Detect whether `root` is inside a git working tree.
    pub fn discover(root: &Path) -> Option<Self> {
        let output = Command::new("git")
            .args(["rev-parse", "--is-inside-work-tree"])
            .current_dir(root)
            .output()
            .ok()?;
        if output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true" {
            Some(Self {
                root: root.to_path_buf(),
            })
        } else {
            None
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("Failed to execute 'git {}'", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Current branch name. Detached HEAD states get a synthetic label
    /// derived from the short commit hash so they remain addressable.
    pub fn current_branch(&self) -> Result<String> {
        let name = self.run(&["rev-parse", "--abbrev-ref", "HEAD"])?.trim().to_string();
        if name == "HEAD" {
            let head = self.head_sha()?;
            let short = &head[..head.len().min(7)];
            return Ok(format!("detached-{short}"));
        }
        Ok(name)
    }

    /// Nearest common ancestor of two refs.
    pub fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        Ok(self.run(&["merge-base", a, b])?.trim().to_string())
    }

    /// File names that differ between two refs.
    pub fn diff_files(&self, old_ref: &str, new_ref: &str) -> Result<Vec<String>> {
        let out = self.run(&["diff", "--name-only", old_ref, new_ref])?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    /// All files tracked at a ref.
    pub fn ls_files(&self, reference: &str) -> Result<Vec<String>> {
        let out = self.run(&["ls-tree", "-r", "--name-only", reference])?;
        Ok(out.lines().map(|l| l.to_string()).filter(|l| !l.is_empty()).collect())
    }

    /// Paths with uncommitted changes relative to HEAD (staged, unstaged,
    /// and untracked). Renames contribute their new path.
    pub fn dirty_files(&self) -> Result<HashSet<String>> {
        let out = self.run(&["status", "--porcelain"])?;
        Ok(out.lines().filter_map(parse_status_line).collect())
    }

    /// Last-touching commit per tracked path, resolved in a single history
    /// walk (`git log --format=%H --name-only`): the first commit a path
    /// appears under, walking newest-first, is the one that last changed it.
    pub fn last_commits(&self) -> Result<HashMap<String, String>> {
        let out = self.run(&["log", "--format=%H", "--name-only"])?;
        let mut map = HashMap::new();
        let mut current = String::new();
        for line in out.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if line.len() == 40 && line.chars().all(|c| c.is_ascii_hexdigit()) {
                current = line.to_string();
            } else if !current.is_empty() {
                map.entry(line.to_string()).or_insert_with(|| current.clone());
            }
        }
        Ok(map)
    }

    pub fn snapshot(&self) -> Result<RepoSnapshot> {
        Ok(RepoSnapshot {
            head: self.head_sha()?,
            branch: self.current_branch()?,
            dirty_files: self.dirty_files()?,
            last_commit_by_path: self.last_commits()?,
        })
    }

    /// Changed/unchanged file sets between two branch tips. `changed` comes
    /// from the history diff; `unchanged` is the rest of the new tip's tree,
    /// so a branch switch only ever processes the delta.
    pub fn compute_delta(&self, old_branch: &str, new_branch: &str) -> Result<BranchDelta> {
        let changed = self.diff_files(old_branch, new_branch)?;
        let changed_set: HashSet<&str> = changed.iter().map(|s| s.as_str()).collect();

        let unchanged = self
            .ls_files(new_branch)?
            .into_iter()
            .filter(|f| !changed_set.contains(f.as_str()))
            .collect();

        Ok(BranchDelta { changed, unchanged })
    }
}

/// Parse one `git status --porcelain` line into the affected path.
fn parse_status_line(line: &str) -> Option<String> {
    if line.len() < 4 {
        return None;
    }
    let path_part = &line[3..];
    // Renames are reported as "old -> new"; the new path is the dirty one.
    let path = match path_part.split_once(" -> ") {
        Some((_, new)) => new,
        None => path_part,
    };
    let path = path.trim().trim_matches('"');
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}
