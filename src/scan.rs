//! Working-tree file discovery.
//!
//! Walks the indexing root and applies include/exclude globs plus a size
//! cap, producing the candidate file set for a run. Binary detection
//! happens later in the hash phase, which reads the bytes anyway.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::PathBuf;
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::config::IndexingConfig;

/// One candidate file from discovery.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub abs: PathBuf,
    /// Relative to the indexing root, `/`-normalized.
    pub rel: String,
    pub size: u64,
    pub mtime: i64,
}

/// Discover indexable files under the configured root.
pub fn scan_tree(config: &IndexingConfig) -> Result<Vec<ScannedFile>> {
    let root = &config.root;
    if !root.exists() {
        bail!("Indexing root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/.delta-index/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();

    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let rel = normalize_rel(path.strip_prefix(root).unwrap_or(path).to_string_lossy());

        if exclude_set.is_match(&rel) {
            continue;
        }
        if !include_set.is_match(&rel) {
            continue;
        }

        let metadata = entry.metadata()?;
        if metadata.len() > config.max_file_bytes {
            tracing::debug!(file = %rel, size = metadata.len(), "skipping oversized file");
            continue;
        }

        let mtime = metadata
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH)
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        files.push(ScannedFile {
            abs: path.to_path_buf(),
            rel,
            size: metadata.len(),
            mtime,
        });
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.rel.cmp(&b.rel));

    Ok(files)
}

/// Whether the first bytes look like binary content (NUL sniff).
pub fn looks_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(512).any(|&b| b == 0)
}

fn normalize_rel(rel: std::borrow::Cow<'_, str>) -> String {
    if rel.contains('\\') {
        rel.replace('\\', "/")
    } else {
        rel.into_owned()
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config_for(root: &Path) -> IndexingConfig {
        IndexingConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*.rs".to_string(), "**/*.md".to_string()],
            exclude_globs: vec!["**/vendor/**".to_string()],
            visibility_batch_size: 1000,
            max_file_bytes: 1_048_576,
        }
    }

    #[test]
    fn applies_include_and_exclude_globs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("vendor/dep")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "fn a() {}").unwrap();
        std::fs::write(dir.path().join("README.md"), "# readme").unwrap();
        std::fs::write(dir.path().join("data.bin"), "xx").unwrap();
        std::fs::write(dir.path().join("vendor/dep/x.rs"), "fn v() {}").unwrap();

        let files = scan_tree(&config_for(dir.path())).unwrap();
        let rels: Vec<&str> = files.iter().map(|f| f.rel.as_str()).collect();
        assert_eq!(rels, vec!["README.md", "src/lib.rs"]);
    }

    #[test]
    fn size_cap_skips_large_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.rs"), "x".repeat(4096)).unwrap();
        std::fs::write(dir.path().join("small.rs"), "fn s() {}").unwrap();

        let mut config = config_for(dir.path());
        config.max_file_bytes = 1024;
        let files = scan_tree(&config).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].rel, "small.rs");
    }

    #[test]
    fn missing_root_is_an_error() {
        let config = config_for(Path::new("/nonexistent/delta-index-test"));
        assert!(scan_tree(&config).is_err());
    }

    #[test]
    fn binary_sniff() {
        assert!(looks_binary(b"\x00\x01\x02"));
        assert!(!looks_binary(b"plain text\n"));
    }
}
