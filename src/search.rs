//! Semantic search over the visible index.
//!
//! Embeds the query through the gateway and delegates ranking to the
//! store's branch-filtered similarity query. Results print on stdout in a
//! plain, script-friendly format.

use anyhow::{bail, Result};
use std::sync::Arc;

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::git::GitRepo;
use crate::state::StateDb;
use crate::store::ContentStore;

pub async fn run_search(
    config: &Config,
    store: &ContentStore,
    provider: &Arc<dyn EmbeddingProvider>,
    state: &StateDb,
    query: &str,
    branch: Option<String>,
    limit: usize,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    if !config.embedding.is_enabled() {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    }

    let branch = match branch {
        Some(branch) => branch,
        None => resolve_branch(config, state).await?,
    };

    let vectors = provider.embed_batch(&[query.to_string()]).await?;
    let vector = vectors
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;

    let results = store.query_visible(&vector, &branch, limit).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    println!("branch: {branch}");
    for (rank, hit) in results.iter().enumerate() {
        println!(
            "{:>2}. {}:{}-{}  score={:.4}",
            rank + 1,
            hit.payload.path,
            hit.payload.start_line,
            hit.payload.end_line,
            hit.score
        );
        let snippet: String = hit.payload.text.lines().take(3).collect::<Vec<_>>().join(" | ");
        println!("    {snippet}");
    }

    Ok(())
}

/// Branch to query: the live git branch if available, else the branch the
/// index last tracked, else the non-git fallback label.
async fn resolve_branch(config: &Config, state: &StateDb) -> Result<String> {
    if let Some(repo) = GitRepo::discover(&config.indexing.root) {
        if let Ok(branch) = repo.current_branch() {
            return Ok(branch);
        }
    }
    Ok(state
        .tracked_branch()
        .await?
        .unwrap_or_else(|| "local".to_string()))
}
