//! # Delta Index CLI (`dix`)
//!
//! The `dix` binary drives the indexing engine. All commands accept a
//! `--config` flag pointing to a TOML configuration file.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dix init` | Create the state database and vector collection |
//! | `dix index` | Index the working tree (incremental) |
//! | `dix switch [branch]` | Update visibility after a branch change (O(δ)) |
//! | `dix reconcile` | Compare expected vs. visible identity; fix mismatches |
//! | `dix gc` | Delete content hidden on every known branch |
//! | `dix search "<query>"` | Semantic search over the current branch |
//! | `dix status` | Show checkpoint, branch, and point counts |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use delta_index::chunk::chunk_lines;
use delta_index::config::{load_config, Config};
use delta_index::embedding::{create_provider, EmbeddingProvider};
use delta_index::models::IndexStats;
use delta_index::pipeline::Pipeline;
use delta_index::progress::ProgressMode;
use delta_index::reconcile::Reconciler;
use delta_index::scan::scan_tree;
use delta_index::search::run_search;
use delta_index::state::StateDb;
use delta_index::store::memory::MemoryBackend;
use delta_index::store::qdrant::QdrantBackend;
use delta_index::store::{ContentStore, VectorBackend};

/// Delta Index — a git-aware incremental semantic indexing engine.
#[derive(Parser)]
#[command(
    name = "dix",
    about = "Delta Index — a git-aware incremental semantic indexing engine",
    version,
    long_about = "Delta Index turns a source tree into vector embeddings for semantic \
    retrieval while tracking git branch history. Branches share storage through per-point \
    visibility, so switching branches costs work proportional to the changed files only."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./dix.toml")]
    config: PathBuf,

    /// Progress output: auto (TTY), off, human, or json.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the state database and the vector collection.
    ///
    /// Idempotent — running it multiple times is safe.
    Init,

    /// Index the working tree.
    ///
    /// Incremental by default: content already in the store is skipped via
    /// existence checks. Failed files are retried automatically on the
    /// next run.
    Index {
        /// Re-embed everything, bypassing existence checks.
        #[arg(long)]
        full: bool,

        /// Show file and chunk counts without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Update the index after a branch change.
    ///
    /// Processes only files that differ between the previously tracked
    /// branch and the current one; unchanged content gets a visibility
    /// flip instead of re-embedding.
    Switch {
        /// Branch the working tree is expected to be on (checked against
        /// git; informational).
        branch: Option<String>,
    },

    /// Compare expected vs. visible content identity for every tracked
    /// file and re-index only the mismatches.
    Reconcile,

    /// Delete content hidden on every known branch.
    Gc,

    /// Semantic search over content visible on the current branch.
    Search {
        query: String,

        /// Query a specific branch instead of the current one.
        #[arg(long)]
        branch: Option<String>,

        /// Maximum number of results.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Show index status: tracked branch, checkpoints, stored points.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let progress = parse_progress(&cli.progress)?;

    match cli.command {
        Commands::Init => run_init(&config).await,
        Commands::Index { full, dry_run } => {
            if dry_run {
                run_dry_run(&config)
            } else {
                let engine = Engine::build(&config, progress).await?;
                let stats = engine.reconciler.index_all(full).await?;
                print_stats("index", &stats);
                Ok(())
            }
        }
        Commands::Switch { branch } => {
            let engine = Engine::build(&config, progress).await?;
            let stats = engine.reconciler.switch(branch.as_deref()).await?;
            print_stats("switch", &stats);
            Ok(())
        }
        Commands::Reconcile => {
            let engine = Engine::build(&config, progress).await?;
            let stats = engine.reconciler.reconcile().await?;
            print_stats("reconcile", &stats);
            Ok(())
        }
        Commands::Gc => {
            let engine = Engine::build(&config, progress).await?;
            let stats = engine.reconciler.collect_garbage().await?;
            println!("gc");
            println!("  known branches: {}", stats.known_branches);
            println!("  points scanned: {}", stats.points_scanned);
            println!("  points deleted: {}", stats.points_deleted);
            println!("ok");
            Ok(())
        }
        Commands::Search {
            query,
            branch,
            limit,
        } => {
            let engine = Engine::build(&config, progress).await?;
            run_search(
                &config,
                &engine.store,
                &engine.provider,
                &engine.state,
                &query,
                branch,
                limit,
            )
            .await
        }
        Commands::Status => run_status(&config).await,
    }
}

/// Everything a command needs, wired together from configuration.
struct Engine {
    store: Arc<ContentStore>,
    provider: Arc<dyn EmbeddingProvider>,
    state: Arc<StateDb>,
    reconciler: Reconciler,
}

impl Engine {
    async fn build(config: &Config, progress: ProgressMode) -> Result<Self> {
        let backend = make_backend(config)?;
        let store = Arc::new(ContentStore::new(
            backend,
            config.indexing.visibility_batch_size,
        ));
        let provider: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
        let state = Arc::new(
            StateDb::connect(&config.state.path, config.embedding.frontend_workers()).await?,
        );
        state.migrate().await?;

        let cancel = CancellationToken::new();
        spawn_ctrl_c(cancel.clone());

        let pipeline = Arc::new(Pipeline::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&provider),
            Arc::clone(&state),
            cancel,
            progress,
        ));
        let reconciler = Reconciler::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&state),
            pipeline,
        );

        Ok(Self {
            store,
            provider,
            state,
            reconciler,
        })
    }
}

fn make_backend(config: &Config) -> Result<Box<dyn VectorBackend>> {
    match config.storage.backend.as_str() {
        "memory" => Ok(Box::new(MemoryBackend::new())),
        "qdrant" => Ok(Box::new(QdrantBackend::new(&config.storage)?)),
        other => anyhow::bail!("Unknown storage backend: {}", other),
    }
}

/// On Ctrl-C, workers finish the files in flight and stop taking new ones;
/// a second Ctrl-C aborts the process.
fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling — finishing in-flight files (Ctrl-C again to abort)");
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });
}

async fn run_init(config: &Config) -> Result<()> {
    let state = StateDb::connect(&config.state.path, config.embedding.frontend_workers()).await?;
    state.migrate().await?;
    println!("state db: {}", config.state.path.display());

    if let Some(dims) = config.embedding.dims {
        let backend = make_backend(config)?;
        let store = ContentStore::new(backend, config.indexing.visibility_batch_size);
        store.init(dims).await?;
        println!(
            "collection: {} ({} dims, {})",
            config.storage.collection, dims, config.storage.backend
        );
    } else {
        println!("collection: skipped (embedding disabled; set embedding.dims to create it)");
    }

    state.close().await;
    println!("ok");
    Ok(())
}

fn run_dry_run(config: &Config) -> Result<()> {
    let files = scan_tree(&config.indexing)?;
    let mut chunks = 0usize;
    for file in &files {
        if let Ok(content) = std::fs::read_to_string(&file.abs) {
            chunks += chunk_lines(
                &content,
                config.chunking.max_tokens,
                config.chunking.overlap_lines,
            )
            .len();
        }
    }
    println!("index (dry-run)");
    println!("  files found: {}", files.len());
    println!("  estimated chunks: {chunks}");
    Ok(())
}

async fn run_status(config: &Config) -> Result<()> {
    let state = StateDb::connect(&config.state.path, config.embedding.frontend_workers()).await?;
    state.migrate().await?;

    let tracked = state.tracked_branch().await?;
    let branches = state.known_branches().await?;
    let checkpoints = state.checkpoint_count().await?;

    println!("delta-index status");
    println!("  root:            {}", config.indexing.root.display());
    println!("  storage:         {}", config.storage.backend);
    println!(
        "  tracked branch:  {}",
        tracked.as_deref().unwrap_or("(none)")
    );
    let mut names: Vec<&str> = branches.iter().map(|s| s.as_str()).collect();
    names.sort_unstable();
    println!("  known branches:  {}", names.join(", "));
    println!("  checkpoints:     {checkpoints}");

    if config.storage.backend == "qdrant" {
        let backend = make_backend(config)?;
        let store = ContentStore::new(backend, config.indexing.visibility_batch_size);
        match store.point_count().await {
            Ok(count) => println!("  stored points:   {count}"),
            Err(err) => println!("  stored points:   unavailable ({err})"),
        }
    }

    state.close().await;
    Ok(())
}

fn parse_progress(value: &str) -> Result<ProgressMode> {
    Ok(match value {
        "auto" => ProgressMode::default_for_tty(),
        "off" => ProgressMode::Off,
        "human" => ProgressMode::Human,
        "json" => ProgressMode::Json,
        other => anyhow::bail!("Unknown progress mode: {}. Use auto, off, human, or json.", other),
    })
}

fn print_stats(command: &str, stats: &IndexStats) {
    println!("{command}");
    println!("  files scanned:  {}", stats.files_scanned);
    println!("  files indexed:  {}", stats.files_indexed);
    println!("  files skipped:  {}", stats.files_skipped);
    println!("  files failed:   {}", stats.files_failed);
    println!("  chunks written: {}", stats.chunks_written);
    println!("  embed calls:    {}", stats.embed_calls);
    println!("  elapsed:        {} ms", stats.time_ms);
    println!("ok");
}
