//! # drive-index CLI (`dix`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dix index` | Crawl, extract, embed and replace the index |
//! | `dix search "<query>" --as <principal>` | Permission-filtered hybrid search |
//! | `dix counts "<query>" --as <principal>` | Hit counts by app and entity |
//! | `dix export-text` | Full text of every Google Docs document as JSON |
//! | `dix cache status` | List snapshots and whether they are valid |
//! | `dix cache clear [stage]` | Delete one or all snapshots |
//!
//! Failures print `error [stage]: message` to stderr and exit non-zero.

use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use drive_index::cache::{CacheStage, SnapshotCache};
use drive_index::config::{self, Config};
use drive_index::db;
use drive_index::drive::DriveClient;
use drive_index::embedding;
use drive_index::error::{PipelineError, PipelineResult, Stage};
use drive_index::logging::init_logging;
use drive_index::pipeline;
use drive_index::progress::{ProgressEvent, ProgressMode, ProgressReporter};
use drive_index::search::{self, QueryScope};
use drive_index::sqlite_store::SqliteStore;
use drive_index_core::models::Entity;

/// drive-index: permission-aware indexing and hybrid search over Google Drive.
#[derive(Parser)]
#[command(name = "dix", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dix.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a TTY, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    /// Debug-level logging (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the source and replace the index, resuming from cached stages.
    Index {
        /// Discard every snapshot and start from the crawl.
        #[arg(long)]
        fresh: bool,
    },

    /// Hybrid search as a set of principals.
    Search {
        query: String,

        /// Principal to search as (user or group email, or `domain`).
        /// Repeatable.
        #[arg(long = "as", value_name = "PRINCIPAL")]
        principals: Vec<String>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Restrict to one app. Only applied together with `--entity`.
        #[arg(long)]
        app: Option<String>,

        /// Restrict to one entity. Only applied together with `--app`.
        #[arg(long, value_parser = parse_entity)]
        entity: Option<Entity>,

        #[arg(long)]
        json: bool,
    },

    /// Count hits by app and entity.
    Counts {
        query: String,

        #[arg(long = "as", value_name = "PRINCIPAL")]
        principals: Vec<String>,

        #[arg(long)]
        app: Option<String>,

        #[arg(long, value_parser = parse_entity)]
        entity: Option<Entity>,

        #[arg(long)]
        json: bool,
    },

    /// Print the full text of every Google Docs document as JSON.
    ExportText,

    /// Inspect or clear the snapshot cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List snapshots with size, creation time and validity.
    Status,
    /// Delete one snapshot (`extracted`, `embedded`, `full-text`) or all.
    Clear { stage: Option<String> },
}

fn parse_entity(s: &str) -> Result<Entity, String> {
    s.parse::<Entity>().map_err(|e| e.to_string())
}

/// Forwards progress and remembers which stage is running, so an
/// interrupt can be attributed.
struct StageTracker {
    inner: Box<dyn ProgressReporter>,
    current: Mutex<Stage>,
}

impl StageTracker {
    fn current(&self) -> Stage {
        self.current.lock().map(|s| *s).unwrap_or(Stage::Crawl)
    }
}

impl ProgressReporter for StageTracker {
    fn report(&self, event: ProgressEvent) {
        let stage = match &event {
            ProgressEvent::Crawl { .. } => Stage::Crawl,
            ProgressEvent::Extract { .. } => Stage::Extract,
            ProgressEvent::Embed { .. } => Stage::Embed,
            ProgressEvent::Write { .. } => Stage::Write,
            ProgressEvent::CacheHit { .. } => Stage::Cache,
        };
        if let Ok(mut current) = self.current.lock() {
            *current = stage;
        }
        self.inner.report(event);
    }
}

fn load(path: &Path) -> PipelineResult<Config> {
    config::load_config(path).map_err(|e| PipelineError::Config(format!("{:#}", e)))
}

async fn run(cli: Cli, progress: &StageTracker) -> PipelineResult<()> {
    let cfg = load(&cli.config)?;
    let cache = SnapshotCache::new(&cfg.cache.dir);

    match cli.command {
        Commands::Index { fresh } => {
            if !cfg.embedding.is_enabled() {
                return Err(PipelineError::Config(
                    "dix index requires an embedding provider; set [embedding] provider".into(),
                ));
            }
            let source = DriveClient::new(&cfg.source)
                .map_err(|e| PipelineError::Config(format!("{:#}", e)))?;
            let provider = embedding::create_provider(&cfg.embedding)
                .map_err(|e| PipelineError::Config(format!("{:#}", e)))?;
            let pool = db::connect(&cfg.index.db_path)
                .await
                .map_err(|e| PipelineError::backend(Stage::Write, e))?;
            let store = Arc::new(
                SqliteStore::new(pool).with_lock_file(db::lock_path(&cfg.index.db_path)),
            );

            let summary = pipeline::run_index(
                &cfg,
                Arc::new(source),
                provider,
                store,
                &cache,
                progress,
                fresh,
            )
            .await?;
            println!("index");
            println!("  records written: {}", summary.records_written);
            println!("  model: {} ({} dims)", summary.model, summary.dims);
            println!("ok");
        }
        Commands::Search {
            query,
            principals,
            limit,
            offset,
            app,
            entity,
            json,
        } => {
            let scope = QueryScope {
                principals,
                app,
                entity,
            };
            search::run_search(&cfg, &query, &scope, limit, offset, json).await?;
        }
        Commands::Counts {
            query,
            principals,
            app,
            entity,
            json,
        } => {
            let scope = QueryScope {
                principals,
                app,
                entity,
            };
            search::run_counts(&cfg, &query, &scope, json).await?;
        }
        Commands::ExportText => {
            let source = DriveClient::new(&cfg.source)
                .map_err(|e| PipelineError::Config(format!("{:#}", e)))?;
            let texts = pipeline::run_export_text(&cfg, Arc::new(source), &cache, progress).await?;
            let out = serde_json::to_string_pretty(&texts)
                .map_err(|e| PipelineError::backend(Stage::Cache, e))?;
            println!("{}", out);
        }
        Commands::Cache { action } => match action {
            CacheAction::Status => {
                let entries = cache.status()?;
                if entries.is_empty() {
                    println!("No snapshots in {}.", cache.dir().display());
                }
                for entry in entries {
                    let created = entry
                        .created_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let state = entry.problem.as_deref().unwrap_or("ok");
                    println!(
                        "{:<10} {:>10} bytes  {}  {}",
                        entry.stage, entry.bytes, created, state
                    );
                }
            }
            CacheAction::Clear { stage } => {
                let stage = stage
                    .map(|s| s.parse::<CacheStage>())
                    .transpose()
                    .map_err(|e| PipelineError::Config(format!("{:#}", e)))?;
                let removed = cache.clear(stage)?;
                for path in &removed {
                    println!("removed {}", path.display());
                }
                println!("cleared {} file(s)", removed.len());
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mode = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let initial = match cli.command {
        Commands::Index { .. } | Commands::ExportText => Stage::Crawl,
        Commands::Search { .. } | Commands::Counts { .. } => Stage::Query,
        Commands::Cache { .. } => Stage::Cache,
    };
    let tracker = StageTracker {
        inner: mode.reporter(),
        current: Mutex::new(initial),
    };

    let result = tokio::select! {
        r = run(cli, &tracker) => r,
        _ = tokio::signal::ctrl_c() => Err(PipelineError::Interrupted { stage: tracker.current() }),
    };

    if let Err(e) = result {
        eprintln!("error [{}]: {}", e.stage(), e);
        std::process::exit(e.exit_code());
    }
}
