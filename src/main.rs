//! Filetrail CLI - workspace file tracking over pluggable storage

mod ui;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use filetrail::config::{self, TrackerConfig};
use filetrail::migrate::{self, MigrationOptions};
use filetrail::scan;
use filetrail::storage::{BackendKind, factory};
use filetrail::tracker::TrackerStore;
use filetrail::watcher::TrackerWatcher;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use ui::{
    Icons, MigrationBar, Spinner, error, file_deleted, header, human_bytes, section, stats_table,
    status, success, summary_row,
};

#[derive(Parser)]
#[command(name = "filetrail")]
#[command(version = "0.1.0")]
#[command(about = "Durable file-tracking metadata store with rename-stable identities")]
#[command(long_about = r#"
Filetrail keeps durable metadata for every file in a workspace, enabling:
  • Identities (UUIDs) that survive renames and moves
  • Content hashes plus structural hashes for directories
  • Pluggable storage: sharded JSON files or SQLite
  • Zero-loss migration between storage backends

Example usage:
  filetrail init
  filetrail scan
  filetrail watch
  filetrail migrate --to relational
"#)]
struct Cli {
    /// Workspace root (defaults to the configured root, then the cwd)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Config file location
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and ignore rules for this workspace
    Init {
        /// Overwrite an existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Walk the workspace and bring the store up to date
    Scan,

    /// Scan, then keep tracking filesystem changes until interrupted
    Watch,

    /// Show backend and tracking statistics
    Stats,

    /// Probe the storage backend for structural problems
    Health,

    /// Compact the storage backend
    Optimize,

    /// Move all data to a different storage backend
    Migrate {
        /// Target backend
        #[arg(short, long)]
        to: BackendKind,

        /// Skip the post-migration validation pass
        #[arg(long)]
        skip_validation: bool,

        /// Report source cleanup steps after a successful migration
        #[arg(long)]
        cleanup_source: bool,
    },

    /// Diff the configured backend against its counterpart
    Compare,

    /// Drop records whose files no longer exist on disk
    Prune,
}

/// Resolve the workspace root and config for one command invocation.
/// Precedence for the root: `--root`, then the config's workspaceRoot,
/// then the current directory.
fn resolve_context(
    root_flag: Option<&Path>,
    config_flag: Option<&Path>,
) -> anyhow::Result<(PathBuf, PathBuf, TrackerConfig)> {
    let config_path = config_flag
        .map(Path::to_path_buf)
        .unwrap_or_else(config::default_config_path);
    let config = config::load_config(Some(&config_path))?.unwrap_or_default();

    let root = if let Some(root) = root_flag {
        root.to_path_buf()
    } else if let Some(ws) = &config.workspace_root {
        PathBuf::from(ws)
    } else {
        std::env::current_dir()?
    };
    let root = root.canonicalize().unwrap_or(root);
    Ok((root, config_path, config))
}

/// Build the configured backend and an initialized store on top of it.
async fn open_store(root: &Path, config: &TrackerConfig) -> anyhow::Result<Arc<TrackerStore>> {
    let backend = factory::create_backend(config, root);
    let store = Arc::new(TrackerStore::new(root.to_path_buf(), backend));
    let preload = match config.backend {
        BackendKind::ShardedJson => !config.sharded.lazy_load,
        BackendKind::Relational => false,
    };
    store.initialize(preload).await?;
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The config's debug flag raises verbosity too; a broken config
    // surfaces once the command actually loads it.
    let debug_configured = config::load_config(cli.config.as_deref())
        .ok()
        .flatten()
        .is_some_and(|c| c.debug);
    let filter = if cli.verbose || debug_configured {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Init { force } => {
            let config_path = cli
                .config
                .clone()
                .unwrap_or_else(config::default_config_path);
            let root = match cli.root.clone() {
                Some(root) => root,
                None => std::env::current_dir()?,
            };

            let mut config = TrackerConfig::default();
            if cli.root.is_some() {
                config.workspace_root = Some(root.display().to_string());
            }
            config::write_config(&config_path, &config, force)?;
            config::ensure_gitignore(&root)?;

            header("Initialized filetrail");
            status(Icons::DATABASE, "Backend", config.backend.as_str());
            status(Icons::GEAR, "Config", &config_path.display().to_string());
            success("Ready. Run `filetrail scan` to build the index.");
        }

        Commands::Scan => {
            let (root, _, config) = resolve_context(cli.root.as_deref(), cli.config.as_deref())?;
            header(&format!("Scanning {}", root.display()));
            let store = open_store(&root, &config).await?;

            let spinner = Spinner::new("Walking the tree...");
            let summary = scan::run_scan(&store, &root).await?;
            spinner.finish_with_message("Scan complete");

            let counters = store.counters().await;
            let rows = vec![
                ("Tracked".to_string(), summary.tracked.to_string()),
                ("Added".to_string(), counters.records_added.to_string()),
                ("Updated".to_string(), counters.records_updated.to_string()),
                ("Unchanged".to_string(), counters.unchanged_skips.to_string()),
                ("Walk errors".to_string(), summary.skipped.to_string()),
                ("Failures".to_string(), summary.failed.to_string()),
                ("Elapsed".to_string(), format!("{:.2?}", summary.elapsed)),
            ];
            println!("{}", stats_table(&rows));

            store.close().await?;
            success(&format!("{} entries tracked", summary.tracked));
        }

        Commands::Watch => {
            let (root, _, config) = resolve_context(cli.root.as_deref(), cli.config.as_deref())?;
            header(&format!("Watching {}", root.display()));
            let store = open_store(&root, &config).await?;

            let summary = scan::run_scan(&store, &root).await?;
            status(
                Icons::FILE,
                "Initial scan",
                &format!("{} entries", summary.tracked),
            );

            let watcher = TrackerWatcher::new(root.clone(), Arc::clone(&store));
            println!("{} Press Ctrl-C to stop.", Icons::EYE);
            tokio::select! {
                res = watcher.run() => res?,
                _ = tokio::signal::ctrl_c() => {}
            }

            store.close().await?;
            success("Watcher stopped");
        }

        Commands::Stats => {
            let (root, _, config) = resolve_context(cli.root.as_deref(), cli.config.as_deref())?;
            let store = open_store(&root, &config).await?;

            let backend_stats = store.backend().stats().await?;
            let summary = store.summary().await?;

            let rows = vec![
                ("Backend".to_string(), config.backend.to_string()),
                ("Records".to_string(), backend_stats.record_count.to_string()),
                (
                    "Path mappings".to_string(),
                    backend_stats.mapping_count.to_string(),
                ),
                (
                    "On disk".to_string(),
                    backend_stats
                        .byte_size
                        .map_or_else(|| "-".to_string(), human_bytes),
                ),
                (
                    "Tracked entries".to_string(),
                    summary.total_entries.to_string(),
                ),
                ("Files".to_string(), summary.file_count.to_string()),
                (
                    "Directories".to_string(),
                    summary.directory_count.to_string(),
                ),
                ("Content bytes".to_string(), human_bytes(summary.total_bytes)),
            ];
            println!("{}", stats_table(&rows));

            if !summary.by_extension.is_empty() {
                section("By extension");
                let mut extensions: Vec<(&String, &usize)> = summary.by_extension.iter().collect();
                extensions.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
                for (ext, count) in extensions.into_iter().take(10) {
                    summary_row(ext, &count.to_string());
                }
            }

            store.close().await?;
        }

        Commands::Health => {
            let (root, _, config) = resolve_context(cli.root.as_deref(), cli.config.as_deref())?;
            let backend = factory::create_backend(&config, &root);
            backend.initialize().await?;
            let report = backend.check_health().await?;
            backend.close().await?;

            if report.healthy {
                success(&format!("{} backend healthy", config.backend));
            } else {
                for issue in &report.issues {
                    error(issue);
                }
                std::process::exit(1);
            }
        }

        Commands::Optimize => {
            let (root, _, config) = resolve_context(cli.root.as_deref(), cli.config.as_deref())?;
            let backend = factory::create_backend(&config, &root);
            backend.initialize().await?;

            let spinner = Spinner::new("Optimizing backend...");
            backend.optimize().await?;
            spinner.finish_with_message("Optimize complete");

            let stats = backend.stats().await?;
            status(Icons::GEAR, "Records", &stats.record_count.to_string());
            backend.close().await?;
            success(&format!("{} backend optimized", config.backend));
        }

        Commands::Migrate {
            to,
            skip_validation,
            cleanup_source,
        } => {
            let (root, config_path, config) =
                resolve_context(cli.root.as_deref(), cli.config.as_deref())?;
            if to == config.backend {
                anyhow::bail!("already on the {to} backend; nothing to migrate");
            }
            header(&format!("Migrating {} -> {}", config.backend, to));

            let source = factory::create_backend(&config, &root);
            let target = factory::create_backend_of(to, &config, &root);
            source.initialize().await?;
            target.initialize().await?;

            let options = MigrationOptions {
                validate_after: !skip_validation,
                cleanup_source,
            };
            let bar = MigrationBar::new();
            let report = migrate::migrate(source.as_ref(), target.as_ref(), &options, |p| {
                bar.update(&p)
            })
            .await;
            bar.finish();

            source.close().await?;
            target.close().await?;

            print!("{report}");
            for err in &report.errors {
                error(err);
            }
            if report.success {
                success(&format!(
                    "Set backend = \"{to}\" in {} to switch over",
                    config_path.display()
                ));
            } else {
                std::process::exit(1);
            }
        }

        Commands::Compare => {
            let (root, _, config) = resolve_context(cli.root.as_deref(), cli.config.as_deref())?;
            let a = factory::create_backend(&config, &root);
            let b = factory::create_backend_of(config.backend.other(), &config, &root);
            a.initialize().await?;
            b.initialize().await?;

            let diff = migrate::compare_backends(a.as_ref(), b.as_ref()).await?;
            a.close().await?;
            b.close().await?;

            println!("{diff}");
            if diff.is_empty() {
                success("Backends match");
            } else {
                std::process::exit(1);
            }
        }

        Commands::Prune => {
            let (root, _, config) = resolve_context(cli.root.as_deref(), cli.config.as_deref())?;
            let store = open_store(&root, &config).await?;

            let removed = store.cleanup_missing().await?;
            for key in &removed {
                file_deleted(key);
            }

            store.close().await?;
            success(&format!("Pruned {} entries", removed.len()));
        }
    }

    Ok(())
}
