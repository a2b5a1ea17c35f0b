//! Command-line interface for rpmirror

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

mod cache;
mod list;
mod status;
mod sync;

#[derive(Subcommand)]
pub enum Commands {
    /// Reconcile the mirror against the golden copy and synchronize it
    Sync {
        /// Log intended actions without touching the filesystem
        #[arg(long)]
        dry_run: bool,

        /// Re-download packages that are already mirrored
        #[arg(long)]
        force_redownload: bool,

        /// Ignore cache freshness and regenerate metadata for every repo
        #[arg(long)]
        full_rebuild: bool,

        /// Skip metadata regeneration
        #[arg(long)]
        no_metadata_update: bool,

        /// Skip removal of packages no longer installed
        #[arg(long)]
        no_cleanup: bool,

        /// Skip the final sync to the shared distribution path
        #[arg(long)]
        no_publish: bool,

        /// Only consider packages whose name contains this string
        #[arg(short, long)]
        filter: Option<String>,

        /// Only consider packages resolving to this repository
        #[arg(long)]
        repo: Option<String>,

        /// Cap the number of packages considered
        #[arg(long)]
        max_packages: Option<usize>,

        /// Cap the number of downloads this run
        #[arg(long)]
        max_changed: Option<usize>,

        /// Print the machine-readable summary after the report
        #[arg(long)]
        json: bool,
    },

    /// Show what a sync would do, without doing any of it
    Status {
        /// Only consider packages whose name contains this string
        #[arg(short, long)]
        filter: Option<String>,

        /// Only consider packages resolving to this repository
        #[arg(long)]
        repo: Option<String>,
    },

    /// List installed packages with their resolved source
    List {
        /// Only list packages whose name contains this string
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Inspect or manage the persisted upstream index cache
    #[command(subcommand)]
    Cache(CacheCommands),
}

/// Cache management subcommands
#[derive(Subcommand)]
pub enum CacheCommands {
    /// Show cached index entries and their age
    Show,

    /// Force-refresh index entries, ignoring freshness
    Refresh {
        /// Refresh only this source (default: all enabled sources)
        source: Option<String>,
    },

    /// Drop cached index entries
    Clear {
        /// Clear only this source (default: all entries)
        source: Option<String>,
    },
}

/// Execute a CLI command, returning the process exit code.
pub fn execute(command: Commands, config: &Config) -> Result<i32> {
    match command {
        Commands::Sync {
            dry_run,
            force_redownload,
            full_rebuild,
            no_metadata_update,
            no_cleanup,
            no_publish,
            filter,
            repo,
            max_packages,
            max_changed,
            json,
        } => sync::run(
            sync::SyncFlags {
                dry_run,
                force_redownload,
                full_rebuild,
                no_metadata_update,
                no_cleanup,
                no_publish,
                filter,
                repo,
                max_packages,
                max_changed,
                json,
            },
            config,
        ),
        Commands::Status { filter, repo } => status::run(filter, repo, config),
        Commands::List { filter } => list::run(filter.as_deref(), config),
        Commands::Cache(subcmd) => match subcmd {
            CacheCommands::Show => cache::show(config),
            CacheCommands::Refresh { source } => cache::refresh(source.as_deref(), config),
            CacheCommands::Clear { source } => cache::clear(source.as_deref(), config),
        },
    }
}
