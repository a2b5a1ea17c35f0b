//! Sync command implementation
//!
//! The full pipeline: inventory, upstream index refresh, classification,
//! batched download/removal, metadata regeneration, distribution sync,
//! report.

use anyhow::{bail, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::classify::{classify, Classification, ClassifyOptions};
use crate::config::Config;
use crate::engine::{CancelToken, Engine, EngineOptions};
use crate::index::{parse_available, IndexCache, ReverseLookup, UpstreamIndex};
use crate::inventory;
use crate::metadata::MetadataGenerator;
use crate::mirror::MirrorState;
use crate::pkgmgr::PackageManager;
use crate::publish::Publisher;
use crate::report::SyncReport;

/// Per-invocation flags for the sync pipeline.
pub struct SyncFlags {
    pub dry_run: bool,
    pub force_redownload: bool,
    pub full_rebuild: bool,
    pub no_metadata_update: bool,
    pub no_cleanup: bool,
    pub no_publish: bool,
    pub filter: Option<String>,
    pub repo: Option<String>,
    pub max_packages: Option<usize>,
    pub max_changed: Option<usize>,
    pub json: bool,
}

/// Everything the classification phase produces, shared with `status`.
pub(super) struct Gathered {
    pub classification: Classification,
    pub mirror: MirrorState,
    pub index_failures: Vec<(String, String)>,
}

/// Inventory, index refresh, mirror scan, classification. Read-only with
/// respect to the mirror tree; the index cache may be refreshed.
pub(super) fn gather(
    config: &Config,
    full_rebuild: bool,
    filter: Option<String>,
    repo: Option<String>,
    max_packages: Option<usize>,
    max_changed: Option<usize>,
) -> Result<Gathered> {
    config.validate()?;

    let pkgmgr = PackageManager::new(config);

    println!("{}", "Reading golden-copy inventory...".cyan());
    let installed = inventory::installed_packages(&pkgmgr)
        .map_err(|e| crate::error::MirrorError::Inventory(format!("{e:#}")))?;
    let sources = inventory::enabled_sources(&pkgmgr, &config.sources.exclude)
        .map_err(|e| crate::error::MirrorError::Inventory(format!("{e:#}")))?;
    if sources.is_empty() {
        bail!(crate::error::MirrorError::NoSources);
    }
    println!(
        "  {} installed packages, {} enabled sources",
        installed.len(),
        sources.len()
    );

    println!("{}", "Refreshing upstream package indexes...".cyan());
    let cache = IndexCache::new(&config.index_cache_dir());
    let upstream = UpstreamIndex::refresh_all(
        &cache,
        &sources,
        config.tuning.freshness_secs,
        full_rebuild,
        config.tuning.parallelism,
        |source| pkgmgr.list_available(source).map(|raw| parse_available(&raw)),
    )?;

    for (source, reason) in &upstream.failures {
        println!("  {} {} - {}", "!".yellow(), source.bold(), reason);
    }
    println!(
        "  {} signatures across {} sources",
        upstream.total_signatures(),
        upstream.sources.len()
    );

    let lookup = ReverseLookup::build(&upstream);
    tracing::debug!("Reverse lookup covers {} signatures", lookup.len());

    let mirror = MirrorState::scan(&config.paths.mirror_root)?;
    println!(
        "  {} packages currently mirrored across {} repos",
        mirror.total_packages(),
        mirror.repo_names().len()
    );

    let opts = ClassifyOptions {
        name_filter: filter,
        repo_filter: repo,
        max_packages,
        max_changed,
        local_only: config.sources.local_only.clone(),
        enabled_sources: sources,
        priority: config.sources.priority.clone(),
    };

    println!("{}", "Classifying packages...".cyan());
    let classification = classify(&installed, &lookup, &mirror, &opts);

    for (repo_name, plan) in &classification.repos {
        println!(
            "  {} {}: {} new, {} update, {} exists",
            "✓".green(),
            repo_name.bold(),
            plan.new.len(),
            plan.update.len(),
            plan.exists.len()
        );
    }

    Ok(Gathered {
        classification,
        mirror,
        index_failures: upstream.failures,
    })
}

/// Run the sync command
pub fn run(flags: SyncFlags, config: &Config) -> Result<i32> {
    if flags.dry_run {
        println!("{}", "Dry run mode - no changes will be made".yellow());
        println!();
    }

    let mut gathered = gather(
        config,
        flags.full_rebuild,
        flags.filter,
        flags.repo,
        flags.max_packages,
        flags.max_changed,
    )?;

    let pkgmgr = PackageManager::new(config);
    let mut engine_opts = EngineOptions::from_config(config);
    engine_opts.force_redownload = flags.force_redownload;
    engine_opts.dry_run = flags.dry_run;
    engine_opts.skip_cleanup = flags.no_cleanup;

    let mut to_fetch = gathered.classification.total_to_fetch();
    if flags.force_redownload {
        to_fetch += gathered
            .classification
            .repos
            .values()
            .map(|p| p.exists.len())
            .sum::<usize>();
    }
    println!();
    println!(
        "{}",
        format!(
            "Fetching {} package(s), removing {}...",
            to_fetch,
            gathered.classification.total_removals()
        )
        .cyan()
    );

    let progress = if to_fetch > 0 && !flags.dry_run {
        let pb = ProgressBar::new(to_fetch as u64);
        pb.set_style(
            ProgressStyle::with_template("  [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Some(pb)
    } else {
        None
    };

    let engine = Engine::new(&pkgmgr, engine_opts, CancelToken::new());
    let outcome = engine.run(&mut gathered.mirror, &gathered.classification, progress.as_ref())?;

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    tracing::info!(
        "Engine finished: {} downloaded, {} removed, {} failed",
        outcome.total_downloaded(),
        outcome.total_removed(),
        outcome.failures.len()
    );

    // Metadata regeneration, changed repositories only
    let regen_failures = if flags.dry_run {
        Vec::new()
    } else {
        let generator = MetadataGenerator::new(config);
        let repos = MetadataGenerator::repos_to_update(
            &outcome.changed_repos,
            &gathered.mirror.repo_names(),
            flags.full_rebuild,
            flags.no_metadata_update,
        );
        if !repos.is_empty() {
            println!("{}", format!("Regenerating metadata for {} repo(s)...", repos.len()).cyan());
        }
        generator.run_for(&gathered.mirror, &repos)
    };

    // Distribution sync
    if !flags.dry_run && !flags.no_publish {
        if let Some(ref share_dir) = config.paths.share_dir {
            let publisher = Publisher::new(config);
            match publisher.publish(gathered.mirror.root(), share_dir) {
                Ok(()) => println!("{} Published to {}", "✓".green(), share_dir.display()),
                Err(e) => println!("{} Publish failed: {}", "✗".red(), e),
            }
        }
    }

    let mut report = SyncReport::build(&gathered.classification, &outcome);
    report.index_failures = gathered.index_failures;
    report.regen_failures = regen_failures;
    report.print();

    if flags.json {
        println!("{}", report.to_json()?);
    }

    Ok(report.exit_code())
}
