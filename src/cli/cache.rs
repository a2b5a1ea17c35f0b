//! Cache management commands

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;

use crate::config::Config;
use crate::index::{parse_available, IndexCache, UpstreamIndex};
use crate::inventory;
use crate::pkgmgr::PackageManager;

/// Show persisted index entries with their age and freshness.
pub fn show(config: &Config) -> Result<i32> {
    let cache = IndexCache::new(&config.index_cache_dir());
    let entries = cache.entries()?;

    if entries.is_empty() {
        println!("{}", "No cached index entries.".yellow());
        return Ok(0);
    }

    println!("{}", "Cached upstream indexes:".cyan());
    for entry in &entries {
        let age = Utc::now() - entry.refreshed;
        let age_str = format!("{}h{:02}m", age.num_hours(), age.num_minutes() % 60);
        let freshness = if entry.is_fresh(config.tuning.freshness_secs) {
            "fresh".green()
        } else {
            "stale".yellow()
        };
        println!(
            "  {} {:<24} {:>8} signatures  refreshed {} ago ({})",
            "✓".green(),
            entry.source.bold(),
            entry.signatures.len(),
            age_str,
            freshness
        );
    }

    Ok(0)
}

/// Force-refresh index entries, ignoring the freshness window.
pub fn refresh(source: Option<&str>, config: &Config) -> Result<i32> {
    let pkgmgr = PackageManager::new(config);
    let sources = match source {
        Some(s) => vec![s.to_string()],
        None => inventory::enabled_sources(&pkgmgr, &config.sources.exclude)?,
    };

    println!(
        "{}",
        format!("Refreshing {} index entr(ies)...", sources.len()).cyan()
    );

    let cache = IndexCache::new(&config.index_cache_dir());
    let upstream = UpstreamIndex::refresh_all(
        &cache,
        &sources,
        config.tuning.freshness_secs,
        true,
        config.tuning.parallelism,
        |src| pkgmgr.list_available(src).map(|raw| parse_available(&raw)),
    )?;

    for (name, entry) in &upstream.sources {
        println!(
            "  {} {} ({} signatures)",
            "✓".green(),
            name.bold(),
            entry.signatures.len()
        );
    }
    for (name, reason) in &upstream.failures {
        println!("  {} {} - {}", "✗".red(), name.bold(), reason);
    }

    Ok(if upstream.failures.is_empty() { 0 } else { 2 })
}

/// Drop persisted index entries.
pub fn clear(source: Option<&str>, config: &Config) -> Result<i32> {
    let cache = IndexCache::new(&config.index_cache_dir());

    match source {
        Some(source) => {
            if cache.clear(source)? {
                println!("{} Cleared index for {}", "✓".green(), source.bold());
            } else {
                println!("{} No cached index for {}", "!".yellow(), source.bold());
            }
        }
        None => {
            let entries = cache.entries()?;
            for entry in &entries {
                cache.clear(&entry.source)?;
            }
            println!("{} Cleared {} index entr(ies)", "✓".green(), entries.len());
        }
    }

    Ok(0)
}
