//! List command: installed packages with their resolved source
//!
//! Resolution here uses only the persisted index cache; listing must not
//! trigger expensive upstream queries.

use anyhow::Result;
use colored::Colorize;

use crate::config::Config;
use crate::index::{IndexCache, ReverseLookup, UpstreamIndex};
use crate::inventory;
use crate::pkgmgr::PackageManager;

/// Run the list command
pub fn run(filter: Option<&str>, config: &Config) -> Result<i32> {
    let pkgmgr = PackageManager::new(config);
    let installed = inventory::installed_packages(&pkgmgr)?;

    let cache = IndexCache::new(&config.index_cache_dir());
    let mut upstream = UpstreamIndex::default();
    for entry in cache.entries()? {
        upstream.sources.insert(entry.source.clone(), entry);
    }
    let lookup = ReverseLookup::build(&upstream);

    let mut shown = 0usize;
    for record in &installed {
        if let Some(f) = filter {
            if !record.signature.name.contains(f) {
                continue;
            }
        }

        let source = lookup
            .resolve(
                &record.signature,
                &record.from_repo,
                &config.sources.priority,
            )
            .map(|s| s.to_string())
            .or_else(|| {
                if record.from_repo.is_empty() {
                    None
                } else {
                    Some(record.from_repo.clone())
                }
            });

        match source {
            Some(source) => println!("{}  {}", record.signature.nevra(), source.cyan()),
            None => println!("{}  {}", record.signature.nevra(), "(unresolved)".yellow()),
        }
        shown += 1;
    }

    println!();
    println!("{} package(s)", shown);
    Ok(0)
}
