//! System inventory
//!
//! Reads the golden-copy host's installed-package list and the set of
//! enabled upstream sources from the package manager. Parsing is kept
//! separate from subprocess I/O so it can be tested against captured
//! output.

use anyhow::{Context, Result};

use crate::pkgmgr::PackageManager;
use crate::signature::Signature;

/// An installed package: its signature plus the source repository the
/// package manager says it came from (empty when undeterminable).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub signature: Signature,
    pub from_repo: String,
}

/// Query the installed-package set. Built once per run; the result is
/// treated as immutable afterwards.
pub fn installed_packages(pkgmgr: &PackageManager) -> Result<Vec<InstalledPackage>> {
    let raw = pkgmgr
        .list_installed()
        .context("querying installed packages")?;

    let mut records: Vec<InstalledPackage> = raw.lines().filter_map(parse_installed_line).collect();

    // Stable order so every downstream truncation and listing is
    // reproducible across runs.
    records.sort_by(|a, b| a.signature.cmp(&b.signature));
    records.dedup();

    tracing::info!("Inventory: {} installed packages", records.len());
    Ok(records)
}

/// Query the enabled upstream sources, minus the excluded ones.
pub fn enabled_sources(pkgmgr: &PackageManager, exclude: &[String]) -> Result<Vec<String>> {
    let raw = pkgmgr
        .list_enabled_sources()
        .context("querying enabled repositories")?;

    let mut sources: Vec<String> = parse_repolist(&raw)
        .into_iter()
        .filter(|s| !exclude.contains(s))
        .collect();
    sources.sort();
    sources.dedup();

    tracing::info!("Inventory: {} enabled sources", sources.len());
    Ok(sources)
}

/// Parse one `name|epoch|version|release|arch|from_repo` line.
/// Lines that do not carry all five signature fields are skipped.
fn parse_installed_line(line: &str) -> Option<InstalledPackage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < 5 {
        tracing::warn!("Skipping malformed inventory line: {}", line);
        return None;
    }

    let from_repo = fields
        .get(5)
        .map(|r| r.trim())
        .filter(|r| !r.is_empty() && *r != "(unknown)")
        .unwrap_or("")
        .to_string();

    Some(InstalledPackage {
        signature: Signature::new(fields[0], fields[1], fields[2], fields[3], fields[4]),
        from_repo,
    })
}

/// Parse `dnf repolist --enabled` output: one repo id per line, first
/// whitespace-separated column, ignoring the header row.
fn parse_repolist(raw: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let id = line.split_whitespace().next()?;
            if id == "repo" || id == "repolist:" {
                return None;
            }
            Some(id.to_string())
        })
        .collect()
}
