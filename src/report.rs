//! Run reporting
//!
//! Aggregates classification and engine results into a fixed-width
//! per-repository table plus a machine-readable JSON summary. Unknown
//! packages and download failures are always enumerated; long listings
//! are capped for display with an explicit "and N more" line, but the
//! counts stay exact.

use std::collections::BTreeMap;

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

use crate::classify::Classification;
use crate::engine::EngineOutcome;

/// Listings longer than this are truncated on screen (never in counts).
const DISPLAY_CAP: usize = 20;

#[derive(Debug, Default, Clone, Serialize)]
pub struct RepoSummary {
    pub repository: String,
    pub new: usize,
    pub update: usize,
    pub exists: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct Totals {
    pub new: usize,
    pub update: usize,
    pub exists: usize,
    pub removed: usize,
    pub failed: usize,
    pub unknown: usize,
    pub deferred: usize,
}

/// Machine-readable run summary: counts only, no package-level detail.
#[derive(Debug, Serialize)]
pub struct Summary {
    pub repositories: Vec<RepoSummary>,
    pub totals: Totals,
    pub cancelled: bool,
}

/// Full report for one run.
#[derive(Debug)]
pub struct SyncReport {
    pub summary: Summary,
    /// (nevra, reason) for every unresolvable package
    pub unknown: Vec<(String, String)>,
    /// (repo, nevra, reason) for every terminal download failure
    pub failures: Vec<(String, String, String)>,
    /// (source, reason) for soft upstream-query failures
    pub index_failures: Vec<(String, String)>,
    /// (repo, reason) for metadata regeneration failures
    pub regen_failures: Vec<(String, String)>,
}

impl SyncReport {
    pub fn build(classification: &Classification, outcome: &EngineOutcome) -> Self {
        let mut repos: BTreeMap<String, RepoSummary> = BTreeMap::new();

        for (repo, plan) in &classification.repos {
            let summary = repos.entry(repo.clone()).or_insert_with(|| RepoSummary {
                repository: repo.clone(),
                ..Default::default()
            });
            summary.new = plan.new.len();
            summary.update = plan.update.len();
            summary.exists = plan.exists.len();
        }

        for (repo, count) in &outcome.removed {
            let summary = repos.entry(repo.clone()).or_insert_with(|| RepoSummary {
                repository: repo.clone(),
                ..Default::default()
            });
            summary.removed = *count;
        }

        for failure in &outcome.failures {
            let summary = repos
                .entry(failure.repo.clone())
                .or_insert_with(|| RepoSummary {
                    repository: failure.repo.clone(),
                    ..Default::default()
                });
            summary.failed += 1;
        }

        let repositories: Vec<RepoSummary> = repos.into_values().collect();
        let totals = Totals {
            new: repositories.iter().map(|r| r.new).sum(),
            update: repositories.iter().map(|r| r.update).sum(),
            exists: repositories.iter().map(|r| r.exists).sum(),
            removed: repositories.iter().map(|r| r.removed).sum(),
            failed: repositories.iter().map(|r| r.failed).sum(),
            unknown: classification.unknown.len(),
            deferred: classification.deferred.len(),
        };

        let unknown = classification
            .unknown
            .iter()
            .map(|(rec, reason)| (rec.signature.nevra(), reason.clone()))
            .collect();

        let failures = outcome
            .failures
            .iter()
            .map(|f| (f.repo.clone(), f.signature.nevra(), f.reason.clone()))
            .collect();

        Self {
            summary: Summary {
                repositories,
                totals,
                cancelled: outcome.cancelled,
            },
            unknown,
            failures,
            index_failures: Vec::new(),
            regen_failures: Vec::new(),
        }
    }

    /// The fixed-width summary table.
    pub fn render_table(&self) -> String {
        let name_width = self
            .summary
            .repositories
            .iter()
            .map(|r| r.repository.len())
            .chain(std::iter::once("Repository".len()))
            .chain(std::iter::once("TOTAL".len()))
            .max()
            .unwrap_or(10);

        let mut out = String::new();
        out.push_str(&format!(
            "{:<name_width$}  {:>6}  {:>6}  {:>6}  {:>7}  {:>6}\n",
            "Repository", "New", "Update", "Exists", "Removed", "Failed"
        ));
        out.push_str(&"-".repeat(name_width + 2 + 6 + 2 + 6 + 2 + 6 + 2 + 7 + 2 + 6));
        out.push('\n');

        for repo in &self.summary.repositories {
            out.push_str(&format!(
                "{:<name_width$}  {:>6}  {:>6}  {:>6}  {:>7}  {:>6}\n",
                repo.repository, repo.new, repo.update, repo.exists, repo.removed, repo.failed
            ));
        }

        let t = &self.summary.totals;
        out.push_str(&format!(
            "{:<name_width$}  {:>6}  {:>6}  {:>6}  {:>7}  {:>6}\n",
            "TOTAL", t.new, t.update, t.exists, t.removed, t.failed
        ));

        out
    }

    /// Print the human-readable report.
    pub fn print(&self) {
        println!();
        print!("{}", self.render_table());
        println!();

        print_capped(
            "Upstream query failures",
            &self
                .index_failures
                .iter()
                .map(|(source, reason)| format!("{} - {}", source.bold(), reason))
                .collect::<Vec<_>>(),
            "!",
        );

        print_capped(
            "Unknown packages",
            &self
                .unknown
                .iter()
                .map(|(nevra, reason)| format!("{} - {}", nevra.bold(), reason))
                .collect::<Vec<_>>(),
            "?",
        );

        print_capped(
            "Failed downloads",
            &self
                .failures
                .iter()
                .map(|(repo, nevra, reason)| {
                    format!("{} {} {} - {}", nevra.bold(), "from".dimmed(), repo, reason)
                })
                .collect::<Vec<_>>(),
            "✗",
        );

        print_capped(
            "Metadata regeneration failures",
            &self
                .regen_failures
                .iter()
                .map(|(repo, reason)| format!("{} - {}", repo.bold(), reason))
                .collect::<Vec<_>>(),
            "✗",
        );

        if self.summary.cancelled {
            println!("{} {}", "!".yellow().bold(), "Run was cancelled; results are partial".yellow());
            println!();
        }

        if self.summary.totals.deferred > 0 {
            println!(
                "  {} package(s) deferred past the max-changed limit",
                self.summary.totals.deferred
            );
            println!();
        }

        if self.failures.is_empty() && self.unknown.is_empty() {
            println!(
                "{} {} new, {} updated, {} already mirrored, {} removed",
                "✓".green().bold(),
                self.summary.totals.new,
                self.summary.totals.update,
                self.summary.totals.exists,
                self.summary.totals.removed
            );
        } else {
            println!(
                "{} completed with {} failed download(s), {} unknown package(s)",
                "!".yellow().bold(),
                self.summary.totals.failed,
                self.summary.totals.unknown
            );
        }
    }

    /// Machine-readable summary (counts only).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.summary)?)
    }

    /// 0 for a clean run, 2 when per-package failures occurred. Terminal
    /// aborts exit 1 before a report exists.
    pub fn exit_code(&self) -> i32 {
        if self.failures.is_empty() {
            0
        } else {
            2
        }
    }
}

fn print_capped(heading: &str, lines: &[String], glyph: &str) {
    if lines.is_empty() {
        return;
    }

    println!("{} ({}):", heading.bold(), lines.len());
    for line in lines.iter().take(DISPLAY_CAP) {
        println!("  {} {}", glyph.red(), line);
    }
    if lines.len() > DISPLAY_CAP {
        println!("  … and {} more", lines.len() - DISPLAY_CAP);
    }
    println!();
}
