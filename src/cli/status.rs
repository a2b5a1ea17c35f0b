//! Status command: the sync plan without the sync

use anyhow::Result;
use colored::Colorize;

use crate::config::Config;
use crate::engine::EngineOutcome;
use crate::report::SyncReport;

/// Run the status command
pub fn run(filter: Option<String>, repo: Option<String>, config: &Config) -> Result<i32> {
    let gathered = super::sync::gather(config, false, filter, repo, None, None)?;

    println!();
    println!("{}", "Planned actions:".cyan());
    for (repo_name, candidates) in &gathered.classification.removals {
        println!(
            "  {} {}: {} removal candidate(s)",
            "-".yellow(),
            repo_name.bold(),
            candidates.len()
        );
    }
    if gathered.classification.removals.is_empty() {
        println!("  no removals pending");
    }

    // Reuse the report rendering with an empty outcome: the classification
    // columns are the plan, removed/failed stay zero.
    let mut report = SyncReport::build(&gathered.classification, &EngineOutcome::default());
    report.index_failures = gathered.index_failures;
    report.print();

    Ok(0)
}
