//! Batch download and removal engine
//!
//! Executes a classification: packages needing a fetch are grouped into
//! bounded batches and downloaded on a bounded worker pool with per-package
//! retry; packages no longer installed are bulk-deleted afterwards. Workers
//! only return values — failure records, the changed-repository set, and
//! mirror-state mutations are all accumulated on the coordinating thread
//! between batches, so there are no lost updates.
//!
//! Downloads land in a per-repository staging directory and are renamed
//! into `packages/` only once complete, so a partial file is never visible
//! under a package path.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use rayon::prelude::*;

use crate::classify::Classification;
use crate::config::Config;
use crate::error::FetchError;
use crate::mirror::MirrorState;
use crate::signature::Signature;

/// Staging subdirectory inside each repo's `packages/` directory.
const STAGING_SUBDIR: &str = ".staging";

/// Fetches one package signature into a staging directory. The production
/// implementation shells out to the package manager; tests substitute
/// their own.
pub trait Fetcher: Sync {
    fn fetch(&self, sig: &Signature, staging_dir: &std::path::Path) -> Result<(), FetchError>;
}

/// Cooperative cancellation flag checked between batches. In-flight
/// fetches finish or time out naturally; no new batch is dispatched after
/// cancellation.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Engine tuning and behavior flags.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub batch_size: usize,
    pub parallelism: usize,
    /// Retries after the first failed attempt
    pub retries: u32,
    /// Ceiling for one whole batch; units not started before it passes
    /// are failed rather than dispatched
    pub batch_timeout: Duration,
    /// Re-fetch packages that already exist in the mirror
    pub force_redownload: bool,
    /// Log intended actions without touching the filesystem
    pub dry_run: bool,
    /// Skip the removal pass entirely
    pub skip_cleanup: bool,
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.tuning.batch_size,
            parallelism: config.tuning.parallelism,
            retries: config.tuning.retries,
            batch_timeout: Duration::from_secs(config.tuning.batch_timeout_secs),
            force_redownload: false,
            dry_run: false,
            skip_cleanup: false,
        }
    }
}

/// A download that did not succeed after retries.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub repo: String,
    pub signature: Signature,
    pub reason: String,
}

/// What the engine did (or, in dry-run, would have done).
#[derive(Debug, Default)]
pub struct EngineOutcome {
    /// Successfully fetched packages per repository
    pub downloaded: BTreeMap<String, usize>,
    /// Removed packages per repository
    pub removed: BTreeMap<String, usize>,
    /// Terminal download failures
    pub failures: Vec<FailureRecord>,
    /// Repositories whose contents changed this run
    pub changed_repos: BTreeSet<String>,
    /// True when a cancel request stopped dispatch early
    pub cancelled: bool,
}

impl EngineOutcome {
    pub fn total_downloaded(&self) -> usize {
        self.downloaded.values().sum()
    }

    pub fn total_removed(&self) -> usize {
        self.removed.values().sum()
    }
}

/// One unit of download work.
#[derive(Debug, Clone)]
struct FetchUnit {
    repo: String,
    signature: Signature,
}

/// Result of one unit, reported back to the coordinator.
enum UnitResult {
    Succeeded(FetchUnit),
    Failed(FetchUnit, String),
}

pub struct Engine<'a, F: Fetcher> {
    fetcher: &'a F,
    opts: EngineOptions,
    cancel: CancelToken,
}

impl<'a, F: Fetcher> Engine<'a, F> {
    pub fn new(fetcher: &'a F, opts: EngineOptions, cancel: CancelToken) -> Self {
        Self {
            fetcher,
            opts,
            cancel,
        }
    }

    /// Execute the plan: download phase, then removal phase. Removals for
    /// a repository always run after every download for that repository
    /// has settled, so a package is never re-downloaded and removed in
    /// the same run.
    pub fn run(
        &self,
        mirror: &mut MirrorState,
        classification: &Classification,
        progress: Option<&ProgressBar>,
    ) -> Result<EngineOutcome> {
        let mut outcome = EngineOutcome::default();

        let units = self.collect_units(classification);
        tracing::info!(
            "Engine: {} download(s) in batches of {}, parallelism {}",
            units.len(),
            self.opts.batch_size,
            self.opts.parallelism
        );

        if !self.opts.dry_run {
            self.prepare_directories(mirror, &units)?;
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.opts.parallelism.max(1))
            .build()
            .context("Failed to build download pool")?;

        for batch in units.chunks(self.opts.batch_size.max(1)) {
            if self.cancel.is_cancelled() {
                tracing::warn!("Cancellation requested; stopping batch dispatch");
                outcome.cancelled = true;
                break;
            }

            let deadline = Instant::now() + self.opts.batch_timeout;
            let results: Vec<UnitResult> = pool.install(|| {
                batch
                    .par_iter()
                    .map(|unit| self.fetch_unit(mirror, unit, deadline))
                    .collect()
            });

            for result in results {
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                match result {
                    UnitResult::Succeeded(unit) => {
                        *outcome.downloaded.entry(unit.repo.clone()).or_default() += 1;
                        outcome.changed_repos.insert(unit.repo.clone());
                        mirror.insert(&unit.repo, unit.signature);
                    }
                    UnitResult::Failed(unit, reason) => {
                        tracing::warn!("Download failed: {} ({})", unit.signature, reason);
                        outcome.failures.push(FailureRecord {
                            repo: unit.repo,
                            signature: unit.signature,
                            reason,
                        });
                    }
                }
            }
        }

        if !self.opts.dry_run {
            self.cleanup_staging(mirror, classification);
        }

        if !outcome.cancelled && !self.opts.skip_cleanup {
            self.remove_stale(mirror, classification, &pool, &mut outcome)?;
        }

        Ok(outcome)
    }

    /// Download units in deterministic order: repositories in key order,
    /// NEW before UPDATE within each, EXISTS last when force-redownload
    /// is on.
    fn collect_units(&self, classification: &Classification) -> Vec<FetchUnit> {
        let mut units = Vec::new();
        for (repo, plan) in &classification.repos {
            for sig in plan.to_fetch() {
                units.push(FetchUnit {
                    repo: repo.clone(),
                    signature: sig.clone(),
                });
            }
            if self.opts.force_redownload {
                for sig in &plan.exists {
                    units.push(FetchUnit {
                        repo: repo.clone(),
                        signature: sig.clone(),
                    });
                }
            }
        }
        units
    }

    fn prepare_directories(&self, mirror: &MirrorState, units: &[FetchUnit]) -> Result<()> {
        let repos: BTreeSet<&str> = units.iter().map(|u| u.repo.as_str()).collect();
        for repo in repos {
            let staging = mirror.packages_dir(repo).join(STAGING_SUBDIR);
            fs::create_dir_all(&staging)
                .with_context(|| format!("Failed to create staging dir: {}", staging.display()))?;
        }
        Ok(())
    }

    /// Fetch one package with bounded retry. Runs on a worker; touches
    /// only this unit's files and returns its result by value.
    fn fetch_unit(&self, mirror: &MirrorState, unit: &FetchUnit, deadline: Instant) -> UnitResult {
        if self.opts.dry_run {
            tracing::info!("[dry-run] would download {} for {}", unit.signature, unit.repo);
            return UnitResult::Succeeded(unit.clone());
        }

        if Instant::now() >= deadline {
            return UnitResult::Failed(
                unit.clone(),
                format!(
                    "batch deadline exceeded ({}s)",
                    self.opts.batch_timeout.as_secs()
                ),
            );
        }

        let staging_dir = mirror.packages_dir(&unit.repo).join(STAGING_SUBDIR);
        let staged = staging_dir.join(unit.signature.filename());
        let final_path = mirror.package_path(&unit.repo, &unit.signature);

        if self.opts.force_redownload && final_path.exists() {
            if let Err(e) = fs::remove_file(&final_path) {
                return UnitResult::Failed(unit.clone(), format!("removing old file: {e}"));
            }
        }

        let attempts = self.opts.retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.try_fetch(unit, &staging_dir, &staged, &final_path) {
                Ok(()) => return UnitResult::Succeeded(unit.clone()),
                Err(e) => {
                    last_error = e.to_string();
                    if e.is_retryable() && attempt < attempts && Instant::now() < deadline {
                        tracing::debug!(
                            "Retrying {} (attempt {}/{}): {}",
                            unit.signature,
                            attempt,
                            attempts,
                            last_error
                        );
                        continue;
                    }
                    break;
                }
            }
        }

        // Never leave a partial artifact behind in staging.
        let _ = fs::remove_file(&staged);
        UnitResult::Failed(unit.clone(), last_error)
    }

    fn try_fetch(
        &self,
        unit: &FetchUnit,
        staging_dir: &std::path::Path,
        staged: &std::path::Path,
        final_path: &std::path::Path,
    ) -> Result<(), FetchError> {
        self.fetcher.fetch(&unit.signature, staging_dir)?;

        if !staged.exists() {
            return Err(FetchError::MissingArtifact(
                unit.signature.filename(),
            ));
        }

        // Same filesystem as packages/, so the rename is atomic and the
        // old file (if any) is replaced in one step.
        fs::rename(staged, final_path)?;
        Ok(())
    }

    fn cleanup_staging(&self, mirror: &MirrorState, classification: &Classification) {
        for repo in classification.repos.keys() {
            let staging = mirror.packages_dir(repo).join(STAGING_SUBDIR);
            if staging.is_dir() {
                let _ = fs::remove_dir_all(&staging);
            }
        }
    }

    /// Bulk removal of packages no longer installed. A candidate sharing
    /// name+arch with a failed or deferred download is retained — its
    /// replacement never arrived this run.
    fn remove_stale(
        &self,
        mirror: &mut MirrorState,
        classification: &Classification,
        pool: &rayon::ThreadPool,
        outcome: &mut EngineOutcome,
    ) -> Result<()> {
        let retained: HashSet<(String, String)> = outcome
            .failures
            .iter()
            .map(|f| {
                let (name, arch) = f.signature.name_arch();
                (name.to_string(), arch.to_string())
            })
            .chain(classification.deferred.iter().map(|(_, sig)| {
                let (name, arch) = sig.name_arch();
                (name.to_string(), arch.to_string())
            }))
            .collect();

        let mut deletions: Vec<(String, Signature, PathBuf)> = Vec::new();
        for (repo, candidates) in &classification.removals {
            for sig in candidates {
                let (name, arch) = sig.name_arch();
                if retained.contains(&(name.to_string(), arch.to_string())) {
                    tracing::warn!(
                        "Retaining {} in {}: replacement did not arrive this run",
                        sig,
                        repo
                    );
                    continue;
                }

                let path = mirror.package_path(repo, sig);
                if self.opts.dry_run {
                    tracing::info!("[dry-run] would remove {} from {}", sig, repo);
                    deletions.push((repo.clone(), sig.clone(), path));
                    continue;
                }
                if !path.is_file() {
                    tracing::warn!("Removal candidate already gone: {}", path.display());
                    continue;
                }
                deletions.push((repo.clone(), sig.clone(), path));
            }
        }

        tracing::info!("Engine: {} removal(s)", deletions.len());

        let results: Vec<(String, Signature, Option<String>)> = if self.opts.dry_run {
            deletions
                .into_iter()
                .map(|(repo, sig, _)| (repo, sig, None))
                .collect()
        } else {
            pool.install(|| {
                deletions
                    .into_par_iter()
                    .map(|(repo, sig, path)| match fs::remove_file(&path) {
                        Ok(()) => (repo, sig, None),
                        Err(e) => (repo, sig, Some(e.to_string())),
                    })
                    .collect()
            })
        };

        for (repo, sig, error) in results {
            match error {
                None => {
                    mirror.remove(&repo, &sig);
                    *outcome.removed.entry(repo.clone()).or_default() += 1;
                    outcome.changed_repos.insert(repo);
                }
                Some(e) => {
                    tracing::warn!("Failed to remove {} from {}: {}", sig, repo, e);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, ClassifyOptions};
    use crate::index::{ReverseLookup, SourceIndex, UpstreamIndex};
    use crate::inventory::InstalledPackage;
    use crate::mirror::PACKAGES_SUBDIR;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    fn sig(name: &str, version: &str) -> Signature {
        Signature::new(name, "0", version, "1.fc40", "x86_64")
    }

    /// Scripted fetcher: per-signature behavior plus attempt counting.
    #[derive(Default)]
    struct MockFetcher {
        /// Signature filename -> number of retryable failures before success
        fail_first: HashMap<String, u32>,
        /// Signature filenames that always fail terminally
        terminal: Vec<String>,
        attempts: Mutex<HashMap<String, u32>>,
    }

    impl MockFetcher {
        fn attempts_for(&self, sig: &Signature) -> u32 {
            *self
                .attempts
                .lock()
                .unwrap()
                .get(&sig.filename())
                .unwrap_or(&0)
        }
    }

    impl Fetcher for MockFetcher {
        fn fetch(&self, sig: &Signature, staging_dir: &Path) -> Result<(), FetchError> {
            let key = sig.filename();
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let counter = attempts.entry(key.clone()).or_insert(0);
                *counter += 1;
                *counter
            };

            if self.terminal.contains(&key) {
                return Err(FetchError::NotFound(sig.nevra()));
            }
            if let Some(&failures) = self.fail_first.get(&key) {
                if attempt <= failures {
                    return Err(FetchError::Timeout {
                        command: "mock".into(),
                        seconds: 1,
                    });
                }
            }

            fs::write(staging_dir.join(&key), b"rpm bytes")?;
            Ok(())
        }
    }

    fn seed_mirror(root: &Path, repo: &str, files: &[&str]) {
        let packages = root.join(repo).join(PACKAGES_SUBDIR);
        fs::create_dir_all(&packages).unwrap();
        for file in files {
            fs::write(packages.join(file), b"rpm").unwrap();
        }
    }

    fn installed(name: &str, version: &str, from: &str) -> InstalledPackage {
        InstalledPackage {
            signature: sig(name, version),
            from_repo: from.to_string(),
        }
    }

    fn lookup_with(entries: &[(&str, &[Signature])]) -> ReverseLookup {
        let mut index = UpstreamIndex::default();
        for (source, sigs) in entries {
            index.sources.insert(
                source.to_string(),
                SourceIndex::new(source, sigs.iter().cloned().collect()),
            );
        }
        ReverseLookup::build(&index)
    }

    fn classify_for(
        installed_set: &[InstalledPackage],
        lookup: &ReverseLookup,
        mirror: &MirrorState,
    ) -> Classification {
        let opts = ClassifyOptions {
            enabled_sources: vec!["fedora".to_string()],
            ..Default::default()
        };
        classify(installed_set, lookup, mirror, &opts)
    }

    fn test_opts() -> EngineOptions {
        EngineOptions {
            batch_size: 2,
            parallelism: 2,
            retries: 2,
            batch_timeout: Duration::from_secs(600),
            force_redownload: false,
            dry_run: false,
            skip_cleanup: false,
        }
    }

    /// Every regular file under a directory, relative paths, sorted.
    fn tree_snapshot(root: &Path) -> Vec<String> {
        fn walk(dir: &Path, root: &Path, acc: &mut Vec<String>) {
            if let Ok(entries) = fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        walk(&path, root, acc);
                    } else {
                        acc.push(path.strip_prefix(root).unwrap().display().to_string());
                    }
                }
            }
        }
        let mut acc = Vec::new();
        walk(root, root, &mut acc);
        acc.sort();
        acc
    }

    #[test]
    fn test_download_updates_mirror_and_changed_set() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("fedora").join(PACKAGES_SUBDIR)).unwrap();
        let mut mirror = MirrorState::scan(dir.path()).unwrap();
        let lookup = lookup_with(&[("fedora", &[sig("bash", "5.2")])]);
        let classification =
            classify_for(&[installed("bash", "5.2", "fedora")], &lookup, &mirror);

        let fetcher = MockFetcher::default();
        let engine = Engine::new(&fetcher, test_opts(), CancelToken::new());
        let outcome = engine.run(&mut mirror, &classification, None).unwrap();

        assert_eq!(outcome.total_downloaded(), 1);
        assert!(outcome.failures.is_empty());
        assert!(outcome.changed_repos.contains("fedora"));
        assert!(mirror.contains("fedora", &sig("bash", "5.2")));
        assert!(mirror.package_path("fedora", &sig("bash", "5.2")).is_file());
        // Staging directory is cleaned up
        assert!(!mirror.packages_dir("fedora").join(STAGING_SUBDIR).exists());
    }

    #[test]
    fn test_retryable_failure_then_success() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("fedora").join(PACKAGES_SUBDIR)).unwrap();
        let mut mirror = MirrorState::scan(dir.path()).unwrap();
        let lookup = lookup_with(&[("fedora", &[sig("bash", "5.2")])]);
        let classification =
            classify_for(&[installed("bash", "5.2", "fedora")], &lookup, &mirror);

        let mut fetcher = MockFetcher::default();
        fetcher
            .fail_first
            .insert(sig("bash", "5.2").filename(), 1);

        let engine = Engine::new(&fetcher, test_opts(), CancelToken::new());
        let outcome = engine.run(&mut mirror, &classification, None).unwrap();

        assert_eq!(outcome.total_downloaded(), 1);
        assert!(outcome.failures.is_empty());
        assert_eq!(fetcher.attempts_for(&sig("bash", "5.2")), 2);
    }

    #[test]
    fn test_terminal_failure_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("fedora").join(PACKAGES_SUBDIR)).unwrap();
        let mut mirror = MirrorState::scan(dir.path()).unwrap();
        let lookup = lookup_with(&[("fedora", &[sig("ghost", "1.0")])]);
        let classification =
            classify_for(&[installed("ghost", "1.0", "fedora")], &lookup, &mirror);

        let mut fetcher = MockFetcher::default();
        fetcher.terminal.push(sig("ghost", "1.0").filename());

        let engine = Engine::new(&fetcher, test_opts(), CancelToken::new());
        let outcome = engine.run(&mut mirror, &classification, None).unwrap();

        assert_eq!(outcome.total_downloaded(), 0);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].reason.contains("no match"));
        assert_eq!(fetcher.attempts_for(&sig("ghost", "1.0")), 1);
        assert!(!mirror.contains("fedora", &sig("ghost", "1.0")));
        // Failed-only runs leave the changed set empty
        assert!(outcome.changed_repos.is_empty());
    }

    #[test]
    fn test_retries_exhausted_recorded_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("fedora").join(PACKAGES_SUBDIR)).unwrap();
        let mut mirror = MirrorState::scan(dir.path()).unwrap();
        let lookup = lookup_with(&[("fedora", &[sig("flaky", "1.0")])]);
        let classification =
            classify_for(&[installed("flaky", "1.0", "fedora")], &lookup, &mirror);

        let mut fetcher = MockFetcher::default();
        fetcher.fail_first.insert(sig("flaky", "1.0").filename(), 99);

        let engine = Engine::new(&fetcher, test_opts(), CancelToken::new());
        let outcome = engine.run(&mut mirror, &classification, None).unwrap();

        assert_eq!(outcome.failures.len(), 1);
        // retries = 2 means three attempts total
        assert_eq!(fetcher.attempts_for(&sig("flaky", "1.0")), 3);
    }

    #[test]
    fn test_removal_of_uninstalled_package() {
        let dir = tempfile::tempdir().unwrap();
        seed_mirror(dir.path(), "fedora", &["stale-1.0-1.fc40.x86_64.rpm"]);
        let mut mirror = MirrorState::scan(dir.path()).unwrap();
        let lookup = lookup_with(&[("fedora", &[])]);
        let classification = classify_for(&[], &lookup, &mirror);

        let fetcher = MockFetcher::default();
        let engine = Engine::new(&fetcher, test_opts(), CancelToken::new());
        let outcome = engine.run(&mut mirror, &classification, None).unwrap();

        assert_eq!(outcome.total_removed(), 1);
        assert!(outcome.changed_repos.contains("fedora"));
        assert!(!mirror.contains("fedora", &sig("stale", "1.0")));
        assert!(!dir
            .path()
            .join("fedora/packages/stale-1.0-1.fc40.x86_64.rpm")
            .exists());
    }

    #[test]
    fn test_old_build_removed_only_after_update_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        seed_mirror(dir.path(), "fedora", &["bash-5.1-1.fc40.x86_64.rpm"]);
        let mut mirror = MirrorState::scan(dir.path()).unwrap();
        let lookup = lookup_with(&[("fedora", &[sig("bash", "5.2")])]);
        let classification =
            classify_for(&[installed("bash", "5.2", "fedora")], &lookup, &mirror);

        let fetcher = MockFetcher::default();
        let engine = Engine::new(&fetcher, test_opts(), CancelToken::new());
        let outcome = engine.run(&mut mirror, &classification, None).unwrap();

        // New build arrived, old build removed
        assert!(mirror.contains("fedora", &sig("bash", "5.2")));
        assert!(!mirror.contains("fedora", &sig("bash", "5.1")));
        assert_eq!(outcome.total_removed(), 1);
    }

    #[test]
    fn test_old_build_retained_when_update_fails() {
        let dir = tempfile::tempdir().unwrap();
        seed_mirror(dir.path(), "fedora", &["bash-5.1-1.fc40.x86_64.rpm"]);
        let mut mirror = MirrorState::scan(dir.path()).unwrap();
        let lookup = lookup_with(&[("fedora", &[sig("bash", "5.2")])]);
        let classification =
            classify_for(&[installed("bash", "5.2", "fedora")], &lookup, &mirror);

        let mut fetcher = MockFetcher::default();
        fetcher.terminal.push(sig("bash", "5.2").filename());

        let engine = Engine::new(&fetcher, test_opts(), CancelToken::new());
        let outcome = engine.run(&mut mirror, &classification, None).unwrap();

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.total_removed(), 0);
        // The superseded build survives because its replacement failed
        assert!(mirror.contains("fedora", &sig("bash", "5.1")));
        assert!(dir
            .path()
            .join("fedora/packages/bash-5.1-1.fc40.x86_64.rpm")
            .is_file());
    }

    #[test]
    fn test_dry_run_has_zero_filesystem_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        seed_mirror(
            dir.path(),
            "fedora",
            &["bash-5.1-1.fc40.x86_64.rpm", "stale-1.0-1.fc40.x86_64.rpm"],
        );
        let mut mirror = MirrorState::scan(dir.path()).unwrap();
        let lookup = lookup_with(&[("fedora", &[sig("bash", "5.2")])]);
        let classification =
            classify_for(&[installed("bash", "5.2", "fedora")], &lookup, &mirror);

        let before = tree_snapshot(dir.path());

        let fetcher = MockFetcher::default();
        let mut opts = test_opts();
        opts.dry_run = true;
        let engine = Engine::new(&fetcher, opts, CancelToken::new());
        let outcome = engine.run(&mut mirror, &classification, None).unwrap();

        assert_eq!(tree_snapshot(dir.path()), before);
        // The fetcher was never invoked
        assert_eq!(fetcher.attempts_for(&sig("bash", "5.2")), 0);
        // Intended actions are still reported: the update download plus
        // removal of both the stale package and the superseded build
        assert_eq!(outcome.total_downloaded(), 1);
        assert_eq!(outcome.total_removed(), 2);
    }

    #[test]
    fn test_cancel_stops_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("fedora").join(PACKAGES_SUBDIR)).unwrap();
        let mut mirror = MirrorState::scan(dir.path()).unwrap();
        let lookup = lookup_with(&[("fedora", &[sig("bash", "5.2")])]);
        let classification =
            classify_for(&[installed("bash", "5.2", "fedora")], &lookup, &mirror);

        let fetcher = MockFetcher::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let engine = Engine::new(&fetcher, test_opts(), cancel);
        let outcome = engine.run(&mut mirror, &classification, None).unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.total_downloaded(), 0);
        assert_eq!(fetcher.attempts_for(&sig("bash", "5.2")), 0);
    }

    #[test]
    fn test_force_redownload_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        seed_mirror(dir.path(), "fedora", &["bash-5.2-1.fc40.x86_64.rpm"]);
        let old_path = dir.path().join("fedora/packages/bash-5.2-1.fc40.x86_64.rpm");
        fs::write(&old_path, b"old bytes").unwrap();

        let mut mirror = MirrorState::scan(dir.path()).unwrap();
        let lookup = lookup_with(&[("fedora", &[sig("bash", "5.2")])]);
        let classification =
            classify_for(&[installed("bash", "5.2", "fedora")], &lookup, &mirror);
        // Without force, nothing to fetch
        assert_eq!(classification.total_to_fetch(), 0);

        let fetcher = MockFetcher::default();
        let mut opts = test_opts();
        opts.force_redownload = true;
        let engine = Engine::new(&fetcher, opts, CancelToken::new());
        let outcome = engine.run(&mut mirror, &classification, None).unwrap();

        assert_eq!(outcome.total_downloaded(), 1);
        assert_eq!(fs::read(&old_path).unwrap(), b"rpm bytes");
    }

    #[test]
    fn test_batch_deadline_fails_undispatched_units() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("fedora").join(PACKAGES_SUBDIR)).unwrap();
        let mut mirror = MirrorState::scan(dir.path()).unwrap();
        let lookup = lookup_with(&[("fedora", &[sig("bash", "5.2")])]);
        let classification =
            classify_for(&[installed("bash", "5.2", "fedora")], &lookup, &mirror);

        let fetcher = MockFetcher::default();
        let mut opts = test_opts();
        opts.batch_timeout = Duration::from_secs(0);
        let engine = Engine::new(&fetcher, opts, CancelToken::new());
        let outcome = engine.run(&mut mirror, &classification, None).unwrap();

        assert_eq!(outcome.total_downloaded(), 0);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].reason.contains("batch deadline"));
        assert_eq!(fetcher.attempts_for(&sig("bash", "5.2")), 0);
    }

    #[test]
    fn test_skip_cleanup_leaves_stale_packages() {
        let dir = tempfile::tempdir().unwrap();
        seed_mirror(dir.path(), "fedora", &["stale-1.0-1.fc40.x86_64.rpm"]);
        let mut mirror = MirrorState::scan(dir.path()).unwrap();
        let lookup = lookup_with(&[("fedora", &[])]);
        let classification = classify_for(&[], &lookup, &mirror);

        let fetcher = MockFetcher::default();
        let mut opts = test_opts();
        opts.skip_cleanup = true;
        let engine = Engine::new(&fetcher, opts, CancelToken::new());
        let outcome = engine.run(&mut mirror, &classification, None).unwrap();

        assert_eq!(outcome.total_removed(), 0);
        assert!(mirror.contains("fedora", &sig("stale", "1.0")));
    }
}
