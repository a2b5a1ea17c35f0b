//! Upstream metadata cache
//!
//! Maintains one persisted index entry per upstream source: the set of
//! package signatures that source offers, stamped with the time it was
//! last refreshed. Entries younger than the freshness window are reused
//! without touching the network; stale entries are re-queried, falling
//! back to the stale data when the query fails.
//!
//! ## Persisted layout
//!
//! One JSON document per source under `<cache_dir>/index/`:
//!
//! ```json
//! {
//!   "source": "fedora",
//!   "refreshed": "2026-08-06T09:14:02Z",
//!   "signatures": [ {"name": "bash", ...}, ... ]
//! }
//! ```
//!
//! Writes go through a temp file in the same directory followed by a
//! rename, so a concurrent reader never observes a partial entry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::signature::Signature;

/// Persisted index entry for one upstream source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceIndex {
    /// Source repository id
    pub source: String,
    /// When this entry was last refreshed from upstream
    pub refreshed: DateTime<Utc>,
    /// Every signature the source offers
    pub signatures: BTreeSet<Signature>,
}

impl SourceIndex {
    pub fn new(source: &str, signatures: BTreeSet<Signature>) -> Self {
        Self {
            source: source.to_string(),
            refreshed: Utc::now(),
            signatures,
        }
    }

    /// An empty entry recorded after a query failure with no prior cache.
    pub fn empty(source: &str) -> Self {
        Self::new(source, BTreeSet::new())
    }

    /// Whether the entry is young enough to reuse without a query.
    pub fn is_fresh(&self, max_age_secs: u64) -> bool {
        let age = Utc::now() - self.refreshed;
        age <= Duration::seconds(max_age_secs as i64) && age >= Duration::zero()
    }
}

/// On-disk store of [`SourceIndex`] entries.
pub struct IndexCache {
    dir: PathBuf,
}

impl IndexCache {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn entry_path(&self, source: &str) -> PathBuf {
        // Repo ids are flat identifiers; guard against separators anyway.
        let safe = source.replace(['/', '\\'], "_");
        self.dir.join(format!("{safe}.json"))
    }

    /// Load the persisted entry for a source, if any. A corrupt entry is
    /// treated as absent.
    pub fn load(&self, source: &str) -> Result<Option<SourceIndex>> {
        let path = self.entry_path(source);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read index entry: {}", path.display()))?;

        match serde_json::from_str(&content) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                tracing::warn!("Discarding corrupt index entry {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Persist an entry atomically: write to a temp file in the cache
    /// directory, then rename over the final path.
    pub fn store(&self, entry: &SourceIndex) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache dir: {}", self.dir.display()))?;

        let path = self.entry_path(&entry.source);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .context("Failed to create temp file for index entry")?;

        let content = serde_json::to_string(entry)?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to persist index entry: {}", path.display()))?;

        Ok(())
    }

    /// Remove the persisted entry for a source. Missing entries are fine.
    pub fn clear(&self, source: &str) -> Result<bool> {
        let path = self.entry_path(source);
        if path.exists() {
            fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// List persisted entries with their age, for `cache show`.
    pub fn entries(&self) -> Result<Vec<SourceIndex>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(content) = fs::read_to_string(&path) {
                    if let Ok(entry) = serde_json::from_str::<SourceIndex>(&content) {
                        entries.push(entry);
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.source.cmp(&b.source));
        Ok(entries)
    }

    /// Return a usable index entry for one source.
    ///
    /// Fresh cached entries are returned without querying. Otherwise the
    /// source is queried and the result persisted. A failed query falls
    /// back to the stale entry when one exists, or an empty entry when
    /// not; either way the failure is reported alongside so the run can
    /// record it as a soft failure.
    pub fn get_or_refresh<Q>(
        &self,
        source: &str,
        max_age_secs: u64,
        full_rebuild: bool,
        query: Q,
    ) -> (SourceIndex, Option<String>)
    where
        Q: Fn(&str) -> std::result::Result<BTreeSet<Signature>, FetchError>,
    {
        let cached = self.load(source).unwrap_or_else(|e| {
            tracing::warn!("Failed to load index entry for {}: {}", source, e);
            None
        });

        if !full_rebuild {
            if let Some(ref entry) = cached {
                if entry.is_fresh(max_age_secs) {
                    tracing::debug!(
                        "Index for {} is fresh ({} signatures)",
                        source,
                        entry.signatures.len()
                    );
                    return (entry.clone(), None);
                }
            }
        }

        tracing::info!("Refreshing index for {}", source);
        match query(source) {
            Ok(signatures) => {
                let entry = SourceIndex::new(source, signatures);
                if let Err(e) = self.store(&entry) {
                    tracing::warn!("Failed to persist index entry for {}: {}", source, e);
                }
                (entry, None)
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!("Index query for {} failed: {}", source, reason);
                match cached {
                    Some(stale) => {
                        tracing::warn!(
                            "Using stale index for {} from {}",
                            source,
                            stale.refreshed
                        );
                        (stale, Some(reason))
                    }
                    None => (SourceIndex::empty(source), Some(reason)),
                }
            }
        }
    }
}

/// The full upstream view: one index entry per enabled source, plus the
/// soft failures collected while building it.
#[derive(Debug, Default)]
pub struct UpstreamIndex {
    pub sources: BTreeMap<String, SourceIndex>,
    /// (source, reason) for every query that fell back or came up empty
    pub failures: Vec<(String, String)>,
}

impl UpstreamIndex {
    /// Refresh all sources concurrently on a bounded worker pool. Workers
    /// only return values; accumulation happens here on the calling thread.
    pub fn refresh_all<Q>(
        cache: &IndexCache,
        sources: &[String],
        max_age_secs: u64,
        full_rebuild: bool,
        parallelism: usize,
        query: Q,
    ) -> Result<Self>
    where
        Q: Fn(&str) -> std::result::Result<BTreeSet<Signature>, FetchError> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism.max(1))
            .build()
            .context("Failed to build index refresh pool")?;

        let results: Vec<(SourceIndex, Option<String>)> = pool.install(|| {
            sources
                .par_iter()
                .map(|source| cache.get_or_refresh(source, max_age_secs, full_rebuild, &query))
                .collect()
        });

        let mut index = UpstreamIndex::default();
        for (entry, failure) in results {
            if let Some(reason) = failure {
                index.failures.push((entry.source.clone(), reason));
            }
            index.sources.insert(entry.source.clone(), entry);
        }

        Ok(index)
    }

    /// Total signatures across all sources.
    pub fn total_signatures(&self) -> usize {
        self.sources.values().map(|s| s.signatures.len()).sum()
    }
}

/// Parse a per-source available listing (`name|epoch|version|release|arch`
/// per line) into a signature set.
pub fn parse_available(raw: &str) -> BTreeSet<Signature> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let fields: Vec<&str> = line.split('|').collect();
            if fields.len() < 5 {
                tracing::warn!("Skipping malformed available line: {}", line);
                return None;
            }
            Some(Signature::new(
                fields[0], fields[1], fields[2], fields[3], fields[4],
            ))
        })
        .collect()
}

/// Signature → candidate sources, built once from the upstream index for
/// O(1) resolution during classification.
pub struct ReverseLookup {
    map: HashMap<Signature, Vec<String>>,
}

impl ReverseLookup {
    pub fn build(index: &UpstreamIndex) -> Self {
        let mut map: HashMap<Signature, Vec<String>> = HashMap::new();
        // BTreeMap iteration keeps candidate lists in lexicographic source
        // order, which the tie-break below relies on.
        for (source, entry) in &index.sources {
            for sig in &entry.signatures {
                map.entry(sig.clone()).or_default().push(source.clone());
            }
        }
        Self { map }
    }

    /// Resolve the source a signature should be mirrored under.
    ///
    /// Tie-break when several sources offer the signature: the source the
    /// package manager recorded at install time wins if it is a candidate;
    /// otherwise the first match in the configured priority list; otherwise
    /// the lexicographically first candidate. Deterministic for identical
    /// inputs.
    pub fn resolve(&self, sig: &Signature, installed_from: &str, priority: &[String]) -> Option<&str> {
        let candidates = self.map.get(sig)?;

        if !installed_from.is_empty() && candidates.iter().any(|c| c == installed_from) {
            return candidates
                .iter()
                .find(|c| c.as_str() == installed_from)
                .map(|c| c.as_str());
        }

        for preferred in priority {
            if let Some(found) = candidates.iter().find(|c| *c == preferred) {
                return Some(found.as_str());
            }
        }

        candidates.first().map(|c| c.as_str())
    }

    /// Number of distinct signatures known across all sources.
    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(name: &str, version: &str) -> Signature {
        Signature::new(name, "0", version, "1.fc40", "x86_64")
    }

    fn entry_with(source: &str, sigs: &[Signature]) -> SourceIndex {
        SourceIndex::new(source, sigs.iter().cloned().collect())
    }

    #[test]
    fn test_store_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path());

        let entry = entry_with("fedora", &[sig("bash", "5.2"), sig("vim", "9.1")]);
        cache.store(&entry).unwrap();

        let loaded = cache.load("fedora").unwrap().unwrap();
        assert_eq!(loaded.source, "fedora");
        assert_eq!(loaded.signatures.len(), 2);
        assert!(loaded.signatures.contains(&sig("bash", "5.2")));
    }

    #[test]
    fn test_load_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path());
        assert!(cache.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_entry_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path());
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join("fedora.json"), "{not json").unwrap();
        assert!(cache.load("fedora").unwrap().is_none());
    }

    #[test]
    fn test_fresh_entry_not_requeried() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path());
        cache
            .store(&entry_with("fedora", &[sig("bash", "5.2")]))
            .unwrap();

        let (entry, failure) = cache.get_or_refresh("fedora", 14400, false, |_| {
            panic!("fresh entry must not be re-queried")
        });
        assert!(failure.is_none());
        assert_eq!(entry.signatures.len(), 1);
    }

    #[test]
    fn test_stale_entry_requeried() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path());

        let mut old = entry_with("fedora", &[sig("bash", "5.1")]);
        old.refreshed = Utc::now() - Duration::hours(5);
        cache.store(&old).unwrap();

        let (entry, failure) = cache.get_or_refresh("fedora", 14400, false, |_| {
            Ok([sig("bash", "5.2")].into_iter().collect())
        });
        assert!(failure.is_none());
        assert!(entry.signatures.contains(&sig("bash", "5.2")));
        assert!(entry.is_fresh(14400));

        // The refreshed entry was persisted
        let reloaded = cache.load("fedora").unwrap().unwrap();
        assert!(reloaded.signatures.contains(&sig("bash", "5.2")));
    }

    #[test]
    fn test_full_rebuild_requeries_fresh_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path());
        cache
            .store(&entry_with("fedora", &[sig("bash", "5.1")]))
            .unwrap();

        let (entry, _) = cache.get_or_refresh("fedora", 14400, true, |_| {
            Ok([sig("bash", "5.2")].into_iter().collect())
        });
        assert!(entry.signatures.contains(&sig("bash", "5.2")));
    }

    #[test]
    fn test_query_failure_falls_back_to_stale() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path());

        let mut old = entry_with("fedora", &[sig("bash", "5.1")]);
        old.refreshed = Utc::now() - Duration::hours(6);
        cache.store(&old).unwrap();

        let (entry, failure) = cache.get_or_refresh("fedora", 14400, false, |_| {
            Err(FetchError::Timeout {
                command: "dnf repoquery".into(),
                seconds: 600,
            })
        });
        assert!(failure.is_some());
        assert!(entry.signatures.contains(&sig("bash", "5.1")));
    }

    #[test]
    fn test_query_failure_without_cache_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path());

        let (entry, failure) = cache.get_or_refresh("fedora", 14400, false, |_| {
            Err(FetchError::NotFound("anything".into()))
        });
        assert!(failure.is_some());
        assert!(entry.signatures.is_empty());
    }

    #[test]
    fn test_refresh_all_accumulates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path());
        let sources = vec!["fedora".to_string(), "updates".to_string()];

        let index = UpstreamIndex::refresh_all(&cache, &sources, 14400, false, 2, |source| {
            if source == "updates" {
                Err(FetchError::Timeout {
                    command: "dnf repoquery".into(),
                    seconds: 600,
                })
            } else {
                Ok([sig("bash", "5.2")].into_iter().collect())
            }
        })
        .unwrap();

        assert_eq!(index.sources.len(), 2);
        assert_eq!(index.failures.len(), 1);
        assert_eq!(index.failures[0].0, "updates");
        assert_eq!(index.total_signatures(), 1);
    }

    #[test]
    fn test_parse_available() {
        let raw = "bash|0|5.2.26|3.fc40|x86_64\nvim|(none)|9.1|1.fc40|x86_64\nbad line\n";
        let sigs = parse_available(raw);
        assert_eq!(sigs.len(), 2);
        assert!(sigs.contains(&Signature::new("vim", "0", "9.1", "1.fc40", "x86_64")));
    }

    #[test]
    fn test_reverse_lookup_prefers_installed_source() {
        let mut index = UpstreamIndex::default();
        let shared = sig("bash", "5.2");
        index
            .sources
            .insert("a-repo".into(), entry_with("a-repo", &[shared.clone()]));
        index
            .sources
            .insert("b-repo".into(), entry_with("b-repo", &[shared.clone()]));

        let lookup = ReverseLookup::build(&index);
        assert_eq!(lookup.resolve(&shared, "b-repo", &[]), Some("b-repo"));
    }

    #[test]
    fn test_reverse_lookup_priority_then_lexicographic() {
        let mut index = UpstreamIndex::default();
        let shared = sig("bash", "5.2");
        for source in ["c-repo", "a-repo", "b-repo"] {
            index
                .sources
                .insert(source.into(), entry_with(source, &[shared.clone()]));
        }

        let lookup = ReverseLookup::build(&index);
        // Installed-from not a candidate; priority list decides
        let priority = vec!["b-repo".to_string()];
        assert_eq!(lookup.resolve(&shared, "other", &priority), Some("b-repo"));
        // No priority either: lexicographically first
        assert_eq!(lookup.resolve(&shared, "", &[]), Some("a-repo"));
    }

    #[test]
    fn test_reverse_lookup_unknown_signature() {
        let lookup = ReverseLookup::build(&UpstreamIndex::default());
        assert!(lookup.resolve(&sig("ghost", "1.0"), "fedora", &[]).is_none());
    }
}
