//! Package classification
//!
//! Decides, for every installed package, what the mirror has to do about
//! it: nothing (EXISTS), fetch a newer build (UPDATE), fetch the first
//! build (NEW), or report it (UNKNOWN — no resolvable source). Also
//! derives the per-repository removal candidates: mirrored packages no
//! longer present in the installed set.

use std::collections::{BTreeMap, BTreeSet};

use crate::index::ReverseLookup;
use crate::inventory::InstalledPackage;
use crate::mirror::MirrorState;
use crate::signature::Signature;

/// External knobs applied during classification. All filtering and
/// truncation is deterministic: records are sorted before any limit is
/// applied.
#[derive(Debug, Default, Clone)]
pub struct ClassifyOptions {
    /// Substring filter on package names
    pub name_filter: Option<String>,
    /// Only classify packages resolving to this repository
    pub repo_filter: Option<String>,
    /// Cap on the candidate set, applied after sorting
    pub max_packages: Option<usize>,
    /// Cap on NEW+UPDATE entries entering the download plan
    pub max_changed: Option<usize>,
    /// Sources the classifier may trust without an upstream index entry
    pub local_only: Vec<String>,
    /// Enabled upstream sources (for the installed-record fallback)
    pub enabled_sources: Vec<String>,
    /// Tie-break order for ambiguous signatures
    pub priority: Vec<String>,
}

/// What one repository needs.
#[derive(Debug, Default, Clone)]
pub struct RepoPlan {
    /// No build of this name+arch mirrored yet
    pub new: Vec<Signature>,
    /// A different build is mirrored; this exact signature is not
    pub update: Vec<Signature>,
    /// Exact signature already mirrored
    pub exists: Vec<Signature>,
    /// Every installed signature resolved to this repository. Removal
    /// candidates are mirror contents outside this set.
    pub desired: BTreeSet<Signature>,
}

impl RepoPlan {
    /// Signatures that need downloading, in plan order.
    pub fn to_fetch(&self) -> impl Iterator<Item = &Signature> {
        self.new.iter().chain(self.update.iter())
    }

    pub fn changed_len(&self) -> usize {
        self.new.len() + self.update.len()
    }
}

/// Full classification output for one run.
#[derive(Debug, Default)]
pub struct Classification {
    /// Per-repository plans, keyed by resolved source name
    pub repos: BTreeMap<String, RepoPlan>,
    /// Unresolvable packages with the reason, never silently dropped
    pub unknown: Vec<(InstalledPackage, String)>,
    /// NEW/UPDATE entries pushed out of this run by `max_changed`;
    /// their mirrored predecessors must survive the removal pass
    pub deferred: Vec<(String, Signature)>,
    /// Per-repository removal candidates (mirrored but not installed)
    pub removals: BTreeMap<String, Vec<Signature>>,
}

impl Classification {
    pub fn total_to_fetch(&self) -> usize {
        self.repos.values().map(|p| p.changed_len()).sum()
    }

    pub fn total_removals(&self) -> usize {
        self.removals.values().map(|r| r.len()).sum()
    }
}

/// Classify the installed set against the mirror.
///
/// Resolution order per record: reverse lookup over the upstream index,
/// then the source recorded at install time (when it is an enabled
/// source), then the configured local-only sources. Total failure yields
/// UNKNOWN with a reason; one unresolved package never aborts the run.
pub fn classify(
    installed: &[InstalledPackage],
    lookup: &ReverseLookup,
    mirror: &MirrorState,
    opts: &ClassifyOptions,
) -> Classification {
    let mut candidates: Vec<&InstalledPackage> = installed
        .iter()
        .filter(|rec| match &opts.name_filter {
            Some(filter) => rec.signature.name.contains(filter.as_str()),
            None => true,
        })
        .collect();

    // Inventory is already sorted, but do not rely on the caller for the
    // determinism the truncation below needs.
    candidates.sort_by(|a, b| a.signature.cmp(&b.signature));

    if let Some(max) = opts.max_packages {
        candidates.truncate(max);
    }

    let mut result = Classification::default();

    for record in candidates {
        let repo = match resolve_source(record, lookup, opts) {
            Ok(repo) => repo,
            Err(reason) => {
                tracing::debug!("UNKNOWN {}: {}", record.signature, reason);
                result.unknown.push((record.clone(), reason));
                continue;
            }
        };

        if let Some(ref wanted) = opts.repo_filter {
            if &repo != wanted {
                continue;
            }
        }

        let plan = result.repos.entry(repo.clone()).or_default();
        plan.desired.insert(record.signature.clone());

        if mirror.contains(&repo, &record.signature) {
            plan.exists.push(record.signature.clone());
        } else if mirror.has_name_arch(&repo, &record.signature) {
            plan.update.push(record.signature.clone());
        } else {
            plan.new.push(record.signature.clone());
        }
    }

    // Candidate vector is sorted, so per-plan lists are already sorted;
    // the cap below therefore trims a stable tail.
    if let Some(max) = opts.max_changed {
        apply_changed_cap(&mut result, max);
    }

    collect_removals(&mut result, mirror, opts);
    result
}

fn resolve_source(
    record: &InstalledPackage,
    lookup: &ReverseLookup,
    opts: &ClassifyOptions,
) -> Result<String, String> {
    if let Some(repo) = lookup.resolve(&record.signature, &record.from_repo, &opts.priority) {
        return Ok(repo.to_string());
    }

    if !record.from_repo.is_empty() {
        if opts.enabled_sources.contains(&record.from_repo) {
            return Ok(record.from_repo.clone());
        }
        if opts.local_only.contains(&record.from_repo) {
            return Ok(record.from_repo.clone());
        }
        return Err(format!(
            "source repository '{}' is not enabled and the package was not found in any enabled repository",
            record.from_repo
        ));
    }

    Err("not found in any enabled repository and no source repository recorded".to_string())
}

/// Trim NEW/UPDATE entries beyond `max` into the deferred list. Repos are
/// visited in key order and entries in plan order, so the same inputs
/// always defer the same tail.
fn apply_changed_cap(result: &mut Classification, max: usize) {
    let mut remaining = max;
    for (repo, plan) in result.repos.iter_mut() {
        for list in [&mut plan.new, &mut plan.update] {
            let keep = remaining.min(list.len());
            for sig in list.drain(keep..) {
                result.deferred.push((repo.clone(), sig));
            }
            remaining -= keep;
        }
    }
    if !result.deferred.is_empty() {
        tracing::info!(
            "Deferred {} package(s) beyond the max-changed limit",
            result.deferred.len()
        );
    }
}

/// Mirror contents with no counterpart in the installed set. A package
/// that is still installed is never a removal candidate.
fn collect_removals(result: &mut Classification, mirror: &MirrorState, opts: &ClassifyOptions) {
    for repo in mirror.repo_names() {
        if let Some(ref wanted) = opts.repo_filter {
            if &repo != wanted {
                continue;
            }
        }
        let desired = result
            .repos
            .get(&repo)
            .map(|p| p.desired.clone())
            .unwrap_or_default();

        let stale: Vec<Signature> = mirror
            .packages(&repo)
            .into_iter()
            .filter(|sig| !desired.contains(sig))
            .collect();

        if !stale.is_empty() {
            result.removals.insert(repo, stale);
        }
    }
}
