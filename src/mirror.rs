//! Local mirror state
//!
//! The mirror is a directory tree with one subdirectory per repository:
//!
//! ```text
//! <mirror_root>/
//!   fedora/
//!     repodata/          <- generated metadata, repository level
//!     packages/          <- the mirrored .rpm files
//!   updates/
//!     ...
//! ```
//!
//! This module holds the in-memory view of which signatures are physically
//! present. It is scanned from disk at classification time and mutated only
//! by the download/removal engine.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::signature::Signature;

/// Name of the per-repository package storage subdirectory.
pub const PACKAGES_SUBDIR: &str = "packages";

/// Per-repository sets of signatures present on disk.
#[derive(Debug)]
pub struct MirrorState {
    root: PathBuf,
    repos: BTreeMap<String, BTreeSet<Signature>>,
}

impl MirrorState {
    /// Scan the mirror tree. Repository directories without a `packages/`
    /// subdirectory are treated as empty; files that do not parse as
    /// package filenames are ignored with a warning.
    pub fn scan(root: &Path) -> Result<Self> {
        let mut repos = BTreeMap::new();

        for dirent in fs::read_dir(root)
            .with_context(|| format!("Failed to read mirror root: {}", root.display()))?
        {
            let dirent = dirent?;
            if !dirent.file_type()?.is_dir() {
                continue;
            }
            let repo = dirent.file_name().to_string_lossy().to_string();
            let packages_dir = dirent.path().join(PACKAGES_SUBDIR);

            let mut signatures = BTreeSet::new();
            if packages_dir.is_dir() {
                for pkg_entry in fs::read_dir(&packages_dir)? {
                    let path = pkg_entry?.path();
                    if !path.is_file() {
                        continue;
                    }
                    let filename = match path.file_name() {
                        Some(name) => name.to_string_lossy().to_string(),
                        None => continue,
                    };
                    if !filename.ends_with(".rpm") {
                        continue;
                    }
                    match Signature::from_filename(&filename) {
                        Some(sig) => {
                            signatures.insert(sig);
                        }
                        None => {
                            tracing::warn!(
                                "Unparseable package filename in {}: {}",
                                repo,
                                filename
                            );
                        }
                    }
                }
            }

            tracing::debug!("Mirror repo {}: {} packages", repo, signatures.len());
            repos.insert(repo, signatures);
        }

        Ok(Self {
            root: root.to_path_buf(),
            repos,
        })
    }

    /// An empty state rooted at `root` (used when repositories are created
    /// on first download).
    pub fn empty(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            repos: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Repository names currently present in the mirror.
    pub fn repo_names(&self) -> Vec<String> {
        self.repos.keys().cloned().collect()
    }

    /// Whether this exact signature is present for the repo.
    pub fn contains(&self, repo: &str, sig: &Signature) -> bool {
        self.repos
            .get(repo)
            .map(|set| set.contains(sig))
            .unwrap_or(false)
    }

    /// Whether any build of `name`+`arch` is present for the repo.
    pub fn has_name_arch(&self, repo: &str, sig: &Signature) -> bool {
        self.repos
            .get(repo)
            .map(|set| set.iter().any(|s| s.name_arch() == sig.name_arch()))
            .unwrap_or(false)
    }

    /// All signatures present for a repo.
    pub fn packages(&self, repo: &str) -> BTreeSet<Signature> {
        self.repos.get(repo).cloned().unwrap_or_default()
    }

    /// Record a downloaded package.
    pub fn insert(&mut self, repo: &str, sig: Signature) {
        self.repos.entry(repo.to_string()).or_default().insert(sig);
    }

    /// Record a removed package.
    pub fn remove(&mut self, repo: &str, sig: &Signature) -> bool {
        self.repos
            .get_mut(repo)
            .map(|set| set.remove(sig))
            .unwrap_or(false)
    }

    /// Directory the repo's package files live in.
    pub fn packages_dir(&self, repo: &str) -> PathBuf {
        self.root.join(repo).join(PACKAGES_SUBDIR)
    }

    /// Repository root directory (where metadata is generated).
    pub fn repo_dir(&self, repo: &str) -> PathBuf {
        self.root.join(repo)
    }

    /// On-disk path of one package file.
    pub fn package_path(&self, repo: &str, sig: &Signature) -> PathBuf {
        self.packages_dir(repo).join(sig.filename())
    }

    /// Total packages across all repos.
    pub fn total_packages(&self) -> usize {
        self.repos.values().map(|set| set.len()).sum()
    }
}
