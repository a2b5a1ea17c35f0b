//! Package signatures
//!
//! A signature is the (name, epoch, version, release, arch) tuple that
//! uniquely identifies a package build. Signatures are the key for every
//! cache entry, mirror lookup, and classification decision.

use serde::{Deserialize, Serialize};

/// The unique identity of a package build.
///
/// All fields are compared as strings; there is no numeric coercion on
/// version or release. Epoch is stored normalized (see [`normalize_epoch`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature {
    /// Package name
    pub name: String,
    /// Architecture (e.g., "x86_64", "noarch")
    pub arch: String,
    /// Epoch, normalized so a missing epoch is "0"
    pub epoch: String,
    /// Version string
    pub version: String,
    /// Release string
    pub release: String,
}

/// Normalize an epoch value. `dnf` reports a missing epoch as an empty
/// string or "(none)" depending on version; both mean epoch 0.
pub fn normalize_epoch(epoch: &str) -> String {
    match epoch.trim() {
        "" | "(none)" | "None" => "0".to_string(),
        e => e.to_string(),
    }
}

impl Signature {
    /// Create a signature, normalizing the epoch field.
    pub fn new(name: &str, epoch: &str, version: &str, release: &str, arch: &str) -> Self {
        Self {
            name: name.to_string(),
            epoch: normalize_epoch(epoch),
            version: version.to_string(),
            release: release.to_string(),
            arch: arch.to_string(),
        }
    }

    /// The package filename as stored in a repository:
    /// `name-version-release.arch.rpm`. The epoch is not part of the
    /// filename.
    pub fn filename(&self) -> String {
        format!(
            "{}-{}-{}.{}.rpm",
            self.name, self.version, self.release, self.arch
        )
    }

    /// The NEVRA form accepted by `dnf download`:
    /// `name-epoch:version-release.arch`, with the epoch omitted when zero.
    pub fn nevra(&self) -> String {
        if self.epoch == "0" {
            format!(
                "{}-{}-{}.{}",
                self.name, self.version, self.release, self.arch
            )
        } else {
            format!(
                "{}-{}:{}-{}.{}",
                self.name, self.epoch, self.version, self.release, self.arch
            )
        }
    }

    /// Parse a signature from a repository filename
    /// (`name-version-release.arch.rpm`). Package names may themselves
    /// contain dashes, so the version and release are located from the
    /// right. The epoch is not encoded in filenames and comes back as "0".
    pub fn from_filename(filename: &str) -> Option<Self> {
        let stem = filename.strip_suffix(".rpm")?;
        let (rest, arch) = stem.rsplit_once('.')?;
        let (rest, release) = rest.rsplit_once('-')?;
        let (name, version) = rest.rsplit_once('-')?;
        if name.is_empty() || version.is_empty() || release.is_empty() || arch.is_empty() {
            return None;
        }
        Some(Self::new(name, "0", version, release, arch))
    }

    /// Key identifying "some build of this package for this architecture",
    /// used to distinguish UPDATE from NEW.
    pub fn name_arch(&self) -> (&str, &str) {
        (&self.name, &self.arch)
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.nevra())
    }
}
