//! Repository metadata regeneration
//!
//! After the engine has settled, metadata is regenerated for exactly the
//! repositories whose contents changed (all of them on a full rebuild).
//! The generator is an external tool invoked per repository root; its
//! `repodata/` output lives beside the `packages/` subdirectory, never
//! inside it. One repository failing to regenerate never stops the rest.

use std::collections::BTreeSet;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::config::Config;
use crate::error::FetchError;
use crate::mirror::MirrorState;

pub struct MetadataGenerator {
    program: String,
    timeout: Duration,
}

impl MetadataGenerator {
    pub fn new(config: &Config) -> Self {
        Self {
            program: config.commands.metadata_tool.clone(),
            timeout: Duration::from_secs(config.tuning.regen_timeout_secs),
        }
    }

    /// Which repositories need regeneration. Empty when skipping is
    /// requested or nothing changed — regeneration cost tracks change,
    /// not mirror size.
    pub fn repos_to_update(
        changed: &BTreeSet<String>,
        all_repos: &[String],
        full_rebuild: bool,
        skip: bool,
    ) -> Vec<String> {
        if skip {
            return Vec::new();
        }
        if full_rebuild {
            let mut repos = all_repos.to_vec();
            repos.sort();
            repos.dedup();
            return repos;
        }
        changed.iter().cloned().collect()
    }

    /// Regenerate metadata for each listed repository. Returns the soft
    /// failures as (repo, reason) pairs.
    pub fn run_for(&self, mirror: &MirrorState, repos: &[String]) -> Vec<(String, String)> {
        let mut failures = Vec::new();

        for repo in repos {
            let repo_dir = mirror.repo_dir(repo);
            tracing::info!("Regenerating metadata for {}", repo);
            if let Err(e) = self.regenerate(&repo_dir) {
                tracing::warn!("Metadata regeneration failed for {}: {}", repo, e);
                failures.push((repo.clone(), e.to_string()));
            }
        }

        failures
    }

    /// Invoke the generator once for a repository directory. Idempotent
    /// on an unchanged directory.
    pub fn regenerate(&self, repo_dir: &Path) -> Result<(), FetchError> {
        let command = format!("{} --update {}", self.program, repo_dir.display());
        tracing::debug!("Executing: {}", command);

        let mut child = Command::new(&self.program)
            .arg("--update")
            .arg(repo_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FetchError::Spawn {
                command: command.clone(),
                source: e,
            })?;

        match child.wait_timeout(self.timeout)? {
            Some(status) => {
                if status.success() {
                    Ok(())
                } else {
                    let output = child.wait_with_output()?;
                    Err(FetchError::CommandFailed {
                        command,
                        code: status.code().unwrap_or(-1),
                        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    })
                }
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Err(FetchError::Timeout {
                    command,
                    seconds: self.timeout.as_secs(),
                })
            }
        }
    }
}
