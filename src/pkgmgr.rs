//! External package-manager boundary
//!
//! All upstream queries and package fetches go through the system package
//! manager (`dnf` by default) as subprocesses. Every invocation carries an
//! explicit timeout; a process that exceeds it is killed and the call is
//! reported as a timeout failure.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::config::Config;
use crate::error::FetchError;
use crate::signature::Signature;

/// Queryformat used for both installed and available listings. The trailing
/// `from_repo` field is only meaningful for installed queries; available
/// queries use [`QUERYFORMAT_AVAILABLE`].
const QUERYFORMAT_INSTALLED: &str = "%{name}|%{epoch}|%{version}|%{release}|%{arch}|%{from_repo}\n";
const QUERYFORMAT_AVAILABLE: &str = "%{name}|%{epoch}|%{version}|%{release}|%{arch}\n";

/// Handle for invoking the system package manager.
pub struct PackageManager {
    program: String,
    query_timeout: Duration,
    fetch_timeout: Duration,
}

impl PackageManager {
    pub fn new(config: &Config) -> Self {
        Self {
            program: config.commands.package_manager.clone(),
            query_timeout: Duration::from_secs(config.tuning.query_timeout_secs),
            fetch_timeout: Duration::from_secs(config.tuning.fetch_timeout_secs),
        }
    }

    /// List installed packages with their source repository.
    /// Returns the raw queryformat output; parsing lives in `inventory`.
    pub fn list_installed(&self) -> Result<String, FetchError> {
        self.run(
            &[
                "repoquery",
                "--installed",
                "--quiet",
                "--queryformat",
                QUERYFORMAT_INSTALLED,
            ],
            self.query_timeout,
        )
    }

    /// List the enabled repository ids.
    pub fn list_enabled_sources(&self) -> Result<String, FetchError> {
        self.run(&["repolist", "--enabled", "--quiet"], self.query_timeout)
    }

    /// List every package signature available from a single source,
    /// excluding all others.
    pub fn list_available(&self, source: &str) -> Result<String, FetchError> {
        let enablerepo = format!("--enablerepo={source}");
        self.run(
            &[
                "repoquery",
                "--quiet",
                "--disablerepo=*",
                &enablerepo,
                "--available",
                "--queryformat",
                QUERYFORMAT_AVAILABLE,
            ],
            self.query_timeout,
        )
    }

    /// Download one package signature into `dest_dir`.
    pub fn download(&self, sig: &Signature, dest_dir: &Path) -> Result<(), FetchError> {
        let nevra = sig.nevra();
        let destdir = dest_dir.to_string_lossy().to_string();
        let output = self.run(
            &["download", "--quiet", "--destdir", &destdir, &nevra],
            self.fetch_timeout,
        );

        match output {
            Ok(_) => Ok(()),
            // dnf reports an unknown package on stderr without a distinct
            // exit code; map it to a terminal NotFound so it is not retried.
            Err(FetchError::CommandFailed { stderr, .. })
                if stderr.contains("No package") || stderr.contains("no match") =>
            {
                Err(FetchError::NotFound(nevra))
            }
            Err(e) => Err(e),
        }
    }

    /// Run the package manager with a timeout, returning stdout on success.
    fn run(&self, args: &[&str], timeout: Duration) -> Result<String, FetchError> {
        let command = format!("{} {}", self.program, args.join(" "));
        tracing::debug!("Executing: {}", command);

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FetchError::Spawn {
                command: command.clone(),
                source: e,
            })?;

        match child.wait_timeout(timeout)? {
            Some(status) => {
                let output = child.wait_with_output()?;
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

                if status.success() {
                    Ok(stdout)
                } else {
                    Err(FetchError::CommandFailed {
                        command,
                        code: status.code().unwrap_or(-1),
                        stderr: stderr.trim().to_string(),
                    })
                }
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Err(FetchError::Timeout {
                    command,
                    seconds: timeout.as_secs(),
                })
            }
        }
    }
}

impl crate::engine::Fetcher for PackageManager {
    fn fetch(&self, sig: &Signature, staging_dir: &Path) -> Result<(), FetchError> {
        self.download(sig, staging_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_queryformats_carry_all_signature_fields() {
        for qf in [QUERYFORMAT_INSTALLED, QUERYFORMAT_AVAILABLE] {
            for field in ["%{name}", "%{epoch}", "%{version}", "%{release}", "%{arch}"] {
                assert!(qf.contains(field), "{qf} missing {field}");
            }
        }
        assert!(QUERYFORMAT_INSTALLED.contains("%{from_repo}"));
    }

    #[test]
    fn test_spawn_failure_is_terminal() {
        let mut config = Config::default();
        config.commands.package_manager = "rpmirror-no-such-binary".to_string();
        let pm = PackageManager::new(&config);

        let err = pm.list_enabled_sources().unwrap_err();
        assert!(matches!(err, FetchError::Spawn { .. }));
        assert!(!err.is_retryable());
    }
}
