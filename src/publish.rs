//! Distribution sync
//!
//! Pushes the finished mirror tree to the shared distribution path with
//! rsync. This is a boundary wrapper only; the transfer itself is the
//! external tool's business.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::config::Config;
use crate::error::FetchError;

pub struct Publisher {
    program: String,
    timeout: Duration,
}

impl Publisher {
    pub fn new(config: &Config) -> Self {
        Self {
            program: config.commands.rsync.clone(),
            timeout: Duration::from_secs(config.tuning.publish_timeout_secs),
        }
    }

    /// Mirror the tree to `share_dir`, deleting files that no longer
    /// exist locally. The trailing slash on the source makes rsync copy
    /// directory contents rather than the directory itself.
    pub fn publish(&self, mirror_root: &Path, share_dir: &Path) -> Result<(), FetchError> {
        let source = format!("{}/", mirror_root.display());
        let dest = share_dir.display().to_string();
        let command = format!("{} -a --delete {} {}", self.program, source, dest);
        tracing::info!("Publishing mirror to {}", dest);

        let mut child = Command::new(&self.program)
            .arg("-a")
            .arg("--delete")
            .arg(&source)
            .arg(&dest)
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
