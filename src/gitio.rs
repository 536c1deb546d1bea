use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};

/// Abstraction over `git` execution for testability. Implementations run one
/// git invocation in a working directory and return stdout, or stderr as the
/// error detail.
pub trait GitClient: Send + Sync {
    /// Run git, accepting any exit code in `ok_codes` as success. Needed for
    /// commands like `diff --no-index`, where exit code 1 means "differences
    /// found", not failure.
    fn run_with_ok_codes(&self, dir: &Path, args: &[&str], ok_codes: &[i32]) -> Result<String>;

    fn run(&self, dir: &Path, args: &[&str]) -> Result<String> {
        self.run_with_ok_codes(dir, args, &[0])
    }

    /// Like [`run`](GitClient::run) but success/failure only.
    fn probe(&self, dir: &Path, args: &[&str]) -> bool {
        self.run(dir, args).is_ok()
    }
}

/// Real `git` CLI client.
pub struct CommandGitClient;

impl GitClient for CommandGitClient {
    fn run_with_ok_codes(&self, dir: &Path, args: &[&str], ok_codes: &[i32]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| Error::Git(format!("failed to run git: {e}")))?;

        let code = output.status.code().unwrap_or(-1);
        if ok_codes.contains(&code) {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(Error::Git(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// Verify the `git` binary is runnable. Called once at startup.
pub fn preflight() -> Result<()> {
    let output = Command::new("git")
        .arg("--version")
        .output()
        .map_err(|e| Error::Git(format!("git binary not runnable: {e}")))?;
    if !output.status.success() {
        return Err(Error::Git("git --version failed".into()));
    }
    Ok(())
}
