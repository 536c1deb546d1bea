#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

pub fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} in {} failed: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// A bare "remote" plus a clone with `origin` pointing at it, with one
/// commit on `main`.
pub struct RemotePair {
    pub bare: TempDir,
    pub clone: TempDir,
}

pub fn setup_remote_pair() -> RemotePair {
    let bare = TempDir::new().unwrap();
    run_git(bare.path(), &["init", "--bare", "-b", "main"]);

    let clone = TempDir::new().unwrap();
    run_git(clone.path(), &["init", "-b", "main"]);
    run_git(clone.path(), &["config", "user.email", "test@test.com"]);
    run_git(clone.path(), &["config", "user.name", "Test"]);
    std::fs::write(clone.path().join("README.md"), "# widget\n").unwrap();
    run_git(clone.path(), &["add", "."]);
    run_git(clone.path(), &["commit", "-m", "init"]);
    run_git(
        clone.path(),
        &["remote", "add", "origin", bare.path().to_str().unwrap()],
    );
    run_git(clone.path(), &["push", "-u", "origin", "main"]);

    RemotePair { bare, clone }
}

/// Simulate a PR against the remote: commit `files` on a branch, push it,
/// and expose it as `refs/pull/{number}/head`. Returns (base_sha, head_sha).
pub fn publish_pr(
    pair: &RemotePair,
    number: u64,
    branch: &str,
    files: &[(&str, &str)],
) -> (String, String) {
    let base_sha = run_git(pair.clone.path(), &["rev-parse", "origin/main"])
        .trim()
        .to_string();

    run_git(pair.clone.path(), &["checkout", "-b", branch]);
    for (path, content) in files {
        let full = pair.clone.path().join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, content).unwrap();
    }
    run_git(pair.clone.path(), &["add", "."]);
    run_git(pair.clone.path(), &["commit", "-m", "pr changes"]);
    let head_sha = run_git(pair.clone.path(), &["rev-parse", "HEAD"])
        .trim()
        .to_string();
    run_git(pair.clone.path(), &["push", "origin", branch]);
    run_git(pair.clone.path(), &["checkout", "main"]);

    // The canonical pull-request ref on the remote
    let pull_ref = format!("refs/pull/{number}/head");
    run_git(pair.bare.path(), &["update-ref", &pull_ref, &head_sha]);

    (base_sha, head_sha)
}

/// A local repo (no remote) with an initial commit, for local-session tests.
pub fn setup_local_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    run_git(dir.path(), &["init", "-b", "main"]);
    run_git(dir.path(), &["config", "user.email", "test@test.com"]);
    run_git(dir.path(), &["config", "user.name", "Test"]);
    std::fs::write(dir.path().join("a.js"), "const a = 1;\n").unwrap();
    run_git(dir.path(), &["add", "."]);
    run_git(dir.path(), &["commit", "-m", "init"]);
    dir
}

pub fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
