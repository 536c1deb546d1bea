use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gitio::GitClient;
use crate::model::FileChange;
use crate::store::Store;

/// Name of the dedicated remote added when no configured remote matches the
/// PR's repository.
pub const FALLBACK_REMOTE: &str = "pair-review-base";

/// Where a PR's source repository was found, and how to use it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRepo {
    /// Repository root used for ref writes (fetches, worktree registration).
    pub main_root: PathBuf,
    /// Set when discovery landed on an existing worktree with an inherited
    /// sparse configuration; new worktrees inherit its sparse state.
    pub worktree_source: Option<PathBuf>,
    /// True when the location was not previously known (candidate for
    /// registration in the store).
    pub newly_discovered: bool,
}

/// Normalize a git remote URL for equality: strips a trailing `.git`,
/// case-folds, and reduces `https://host/path`, `ssh://user@host/path` and
/// `user@host:path` to the same `host/path` form.
pub fn normalize_git_url(url: &str) -> String {
    let mut url = url.trim().to_lowercase();
    if let Some(stripped) = url.strip_suffix(".git") {
        url = stripped.to_string();
    }
    let url = url.trim_end_matches('/');

    // scheme://[user@]host/path
    if let Some((_, rest)) = url.split_once("://") {
        let rest = rest.split_once('@').map(|(_, r)| r).unwrap_or(rest);
        return rest.to_string();
    }
    // user@host:path
    if let Some((_, rest)) = url.split_once('@') {
        return rest.replacen(':', "/", 1);
    }
    url.to_string()
}

/// Materializes isolated working copies per PR and produces their diffs.
///
/// Filesystem layout: `<worktrees_dir>/<owner>-<repo>-<n>` for checkouts and
/// `<repos_dir>/<owner>/<repo>` for cached blob-filtered clones.
pub struct WorktreeManager {
    worktrees_dir: PathBuf,
    repos_dir: PathBuf,
    git: Arc<dyn GitClient>,
}

impl WorktreeManager {
    pub fn new(worktrees_dir: PathBuf, repos_dir: PathBuf, git: Arc<dyn GitClient>) -> Self {
        Self {
            worktrees_dir,
            repos_dir,
            git,
        }
    }

    pub fn worktree_path(&self, owner: &str, repo: &str, number: u64) -> PathBuf {
        self.worktrees_dir
            .join(format!("{}-{}-{number}", owner.to_lowercase(), repo.to_lowercase()))
    }

    fn cached_clone_path(&self, owner: &str, repo: &str) -> PathBuf {
        self.repos_dir.join(owner.to_lowercase()).join(repo.to_lowercase())
    }

    /// Tiered discovery of the PR's source repository, highest priority
    /// first: config monorepo override, registered location (verified, and
    /// cleared when stale), an existing worktree for the same repo, then a
    /// cached blob-filtered clone (created on demand).
    pub fn discover_source(
        &self,
        config: &Config,
        store: &Store,
        owner: &str,
        repo: &str,
        clone_url: &str,
    ) -> Result<SourceRepo> {
        // 1. Explicit monorepo override
        if let Some(path) = config.monorepo_override(owner, repo) {
            debug!(owner, repo, path = %path.display(), "using monorepo override");
            return Ok(SourceRepo {
                main_root: path.clone(),
                worktree_source: None,
                newly_discovered: false,
            });
        }

        // 2. Registered repo location, verified with a trivial query
        if let Some(path) = store.get_local_path(owner, repo) {
            if path.is_dir() && self.git.probe(&path, &["rev-parse", "--git-dir"]) {
                debug!(owner, repo, path = %path.display(), "using registered repo location");
                return Ok(SourceRepo {
                    main_root: path,
                    worktree_source: None,
                    newly_discovered: false,
                });
            }
            warn!(owner, repo, path = %path.display(), "registered repo location is stale, clearing");
            store.set_local_path(owner, repo, None)?;
        }

        // 3. An existing worktree for the same repo: derive its parent root
        if let Some(source) = self.find_worktree_source(owner, repo)? {
            return Ok(source);
        }

        // 4. Cached bare-ish clone, created on demand
        let cached = self.cached_clone_path(owner, repo);
        if cached.is_dir() && self.git.probe(&cached, &["rev-parse", "--git-dir"]) {
            return Ok(SourceRepo {
                main_root: cached,
                worktree_source: None,
                newly_discovered: true,
            });
        }
        info!(owner, repo, "no local copy found, cloning");
        if let Some(parent) = cached.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Worktree(format!("failed to create clone dir: {e}")))?;
        }
        self.git
            .run(
                self.repos_dir.as_path(),
                &[
                    "clone",
                    "--filter=blob:none",
                    "--no-checkout",
                    clone_url,
                    &cached.to_string_lossy(),
                ],
            )
            .map_err(|e| Error::Worktree(format!("clone of {clone_url} failed: {e}")))?;
        Ok(SourceRepo {
            main_root: cached,
            worktree_source: None,
            newly_discovered: true,
        })
    }

    /// Look for any existing worktree of `<owner>-<repo>-*` and derive the
    /// repository root it belongs to.
    fn find_worktree_source(&self, owner: &str, repo: &str) -> Result<Option<SourceRepo>> {
        let prefix = format!("{}-{}-", owner.to_lowercase(), repo.to_lowercase());
        let Ok(entries) = std::fs::read_dir(&self.worktrees_dir) else {
            return Ok(None);
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) || !entry.path().is_dir() {
                continue;
            }
            let worktree = entry.path();
            let Ok(common_dir) = self
                .git
                .run(&worktree, &["rev-parse", "--path-format=absolute", "--git-common-dir"])
            else {
                continue;
            };
            let common_dir = PathBuf::from(common_dir.trim());
            let Some(main_root) = common_dir.parent().map(Path::to_path_buf) else {
                continue;
            };
            let sparse = self.is_sparse(&worktree);
            debug!(
                owner,
                repo,
                worktree = %worktree.display(),
                root = %main_root.display(),
                sparse,
                "derived source repo from existing worktree"
            );
            return Ok(Some(SourceRepo {
                main_root,
                worktree_source: sparse.then_some(worktree),
                newly_discovered: true,
            }));
        }
        Ok(None)
    }

    fn is_sparse(&self, worktree: &Path) -> bool {
        self.git
            .run(worktree, &["config", "--get", "core.sparseCheckout"])
            .map(|out| out.trim() == "true")
            .unwrap_or(false)
    }

    /// Materialize the PR checkout. Steps: clear a stale worktree at the
    /// target, fetch the base branch (forced on conflict), create a worktree
    /// anchored at the remote base (forced when already registered), fetch
    /// the PR head ref into a private local ref and check it out, verify
    /// HEAD. Any failure triggers best-effort cleanup before surfacing.
    #[allow(clippy::too_many_arguments)]
    pub fn create_for_pr(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        remote: &str,
        base_branch: &str,
        head_revision: &str,
        source: &SourceRepo,
    ) -> Result<PathBuf> {
        let path = self.worktree_path(owner, repo, number);
        let root = &source.main_root;

        std::fs::create_dir_all(&self.worktrees_dir)
            .map_err(|e| Error::Worktree(format!("failed to create worktrees dir: {e}")))?;

        // 1. A stale checkout at the target is removed, VCS-assisted first
        if path.exists() {
            debug!(path = %path.display(), "removing stale worktree");
            let path_str = path.to_string_lossy();
            if self
                .git
                .run(root, &["worktree", "remove", "--force", &path_str])
                .is_err()
            {
                std::fs::remove_dir_all(&path)
                    .map_err(|e| Error::Worktree(format!("failed to clear {path_str}: {e}")))?;
                let _ = self.git.run(root, &["worktree", "prune"]);
            }
        }

        let result =
            self.create_for_pr_inner(number, remote, base_branch, head_revision, source, &path);
        if result.is_err() {
            // Best-effort cleanup so a retry starts clean
            let _ = self
                .git
                .run(root, &["worktree", "remove", "--force", &path.to_string_lossy()]);
            let _ = std::fs::remove_dir_all(&path);
            let _ = self.git.run(root, &["worktree", "prune"]);
        }
        result.map(|()| path)
    }

    fn create_for_pr_inner(
        &self,
        number: u64,
        remote: &str,
        base_branch: &str,
        head_revision: &str,
        source: &SourceRepo,
        path: &Path,
    ) -> Result<()> {
        let root = &source.main_root;

        // 2. Fetch the base branch; a conflicting ref update is forced through
        if let Err(e) = self.git.run(root, &["fetch", remote, base_branch]) {
            warn!(error = %e, "base fetch failed, retrying with forced ref update");
            let forced = format!("+refs/heads/{base_branch}:refs/remotes/{remote}/{base_branch}");
            self.git
                .run(root, &["fetch", remote, &forced])
                .map_err(|e| Error::Worktree(format!("fetch of {base_branch} failed: {e}")))?;
        }

        // 3. Worktree anchored at the remote base; "already registered" is forced
        let anchor = format!("{remote}/{base_branch}");
        let path_str = path.to_string_lossy();
        if let Err(e) = self
            .git
            .run(root, &["worktree", "add", "--detach", &path_str, &anchor])
        {
            if e.to_string().contains("already registered") {
                self.git
                    .run(
                        root,
                        &["worktree", "add", "--force", "--detach", &path_str, &anchor],
                    )
                    .map_err(|e| Error::Worktree(format!("worktree add failed: {e}")))?;
            } else {
                return Err(Error::Worktree(format!("worktree add failed: {e}")));
            }
        }

        // 4. PR head via the canonical pull-request ref into a private ref
        let local_ref = format!("refs/pair-review/pr-{number}");
        let refspec = format!("+pull/{number}/head:{local_ref}");
        self.git
            .run(root, &["fetch", remote, &refspec])
            .map_err(|e| Error::Worktree(format!("fetch of PR head failed: {e}")))?;
        self.git
            .run(path, &["checkout", "--detach", &local_ref])
            .map_err(|e| Error::Worktree(format!("checkout of PR head failed: {e}")))?;

        // 5. Divergence from the snapshot is logged, not fatal
        let head = self
            .git
            .run(path, &["rev-parse", "HEAD"])
            .map(|out| out.trim().to_string())
            .unwrap_or_default();
        if head != head_revision {
            warn!(
                expected = head_revision,
                actual = %head,
                "worktree HEAD diverges from PR snapshot"
            );
        }

        info!(path = %path.display(), pr = number, "created PR worktree");
        Ok(())
    }

    /// Expand a partial checkout to cover every directory the PR touches.
    /// Must run before diffing so the diff reads real file contents.
    pub fn ensure_pr_directories_checked_out(
        &self,
        worktree: &Path,
        changed_files: &[FileChange],
    ) -> Result<()> {
        if !self.is_sparse(worktree) {
            return Ok(());
        }
        let dirs: BTreeSet<String> = changed_files
            .iter()
            .filter_map(|f| {
                Path::new(&f.path)
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(|p| p.to_string_lossy().to_string())
            })
            .collect();
        if dirs.is_empty() {
            return Ok(());
        }
        let mut args = vec!["sparse-checkout", "add"];
        let dir_refs: Vec<&str> = dirs.iter().map(String::as_str).collect();
        args.extend(dir_refs);
        self.git
            .run(worktree, &args)
            .map_err(|e| Error::Worktree(format!("sparse-checkout expansion failed: {e}")))?;
        info!(worktree = %worktree.display(), dirs = dirs.len(), "expanded sparse checkout");
        Ok(())
    }

    /// Unified diff between the snapshot's revisions (SHAs, not branch
    /// names), with three lines of context.
    pub fn diff(&self, worktree: &Path, base_revision: &str, head_revision: &str) -> Result<String> {
        let range = format!("{base_revision}..{head_revision}");
        self.git
            .run(worktree, &["diff", "-U3", &range])
            .map_err(|e| Error::Worktree(format!("diff failed: {e}")))
    }

    pub fn changed_files(
        &self,
        worktree: &Path,
        base_revision: &str,
        head_revision: &str,
    ) -> Result<Vec<FileChange>> {
        let range = format!("{base_revision}..{head_revision}");
        let output = self
            .git
            .run(worktree, &["diff", "--numstat", &range])
            .map_err(|e| Error::Worktree(format!("numstat failed: {e}")))?;
        Ok(parse_numstat(&output))
    }

    /// Working-tree diff plus untracked files, for local sessions.
    /// Idempotent: repeated calls over the same tree yield the same text.
    pub fn local_diff(&self, root: &Path) -> Result<String> {
        let mut diff = self
            .git
            .run(root, &["diff", "-U3", "HEAD"])
            .map_err(|e| Error::Worktree(format!("local diff failed: {e}")))?;
        let untracked = self
            .git
            .run(root, &["ls-files", "--others", "--exclude-standard"])
            .unwrap_or_default();
        let mut files: Vec<&str> = untracked.lines().filter(|l| !l.is_empty()).collect();
        files.sort_unstable();
        for file in files {
            // no-index diffs exit 1 when the files differ
            if let Ok(file_diff) = self.git.run_with_ok_codes(
                root,
                &["diff", "-U3", "--no-index", "/dev/null", file],
                &[0, 1],
            ) {
                diff.push_str(&file_diff);
            }
        }
        Ok(diff)
    }

    /// Find the configured remote matching the PR repository, insensitive to
    /// `.git` suffixes, case, and ssh/https spelling. Falls back to a
    /// dedicated [`FALLBACK_REMOTE`] that is added or re-pointed on demand.
    pub fn resolve_remote_for_repo(
        &self,
        repo_root: &Path,
        clone_url: &str,
        ssh_url: &str,
    ) -> Result<String> {
        let wanted_https = normalize_git_url(clone_url);
        let wanted_ssh = normalize_git_url(ssh_url);

        let output = self
            .git
            .run(repo_root, &["remote", "-v"])
            .map_err(|e| Error::Worktree(format!("remote listing failed: {e}")))?;
        for line in output.lines() {
            let mut parts = line.split_whitespace();
            let (Some(name), Some(url)) = (parts.next(), parts.next()) else {
                continue;
            };
            let normalized = normalize_git_url(url);
            if normalized == wanted_https || normalized == wanted_ssh {
                return Ok(name.to_string());
            }
        }

        // No match: own a dedicated remote rather than touching the user's
        let has_fallback = output
            .lines()
            .any(|l| l.split_whitespace().next() == Some(FALLBACK_REMOTE));
        if has_fallback {
            self.git
                .run(repo_root, &["remote", "set-url", FALLBACK_REMOTE, clone_url])
                .map_err(|e| Error::Worktree(format!("remote set-url failed: {e}")))?;
        } else {
            self.git
                .run(repo_root, &["remote", "add", FALLBACK_REMOTE, clone_url])
                .map_err(|e| Error::Worktree(format!("remote add failed: {e}")))?;
        }
        Ok(FALLBACK_REMOTE.to_string())
    }

    /// Remove a worktree and unregister it. Failures are swallowed; the
    /// caller cannot do better than retrying the same cleanup.
    pub fn remove(&self, source_root: &Path, worktree: &Path) {
        let path_str = worktree.to_string_lossy();
        if self
            .git
            .run(source_root, &["worktree", "remove", "--force", &path_str])
            .is_err()
        {
            let _ = std::fs::remove_dir_all(worktree);
        }
        let _ = self.git.run(source_root, &["worktree", "prune"]);
        info!(path = %path_str, "removed worktree");
    }

    /// Line count of a file inside the worktree, `-1` when unreadable.
    pub fn line_count(&self, worktree: &Path, file: &str) -> i64 {
        match std::fs::read_to_string(worktree.join(file)) {
            Ok(content) => content.lines().count() as i64,
            Err(_) => -1,
        }
    }
}

fn parse_numstat(output: &str) -> Vec<FileChange> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let additions = parts.next()?.trim();
            let deletions = parts.next()?.trim();
            let path = parts.next()?.trim();
            if path.is_empty() {
                return None;
            }
            let binary = additions == "-" || deletions == "-";
            Some(FileChange {
                path: path.to_string(),
                additions: additions.parse().unwrap_or(0),
                deletions: deletions.parse().unwrap_or(0),
                binary,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitio::CommandGitClient;

    #[test]
    fn test_normalize_https_and_ssh_are_equal() {
        let https = normalize_git_url("https://github.com/Acme/Widget.git");
        let scp = normalize_git_url("git@github.com:acme/widget");
        let ssh = normalize_git_url("ssh://git@github.com/acme/widget.git");
        assert_eq!(https, "github.com/acme/widget");
        assert_eq!(https, scp);
        assert_eq!(https, ssh);
    }

    #[test]
    fn test_normalize_strips_git_suffix_and_case() {
        assert_eq!(
            normalize_git_url("HTTPS://GitHub.com/ACME/Widget.GIT"),
            "github.com/acme/widget"
        );
    }

    #[test]
    fn test_normalize_trailing_slash() {
        assert_eq!(
            normalize_git_url("https://github.com/acme/widget/"),
            "github.com/acme/widget"
        );
    }

    #[test]
    fn test_worktree_path_naming() {
        let mgr = WorktreeManager::new(
            PathBuf::from("/cfg/worktrees"),
            PathBuf::from("/cfg/repos"),
            Arc::new(CommandGitClient),
        );
        assert_eq!(
            mgr.worktree_path("Acme", "Widget", 42),
            PathBuf::from("/cfg/worktrees/acme-widget-42")
        );
    }

    #[test]
    fn test_parse_numstat() {
        let out = "3\t1\tsrc/a.js\n-\t-\tassets/logo.png\n10\t0\tREADME.md\n";
        let files = parse_numstat(out);
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].path, "src/a.js");
        assert_eq!(files[0].additions, 3);
        assert_eq!(files[0].deletions, 1);
        assert!(!files[0].binary);
        assert!(files[1].binary);
        assert_eq!(files[2].additions, 10);
    }

    #[test]
    fn test_parse_numstat_empty() {
        assert!(parse_numstat("").is_empty());
    }
}
