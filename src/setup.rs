use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gitio::GitClient;
use crate::model::{FileChange, LocalDiff, PrSnapshot, SessionKey, WorktreeRecord, now_epoch};
use crate::progress::ProgressBroker;
use crate::store::Store;
use crate::vcsapi::{RemotePr, VcsApiClient};
use crate::worktree::WorktreeManager;

/// Result of a setup request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Setup is running (or was already in flight); stream progress with the id.
    Started { setup_id: String, session_id: String },
    /// The session is fully materialized; nothing to do.
    Existing { review_url: String, session_id: String },
}

/// Stepwise, progress-reporting construction of review sessions.
///
/// At most one setup runs per `(kind, identity)`; concurrent callers share
/// the in-flight handle and observe the same progress stream.
pub struct SetupOrchestrator {
    config: Arc<Config>,
    store: Arc<Store>,
    worktrees: Arc<WorktreeManager>,
    vcs: Arc<dyn VcsApiClient>,
    git: Arc<dyn GitClient>,
    progress: Arc<ProgressBroker>,
    in_flight: DashMap<String, String>,
}

struct StepReporter {
    progress: Arc<ProgressBroker>,
    setup_id: String,
}

impl StepReporter {
    fn running(&self, step: &str) {
        self.emit(step, "running", "");
    }

    fn completed(&self, step: &str, message: &str) {
        self.emit(step, "completed", message);
    }

    fn emit(&self, step: &str, status: &str, message: &str) {
        self.progress.publish(
            &self.setup_id,
            "step",
            json!({"step": step, "status": status, "message": message}),
        );
    }

    /// Run one named step, reporting its transitions. The first failing step
    /// ends the stream with an `error` event.
    async fn step<T, F>(&self, step: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<(T, String)>>,
    {
        self.running(step);
        match fut.await {
            Ok((value, message)) => {
                self.completed(step, &message);
                Ok(value)
            }
            Err(e) => {
                self.emit(step, "error", &e.to_string());
                self.progress
                    .publish(&self.setup_id, "error", json!({"message": e.to_string()}));
                Err(e)
            }
        }
    }
}

impl SetupOrchestrator {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        worktrees: Arc<WorktreeManager>,
        vcs: Arc<dyn VcsApiClient>,
        git: Arc<dyn GitClient>,
        progress: Arc<ProgressBroker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            worktrees,
            vcs,
            git,
            progress,
            in_flight: DashMap::new(),
        })
    }

    /// Start (or join) setup of a PR session.
    ///
    /// Returns `Existing` only when the session, its snapshot and its
    /// worktree row are all present; a missing worktree re-runs the full
    /// sequence.
    pub fn setup_pr(self: &Arc<Self>, owner: &str, repo: &str, number: u64) -> SetupOutcome {
        let key = SessionKey::pr(owner, repo, number);
        let session_id = key.session_id();

        if let Some(record) = self.store.find_by_key(&key)
            && record.snapshot.is_some()
            && record.worktree.is_some()
        {
            return SetupOutcome::Existing {
                review_url: key.review_url(),
                session_id,
            };
        }

        let flight_key = format!("pr:{session_id}");
        let setup_id = match self.in_flight.entry(flight_key.clone()) {
            Entry::Occupied(existing) => {
                // A concurrent caller owns the setup; share its stream
                return SetupOutcome::Started {
                    setup_id: existing.get().clone(),
                    session_id,
                };
            }
            Entry::Vacant(slot) => {
                let setup_id = Uuid::new_v4().to_string();
                slot.insert(setup_id.clone());
                setup_id
            }
        };

        self.progress.register(&setup_id);
        let orchestrator = Arc::clone(self);
        let owner = owner.to_string();
        let repo = repo.to_string();
        let setup_id_for_task = setup_id.clone();
        tokio::spawn(async move {
            let result = orchestrator
                .run_pr_setup(&owner, &repo, number, &setup_id_for_task)
                .await;
            orchestrator.in_flight.remove(&flight_key);
            if let Err(e) = result {
                warn!(owner, repo, number, error = %e, "PR setup failed");
            }
        });

        SetupOutcome::Started {
            setup_id,
            session_id,
        }
    }

    async fn run_pr_setup(
        self: &Arc<Self>,
        owner: &str,
        repo: &str,
        number: u64,
        setup_id: &str,
    ) -> Result<()> {
        let reporter = StepReporter {
            progress: Arc::clone(&self.progress),
            setup_id: setup_id.to_string(),
        };
        let key = SessionKey::pr(owner, repo, number);

        reporter
            .step("verify", async {
                self.vcs.verify_repo(owner, repo).await?;
                Ok(((), format!("{owner}/{repo} is reachable")))
            })
            .await?;

        let remote_pr: RemotePr = reporter
            .step("fetch", async {
                let pr = self.vcs.fetch_pr(owner, repo, number).await?;
                let title = pr.title.clone();
                Ok((pr, title))
            })
            .await?;

        let source = reporter
            .step("repo", async {
                let source = self.worktrees.discover_source(
                    &self.config,
                    &self.store,
                    owner,
                    repo,
                    &remote_pr.clone_url,
                )?;
                let message = if source.newly_discovered {
                    format!("cloned into {}", source.main_root.display())
                } else {
                    format!("found at {}", source.main_root.display())
                };
                if let Some(ref sparse_source) = source.worktree_source {
                    info!(
                        source = %sparse_source.display(),
                        "inheriting sparse state from existing worktree"
                    );
                }
                Ok((source, message))
            })
            .await?;

        let worktree_path = reporter
            .step("worktree", async {
                let remote = self.worktrees.resolve_remote_for_repo(
                    &source.main_root,
                    &remote_pr.clone_url,
                    &remote_pr.ssh_url,
                )?;
                let path = self.worktrees.create_for_pr(
                    owner,
                    repo,
                    number,
                    &remote,
                    &remote_pr.base_branch,
                    &remote_pr.head_revision,
                    &source,
                )?;
                let message = format!("checked out at {}", path.display());
                Ok((path, message))
            })
            .await?;

        let changed_files = reporter
            .step("sparse", async {
                let changed = self.worktrees.changed_files(
                    &worktree_path,
                    &remote_pr.base_revision,
                    &remote_pr.head_revision,
                )?;
                self.worktrees
                    .ensure_pr_directories_checked_out(&worktree_path, &changed)?;
                let message = format!("{} changed files covered", changed.len());
                Ok((changed, message))
            })
            .await?;

        let diff = reporter
            .step("diff", async {
                let diff = self.worktrees.diff(
                    &worktree_path,
                    &remote_pr.base_revision,
                    &remote_pr.head_revision,
                )?;
                let message = format!("{} bytes of diff", diff.len());
                Ok((diff, message))
            })
            .await?;

        reporter
            .step("store", async {
                let session = self.store.upsert_session(&key)?;
                let snapshot = PrSnapshot {
                    title: remote_pr.title.clone(),
                    description: remote_pr.description.clone(),
                    author: remote_pr.author.clone(),
                    base_branch: remote_pr.base_branch.clone(),
                    head_branch: remote_pr.head_branch.clone(),
                    base_revision: remote_pr.base_revision.clone(),
                    head_revision: remote_pr.head_revision.clone(),
                    unified_diff: diff.clone(),
                    changed_files: changed_files.clone(),
                    fetched_at: now_epoch(),
                };
                let worktree = WorktreeRecord {
                    path: worktree_path.clone(),
                    source_branch: remote_pr.base_branch.clone(),
                    created_at: now_epoch(),
                };
                self.store
                    .store_pr_bundle(&session.id, snapshot, Some(worktree))?;

                if source.newly_discovered {
                    let prior = self.store.get_local_path(owner, repo);
                    if prior.as_deref() != Some(source.main_root.as_path()) {
                        self.store
                            .set_local_path(owner, repo, Some(source.main_root.clone()))?;
                    }
                }
                Ok(((), format!("session {}", session.id)))
            })
            .await?;

        self.progress.publish(
            setup_id,
            "complete",
            json!({"review_url": key.review_url(), "title": remote_pr.title}),
        );
        info!(owner, repo, number, "PR setup complete");
        Ok(())
    }

    /// Start (or join) setup of a local working-tree session. The review
    /// identity is deterministic in `(root, head)`, so reopening the same
    /// working state converges on the same session.
    pub fn setup_local(self: &Arc<Self>, path: &Path) -> Result<SetupOutcome> {
        // validate / git / identity run in the request path so the in-flight
        // key exists before any caller can race the same identity; their
        // progress events are emitted only once this caller owns the flight
        if !path.is_absolute() {
            return Err(Error::InvalidInput(format!(
                "path must be absolute: {}",
                path.display()
            )));
        }
        if !path.is_dir() {
            return Err(Error::InvalidInput(format!(
                "not a directory: {}",
                path.display()
            )));
        }
        let root = self
            .git
            .run(path, &["rev-parse", "--show-toplevel"])
            .map(|out| PathBuf::from(out.trim()))
            .map_err(|e| Error::InvalidInput(format!("not inside a git repository: {e}")))?;
        let head = self
            .git
            .run(&root, &["rev-parse", "HEAD"])
            .map_err(|e| Error::InvalidInput(format!("cannot resolve HEAD: {e}")))?
            .trim()
            .to_string();
        let key = SessionKey::local(&root, &head);
        let session_id = key.session_id();

        let flight_key = format!("local:{session_id}");
        let setup_id = match self.in_flight.entry(flight_key.clone()) {
            Entry::Occupied(existing) => {
                // Same (root, head) already being set up; join it
                return Ok(SetupOutcome::Started {
                    setup_id: existing.get().clone(),
                    session_id,
                });
            }
            Entry::Vacant(slot) => {
                let setup_id = Uuid::new_v4().to_string();
                slot.insert(setup_id.clone());
                setup_id
            }
        };

        self.progress.register(&setup_id);
        let reporter = StepReporter {
            progress: Arc::clone(&self.progress),
            setup_id: setup_id.clone(),
        };
        for (step, message) in [
            ("validate", path.display().to_string()),
            ("git", root.display().to_string()),
            ("identity", session_id.clone()),
        ] {
            reporter.running(step);
            reporter.completed(step, &message);
        }

        let orchestrator = Arc::clone(self);
        let task_setup_id = setup_id.clone();
        let task_session_id = session_id.clone();
        tokio::spawn(async move {
            let result = orchestrator
                .run_local_setup(&root, &key, &task_session_id, &task_setup_id)
                .await;
            orchestrator.in_flight.remove(&flight_key);
            if let Err(e) = result {
                warn!(session = task_session_id, error = %e, "local setup failed");
            }
        });

        Ok(SetupOutcome::Started {
            setup_id,
            session_id,
        })
    }

    async fn run_local_setup(
        self: &Arc<Self>,
        root: &Path,
        key: &SessionKey,
        session_id: &str,
        setup_id: &str,
    ) -> Result<()> {
        let reporter = StepReporter {
            progress: Arc::clone(&self.progress),
            setup_id: setup_id.to_string(),
        };

        let (diff, changed_files) = reporter
            .step("diff", async {
                let diff = self.worktrees.local_diff(root)?;
                let changed = changed_files_from_diff(&diff);
                let message = format!("{} changed files", changed.len());
                Ok(((diff, changed), message))
            })
            .await?;

        reporter
            .step("store", async {
                let session = self.store.upsert_session(key)?;
                self.store.store_local_diff(
                    &session.id,
                    LocalDiff {
                        unified_diff: diff.clone(),
                        changed_files: changed_files.clone(),
                        computed_at: now_epoch(),
                    },
                )?;
                Ok(((), format!("session {}", session.id)))
            })
            .await?;

        self.progress.publish(
            setup_id,
            "complete",
            json!({"review_url": key.review_url(), "title": root.display().to_string()}),
        );
        info!(session = session_id, "local setup complete");
        Ok(())
    }
}

fn changed_files_from_diff(diff: &str) -> Vec<FileChange> {
    crate::diffs::parse_unified_diff(diff)
        .into_iter()
        .map(|file| {
            let (additions, deletions) = file.hunks.iter().flat_map(|h| &h.lines).fold(
                (0u64, 0u64),
                |(add, del), line| match line.kind {
                    crate::diffs::DiffLineKind::Added => (add + 1, del),
                    crate::diffs::DiffLineKind::Removed => (add, del + 1),
                    crate::diffs::DiffLineKind::Context => (add, del),
                },
            );
            FileChange {
                path: file.path,
                additions,
                deletions,
                binary: file.binary,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_files_from_diff() {
        let diff = "\
diff --git a/a.js b/a.js
--- a/a.js
+++ b/a.js
@@ -1,2 +1,3 @@
 keep
-old
+new
+extra
";
        let files = changed_files_from_diff(diff);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "a.js");
        assert_eq!(files[0].additions, 2);
        assert_eq!(files[0].deletions, 1);
    }
}
