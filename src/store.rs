use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    AnalysisRun, Comment, LocalDiff, PrSnapshot, RunState, Session, SessionKey, SessionStatus,
    Side, Suggestion, SuggestionStatus, WorktreeRecord, now_epoch,
};

/// One session and everything it owns. Deleting the record is the cascade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub session: Session,
    #[serde(default)]
    pub snapshot: Option<PrSnapshot>,
    #[serde(default)]
    pub worktree: Option<WorktreeRecord>,
    #[serde(default)]
    pub local_diff: Option<LocalDiff>,
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub runs: Vec<AnalysisRun>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StoreData {
    #[serde(default)]
    pub sessions: Vec<SessionRecord>,
    /// `owner/repo` (lower-cased) → local git root, used as a discovery cache.
    #[serde(default)]
    pub repo_locations: HashMap<String, PathBuf>,
}

fn repo_key(owner: &str, repo: &str) -> String {
    format!("{}/{}", owner.to_lowercase(), repo.to_lowercase())
}

/// Transactional persistence for sessions, suggestions, comments, worktrees
/// and registered repo locations.
///
/// Writes serialize through a mutex plus an exclusive file lock; every
/// mutation re-reads the document, applies a closure, and persists with
/// write-temp/fsync/rename. An error inside the closure discards the clone,
/// which is the rollback. Readers load an `ArcSwap` snapshot and never block
/// writers.
pub struct Store {
    path: PathBuf,
    write_lock: Mutex<()>,
    snapshot: ArcSwap<StoreData>,
}

impl Store {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Store(format!("failed to create store dir: {e}")))?;
        }
        let data = Self::load_from(&path);
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            snapshot: ArcSwap::from_pointee(data),
        })
    }

    /// Read the document from disk. A corrupted file is rebuilt empty with a
    /// data-loss warning rather than taking the whole server down.
    fn load_from(path: &Path) -> StoreData {
        if !path.exists() {
            return StoreData::default();
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<StoreData>(&content) {
                Ok(data) => data,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "store unreadable, rebuilding empty (existing data is lost)"
                    );
                    StoreData::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read store, rebuilding empty");
                StoreData::default()
            }
        }
    }

    fn lock_file_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Run one transaction: load, mutate, persist, swap the read snapshot.
    /// The closure's error aborts the transaction with nothing written.
    fn modify<T>(&self, f: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Store("store writer mutex poisoned".into()))?;

        let lock = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.lock_file_path())
            .map_err(|e| Error::Store(format!("failed to open store lock: {e}")))?;
        let ret = unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_EX) };
        if ret != 0 {
            return Err(Error::Store(format!(
                "failed to acquire store lock: {}",
                std::io::Error::last_os_error()
            )));
        }

        let mut data = Self::load_from(&self.path);
        let value = f(&mut data)?;
        self.persist(&data)?;
        self.snapshot.store(Arc::new(data));
        Ok(value)
        // flock released when `lock` drops
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        use std::io::Write;

        let content = serde_json::to_string(data)
            .map_err(|e| Error::Store(format!("failed to serialize store: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp)
            .map_err(|e| Error::Store(format!("failed to create temp store file: {e}")))?;
        file.write_all(content.as_bytes())
            .map_err(|e| Error::Store(format!("failed to write temp store file: {e}")))?;
        file.sync_all()
            .map_err(|e| Error::Store(format!("failed to fsync temp store file: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Store(format!("failed to rename temp store file: {e}")))?;
        Ok(())
    }

    /// Current read snapshot. Cheap, lock-free, may trail an in-flight write.
    pub fn read(&self) -> Arc<StoreData> {
        self.snapshot.load_full()
    }

    // --- sessions ---

    /// Create or refresh the session for a key. Existing rows keep their
    /// summary, custom instructions, status and remote review id.
    pub fn upsert_session(&self, key: &SessionKey) -> Result<Session> {
        let key = key.clone();
        self.modify(move |data| {
            let now = now_epoch();
            if let Some(record) = data
                .sessions
                .iter_mut()
                .find(|r| r.session.key.matches(&key))
            {
                record.session.updated_at = now;
                return Ok(record.session.clone());
            }
            let session = Session {
                id: key.session_id(),
                key,
                status: SessionStatus::Draft,
                summary: None,
                custom_instructions: None,
                remote_review_id: None,
                created_at: now,
                updated_at: now,
            };
            data.sessions.push(SessionRecord {
                session: session.clone(),
                snapshot: None,
                worktree: None,
                local_diff: None,
                suggestions: vec![],
                comments: vec![],
                runs: vec![],
            });
            Ok(session)
        })
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionRecord> {
        self.read()
            .sessions
            .iter()
            .find(|r| r.session.id == session_id)
            .cloned()
    }

    pub fn find_by_key(&self, key: &SessionKey) -> Option<SessionRecord> {
        self.read()
            .sessions
            .iter()
            .find(|r| r.session.key.matches(key))
            .cloned()
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.read()
            .sessions
            .iter()
            .map(|r| r.session.clone())
            .collect()
    }

    /// Delete a session and everything it owns.
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        let session_id = session_id.to_string();
        self.modify(move |data| {
            let before = data.sessions.len();
            data.sessions.retain(|r| r.session.id != session_id);
            if data.sessions.len() == before {
                return Err(Error::NotFound(format!("session {session_id}")));
            }
            Ok(())
        })
    }

    pub fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let session_id = session_id.to_string();
        self.modify(move |data| {
            let record = find_session_mut(data, &session_id)?;
            record.session.status = status;
            record.session.updated_at = now_epoch();
            Ok(())
        })
    }

    pub fn set_remote_review_id(&self, session_id: &str, review_id: u64) -> Result<()> {
        let session_id = session_id.to_string();
        self.modify(move |data| {
            let record = find_session_mut(data, &session_id)?;
            record.session.remote_review_id = Some(review_id);
            record.session.updated_at = now_epoch();
            Ok(())
        })
    }

    /// Persist a fetched PR in one transaction: snapshot, session timestamp,
    /// and (when supplied) the worktree row. Any failure rolls back all three.
    pub fn store_pr_bundle(
        &self,
        session_id: &str,
        snapshot: PrSnapshot,
        worktree: Option<WorktreeRecord>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.modify(move |data| {
            let record = find_session_mut(data, &session_id)?;
            record.snapshot = Some(snapshot);
            if let Some(worktree) = worktree {
                record.worktree = Some(worktree);
            }
            record.session.updated_at = now_epoch();
            Ok(())
        })
    }

    /// Persist a local session's working-tree diff. Idempotent for the same
    /// tree state.
    pub fn store_local_diff(&self, session_id: &str, diff: LocalDiff) -> Result<()> {
        let session_id = session_id.to_string();
        self.modify(move |data| {
            let record = find_session_mut(data, &session_id)?;
            record.local_diff = Some(diff);
            record.session.updated_at = now_epoch();
            Ok(())
        })
    }

    // --- repo locations ---

    pub fn get_local_path(&self, owner: &str, repo: &str) -> Option<PathBuf> {
        self.read().repo_locations.get(&repo_key(owner, repo)).cloned()
    }

    /// Register (or clear, with `None`) the local root for a repo.
    pub fn set_local_path(&self, owner: &str, repo: &str, path: Option<PathBuf>) -> Result<()> {
        let key = repo_key(owner, repo);
        self.modify(move |data| {
            match path {
                Some(path) => {
                    data.repo_locations.insert(key, path);
                }
                None => {
                    data.repo_locations.remove(&key);
                }
            }
            Ok(())
        })
    }

    // --- worktrees ---

    pub fn record_worktree(&self, session_id: &str, worktree: WorktreeRecord) -> Result<()> {
        let session_id = session_id.to_string();
        self.modify(move |data| {
            let record = find_session_mut(data, &session_id)?;
            record.worktree = Some(worktree);
            Ok(())
        })
    }

    pub fn remove_worktree(&self, session_id: &str) -> Result<()> {
        let session_id = session_id.to_string();
        self.modify(move |data| {
            let record = find_session_mut(data, &session_id)?;
            record.worktree = None;
            Ok(())
        })
    }

    // --- suggestions ---

    /// Bulk insert. Ranges must have been validated upstream; the store only
    /// enforces the structural invariant on file-level rows.
    pub fn insert_suggestions(
        &self,
        session_id: &str,
        suggestions: Vec<Suggestion>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.modify(move |data| {
            check_suggestion_invariants(&suggestions)?;
            let record = find_session_mut(data, &session_id)?;
            record.suggestions.extend(suggestions);
            Ok(())
        })
    }

    /// Atomically replace every suggestion attributed to `run_id` with the
    /// final orchestrated list.
    pub fn replace_final_for_run(
        &self,
        session_id: &str,
        run_id: &str,
        suggestions: Vec<Suggestion>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        let run_id = run_id.to_string();
        self.modify(move |data| {
            check_suggestion_invariants(&suggestions)?;
            let record = find_session_mut(data, &session_id)?;
            record
                .suggestions
                .retain(|s| s.run_id.as_deref() != Some(run_id.as_str()));
            record.suggestions.extend(suggestions);
            Ok(())
        })
    }

    pub fn suggestions_by_status(
        &self,
        session_id: &str,
        status: Option<SuggestionStatus>,
    ) -> Result<Vec<Suggestion>> {
        let record = self
            .get_session(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        Ok(record
            .suggestions
            .into_iter()
            .filter(|s| status.is_none_or(|w| s.status == w))
            .collect())
    }

    pub fn find_suggestion(&self, suggestion_id: &str) -> Option<(String, Suggestion)> {
        let data = self.read();
        for record in &data.sessions {
            if let Some(s) = record.suggestions.iter().find(|s| s.id == suggestion_id) {
                return Some((record.session.id.clone(), s.clone()));
            }
        }
        None
    }

    /// Adopt a suggestion: flip it to adopted and create the linked comment.
    /// An explicit `body` replaces the prefilled suggestion text.
    pub fn adopt_suggestion(
        &self,
        suggestion_id: &str,
        body: Option<String>,
        author: &str,
    ) -> Result<Comment> {
        let suggestion_id = suggestion_id.to_string();
        let author = author.to_string();
        self.modify(move |data| {
            let record = data
                .sessions
                .iter_mut()
                .find(|r| r.suggestions.iter().any(|s| s.id == suggestion_id))
                .ok_or_else(|| Error::NotFound(format!("suggestion {suggestion_id}")))?;
            let session_id = record.session.id.clone();
            let suggestion = record
                .suggestions
                .iter_mut()
                .find(|s| s.id == suggestion_id)
                .ok_or_else(|| Error::NotFound(format!("suggestion {suggestion_id}")))?;
            if suggestion.status == SuggestionStatus::Adopted {
                return Err(Error::Conflict(format!(
                    "suggestion {suggestion_id} is already adopted"
                )));
            }
            suggestion.status = SuggestionStatus::Adopted;
            let body = body.unwrap_or_else(|| {
                suggestion
                    .suggestion_text
                    .clone()
                    .unwrap_or_else(|| suggestion.description.clone())
            });
            let now = now_epoch();
            let comment = Comment {
                id: Uuid::new_v4().to_string(),
                session_id,
                file: suggestion.file.clone(),
                line_start: suggestion.line_start,
                line_end: suggestion.line_end,
                side: suggestion.side,
                body,
                author,
                parent_suggestion_id: Some(suggestion.id.clone()),
                created_at: now,
                updated_at: now,
                deleted: false,
            };
            record.comments.push(comment.clone());
            Ok(comment)
        })
    }

    pub fn dismiss_suggestion(&self, suggestion_id: &str) -> Result<()> {
        let suggestion_id = suggestion_id.to_string();
        self.modify(move |data| {
            let suggestion = data
                .sessions
                .iter_mut()
                .flat_map(|r| r.suggestions.iter_mut())
                .find(|s| s.id == suggestion_id)
                .ok_or_else(|| Error::NotFound(format!("suggestion {suggestion_id}")))?;
            suggestion.status = SuggestionStatus::Dismissed;
            Ok(())
        })
    }

    // --- comments ---

    pub fn add_comment(
        &self,
        session_id: &str,
        file: String,
        line_start: Option<u64>,
        line_end: Option<u64>,
        side: Side,
        body: String,
        author: String,
    ) -> Result<Comment> {
        let session_id = session_id.to_string();
        self.modify(move |data| {
            let record = find_session_mut(data, &session_id)?;
            let now = now_epoch();
            let comment = Comment {
                id: Uuid::new_v4().to_string(),
                session_id: session_id.clone(),
                file,
                line_start,
                line_end,
                side,
                body,
                author,
                parent_suggestion_id: None,
                created_at: now,
                updated_at: now,
                deleted: false,
            };
            record.comments.push(comment.clone());
            Ok(comment)
        })
    }

    pub fn update_comment(&self, comment_id: &str, body: String) -> Result<Comment> {
        let comment_id = comment_id.to_string();
        self.modify(move |data| {
            let comment = find_comment_mut(data, &comment_id)?;
            comment.body = body;
            comment.updated_at = now_epoch();
            Ok(comment.clone())
        })
    }

    /// Soft-delete a comment. Deleting an adoption comment flips the parent
    /// suggestion back to dismissed.
    pub fn delete_comment(&self, comment_id: &str) -> Result<()> {
        let comment_id = comment_id.to_string();
        self.modify(move |data| {
            let parent = {
                let comment = find_comment_mut(data, &comment_id)?;
                comment.deleted = true;
                comment.updated_at = now_epoch();
                comment.parent_suggestion_id.clone()
            };
            if let Some(parent_id) = parent
                && let Some(suggestion) = data
                    .sessions
                    .iter_mut()
                    .flat_map(|r| r.suggestions.iter_mut())
                    .find(|s| s.id == parent_id)
            {
                suggestion.status = SuggestionStatus::Dismissed;
            }
            Ok(())
        })
    }

    pub fn list_comments(&self, session_id: &str) -> Result<Vec<Comment>> {
        let record = self
            .get_session(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        Ok(record.comments.into_iter().filter(|c| !c.deleted).collect())
    }

    // --- analysis runs ---

    pub fn create_run(&self, session_id: &str, run: AnalysisRun) -> Result<()> {
        let session_id = session_id.to_string();
        self.modify(move |data| {
            let record = find_session_mut(data, &session_id)?;
            record.runs.push(run);
            Ok(())
        })
    }

    pub fn finish_run(
        &self,
        session_id: &str,
        run_id: &str,
        state: RunState,
        failure_reason: Option<String>,
        warnings: Vec<String>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        let run_id = run_id.to_string();
        self.modify(move |data| {
            let record = find_session_mut(data, &session_id)?;
            let run = record
                .runs
                .iter_mut()
                .find(|r| r.id == run_id)
                .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
            run.state = state;
            run.finished_at = Some(now_epoch());
            run.failure_reason = failure_reason;
            run.warnings = warnings;
            Ok(())
        })
    }
}

fn find_session_mut<'a>(data: &'a mut StoreData, session_id: &str) -> Result<&'a mut SessionRecord> {
    data.sessions
        .iter_mut()
        .find(|r| r.session.id == session_id)
        .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
}

fn find_comment_mut<'a>(data: &'a mut StoreData, comment_id: &str) -> Result<&'a mut Comment> {
    data.sessions
        .iter_mut()
        .flat_map(|r| r.comments.iter_mut())
        .find(|c| c.id == comment_id)
        .ok_or_else(|| Error::NotFound(format!("comment {comment_id}")))
}

fn check_suggestion_invariants(suggestions: &[Suggestion]) -> Result<()> {
    for s in suggestions {
        if s.is_file_level && (s.line_start.is_some() || s.line_end.is_some()) {
            return Err(Error::Conflict(format!(
                "file-level suggestion '{}' carries a line range",
                s.title
            )));
        }
        if !s.is_file_level {
            match (s.line_start, s.line_end) {
                (Some(start), Some(end)) if start >= 1 && start <= end => {}
                _ => {
                    return Err(Error::Conflict(format!(
                        "suggestion '{}' has an invalid line range",
                        s.title
                    )));
                }
            }
        }
    }
    Ok(())
}
