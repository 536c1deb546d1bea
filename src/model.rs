use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Seconds since the Unix epoch.
pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Identity of a review session: a remote PR or a local working tree.
///
/// The two forms are mutually exclusive by construction. PR keys compare
/// case-insensitively on owner/repo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionKey {
    Pr {
        owner: String,
        repo: String,
        number: u64,
    },
    Local {
        root: PathBuf,
        head: String,
    },
}

impl SessionKey {
    pub fn pr(owner: &str, repo: &str, number: u64) -> Self {
        SessionKey::Pr {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number,
        }
    }

    pub fn local(root: &Path, head: &str) -> Self {
        SessionKey::Local {
            root: root.to_path_buf(),
            head: head.to_string(),
        }
    }

    /// Deterministic session id. PR sessions get a readable slug; local
    /// sessions hash `root || head` so reopening the same working state
    /// yields the same id.
    pub fn session_id(&self) -> String {
        match self {
            SessionKey::Pr {
                owner,
                repo,
                number,
            } => format!(
                "pr-{}-{}-{number}",
                owner.to_lowercase(),
                repo.to_lowercase()
            ),
            SessionKey::Local { root, head } => {
                let mut hasher = Sha256::new();
                hasher.update(root.to_string_lossy().as_bytes());
                hasher.update(head.as_bytes());
                let digest = hasher.finalize();
                let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
                format!("local-{}", &hex[..16])
            }
        }
    }

    /// True when two keys identify the same session (PR comparison ignores case).
    pub fn matches(&self, other: &SessionKey) -> bool {
        match (self, other) {
            (
                SessionKey::Pr {
                    owner: a,
                    repo: b,
                    number: n,
                },
                SessionKey::Pr {
                    owner: c,
                    repo: d,
                    number: m,
                },
            ) => n == m && a.eq_ignore_ascii_case(c) && b.eq_ignore_ascii_case(d),
            (SessionKey::Local { root: a, head: h }, SessionKey::Local { root: b, head: i }) => {
                a == b && h == i
            }
            _ => false,
        }
    }

    /// UI path for the session, e.g. `/pr/acme/widget/42`.
    pub fn review_url(&self) -> String {
        match self {
            SessionKey::Pr {
                owner,
                repo,
                number,
            } => format!("/pr/{owner}/{repo}/{number}"),
            SessionKey::Local { .. } => format!("/local/{}", self.session_id()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Draft,
    Submitting,
    Submitted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub key: SessionKey,
    pub status: SessionStatus,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub remote_review_id: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub additions: u64,
    pub deletions: u64,
    #[serde(default)]
    pub binary: bool,
}

/// Point-in-time copy of a remote PR's metadata and diff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrSnapshot {
    pub title: String,
    pub description: String,
    pub author: String,
    pub base_branch: String,
    pub head_branch: String,
    pub base_revision: String,
    pub head_revision: String,
    pub unified_diff: String,
    pub changed_files: Vec<FileChange>,
    pub fetched_at: u64,
}

/// Working-tree diff captured for a local session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalDiff {
    pub unified_diff: String,
    pub changed_files: Vec<FileChange>,
    pub computed_at: u64,
}

/// Isolated checkout bound to one session. At most one per session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorktreeRecord {
    pub path: PathBuf,
    pub source_branch: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Old,
    New,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SuggestionType {
    Bug,
    Improvement,
    Praise,
    Suggestion,
    Design,
    Performance,
    Security,
    CodeStyle,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionStatus {
    Active,
    Adopted,
    Dismissed,
}

/// One AI finding, anchored to a file and optionally to a line range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Suggestion {
    pub id: String,
    pub session_id: String,
    pub file: String,
    #[serde(default)]
    pub line_start: Option<u64>,
    #[serde(default)]
    pub line_end: Option<u64>,
    pub side: Side,
    #[serde(rename = "type")]
    pub kind: SuggestionType,
    pub title: String,
    pub description: String,
    /// Concrete replacement text. Absent iff `kind` is praise.
    #[serde(default)]
    pub suggestion_text: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Vec<String>,
    pub status: SuggestionStatus,
    #[serde(default)]
    pub is_file_level: bool,
    #[serde(default)]
    pub parent_suggestion_id: Option<String>,
    /// Originating voice id, used as a stable ordering tie-break.
    #[serde(default)]
    pub voice: String,
    /// Analysis run that produced this suggestion, if any.
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Human comment, or one created by adopting a suggestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    pub id: String,
    pub session_id: String,
    pub file: String,
    #[serde(default)]
    pub line_start: Option<u64>,
    #[serde(default)]
    pub line_end: Option<u64>,
    pub side: Side,
    pub body: String,
    pub author: String,
    #[serde(default)]
    pub parent_suggestion_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Done,
    Failed,
    Cancelled,
}

/// One execution of the analysis pipeline against a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisRun {
    pub id: String,
    pub session_id: String,
    pub council: crate::council::CouncilConfig,
    pub started_at: u64,
    #[serde(default)]
    pub finished_at: Option<u64>,
    pub state: RunState,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}
