use serde::{Deserialize, Serialize};

use crate::diffs::{self, DiffLineKind};
use crate::error::{Error, Result};
use crate::model::{Comment, Side};

/// Hard limit on inline comments per submission.
pub const MAX_COMMENTS_PER_REVIEW: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewEvent {
    Approve,
    RequestChanges,
    Comment,
    Draft,
}

impl ReviewEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewEvent::Approve => "APPROVE",
            ReviewEvent::RequestChanges => "REQUEST_CHANGES",
            ReviewEvent::Comment => "COMMENT",
            ReviewEvent::Draft => "DRAFT",
        }
    }
}

/// What to do when a session holds more comments than one submission allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    Split,
    Refuse,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PayloadComment {
    pub path: String,
    /// Offset into the unified diff, when the anchor line appears in it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    /// Fallback anchoring for lines outside the diff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReviewPayload {
    pub event: ReviewEvent,
    pub body: String,
    pub comments: Vec<PayloadComment>,
}

fn coerce_side(side: Side) -> String {
    match side {
        Side::Old => "LEFT".to_string(),
        Side::New => "RIGHT".to_string(),
    }
}

/// Diff position of `(file, line, side)`: the number of lines below the
/// file's first hunk header, hunk headers after the first included.
pub fn diff_position(diff: &str, file: &str, line: u64, side: Side) -> Option<u64> {
    let parsed = diffs::parse_unified_diff(diff);
    let diff_file = parsed.iter().find(|f| f.path == file)?;

    let mut position: u64 = 0;
    for (index, hunk) in diff_file.hunks.iter().enumerate() {
        if index > 0 {
            position += 1; // the @@ header itself counts
        }
        let mut old_line = hunk.old_start;
        let mut new_line = hunk.new_start;
        for diff_line in &hunk.lines {
            position += 1;
            let matches = match (side, diff_line.kind) {
                (Side::New, DiffLineKind::Added) | (Side::New, DiffLineKind::Context) => {
                    new_line == line
                }
                (Side::Old, DiffLineKind::Removed) | (Side::Old, DiffLineKind::Context) => {
                    old_line == line
                }
                _ => false,
            };
            if matches {
                return Some(position);
            }
            match diff_line.kind {
                DiffLineKind::Context => {
                    old_line += 1;
                    new_line += 1;
                }
                DiffLineKind::Added => new_line += 1,
                DiffLineKind::Removed => old_line += 1,
            }
        }
    }
    None
}

fn to_payload_comment(comment: &Comment, diff: &str) -> PayloadComment {
    let anchor = comment.line_end.or(comment.line_start);
    let position = anchor.and_then(|line| diff_position(diff, &comment.file, line, comment.side));
    match position {
        Some(position) => PayloadComment {
            path: comment.file.clone(),
            position: Some(position),
            line: None,
            side: None,
            body: comment.body.clone(),
        },
        None => PayloadComment {
            path: comment.file.clone(),
            position: None,
            line: anchor,
            side: anchor.map(|_| coerce_side(comment.side)),
            body: comment.body.clone(),
        },
    }
}

/// Build the outgoing review payload(s) from a session's live comments.
///
/// Pure: reads nothing but its arguments, writes nothing. Soft-deleted
/// comments are excluded. With more than [`MAX_COMMENTS_PER_REVIEW`]
/// comments the result is split into several payloads or refused, per
/// `policy`; only the first payload carries the review event and body, the
/// rest are plain comment batches.
pub fn assemble(
    event: ReviewEvent,
    body: &str,
    comments: &[Comment],
    diff: &str,
    policy: OverflowPolicy,
) -> Result<Vec<ReviewPayload>> {
    let live: Vec<PayloadComment> = comments
        .iter()
        .filter(|c| !c.deleted)
        .map(|c| to_payload_comment(c, diff))
        .collect();

    if live.len() > MAX_COMMENTS_PER_REVIEW && policy == OverflowPolicy::Refuse {
        return Err(Error::Assemble(format!(
            "{} comments exceed the {MAX_COMMENTS_PER_REVIEW}-comment submission limit",
            live.len()
        )));
    }

    if live.is_empty() {
        return Ok(vec![ReviewPayload {
            event,
            body: body.to_string(),
            comments: vec![],
        }]);
    }

    let payloads = live
        .chunks(MAX_COMMENTS_PER_REVIEW)
        .enumerate()
        .map(|(index, chunk)| ReviewPayload {
            event: if index == 0 { event } else { ReviewEvent::Comment },
            body: if index == 0 { body.to_string() } else { String::new() },
            comments: chunk.to_vec(),
        })
        .collect();
    Ok(payloads)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str = "\
diff --git a/a.js b/a.js
--- a/a.js
+++ b/a.js
@@ -1,3 +1,4 @@
 const a = 1;
-const b = 2;
+const b = 3;
+const c = 4;
 export default a;
@@ -10,2 +11,2 @@
 function f() {
-  return 1;
+  return 2;
 }
";

    fn comment(file: &str, line: Option<u64>, side: Side, body: &str) -> Comment {
        Comment {
            id: "c".into(),
            session_id: "s".into(),
            file: file.into(),
            line_start: line,
            line_end: line,
            side,
            body: body.into(),
            author: "dev".into(),
            parent_suggestion_id: None,
            created_at: 0,
            updated_at: 0,
            deleted: false,
        }
    }

    #[test]
    fn test_position_first_line_of_first_hunk() {
        // " const a = 1;" is the first line under the first @@ header
        assert_eq!(diff_position(DIFF, "a.js", 1, Side::New), Some(1));
    }

    #[test]
    fn test_position_added_line() {
        // "+const b = 3;" is new line 2, third line under the header
        assert_eq!(diff_position(DIFF, "a.js", 2, Side::New), Some(3));
    }

    #[test]
    fn test_position_removed_line_on_old_side() {
        // "-const b = 2;" is old line 2, second line under the header
        assert_eq!(diff_position(DIFF, "a.js", 2, Side::Old), Some(2));
    }

    #[test]
    fn test_position_counts_second_hunk_header() {
        // Second hunk: header at position 6, " function f() {" (new line 11) at 7
        assert_eq!(diff_position(DIFF, "a.js", 11, Side::New), Some(7));
    }

    #[test]
    fn test_position_unmapped_line_is_none() {
        assert_eq!(diff_position(DIFF, "a.js", 500, Side::New), None);
        assert_eq!(diff_position(DIFF, "other.js", 1, Side::New), None);
    }

    #[test]
    fn test_assemble_uses_position_when_mapped() {
        let comments = vec![comment("a.js", Some(2), Side::New, "why 3?")];
        let payloads = assemble(
            ReviewEvent::Comment,
            "overall",
            &comments,
            DIFF,
            OverflowPolicy::Refuse,
        )
        .unwrap();
        assert_eq!(payloads.len(), 1);
        let c = &payloads[0].comments[0];
        assert_eq!(c.position, Some(3));
        assert_eq!(c.line, None);
        assert_eq!(c.side, None);
    }

    #[test]
    fn test_assemble_falls_back_to_line_and_side() {
        let comments = vec![comment("a.js", Some(500), Side::Old, "out of diff")];
        let payloads = assemble(
            ReviewEvent::Comment,
            "",
            &comments,
            DIFF,
            OverflowPolicy::Refuse,
        )
        .unwrap();
        let c = &payloads[0].comments[0];
        assert_eq!(c.position, None);
        assert_eq!(c.line, Some(500));
        assert_eq!(c.side.as_deref(), Some("LEFT"));
    }

    #[test]
    fn test_assemble_excludes_deleted_comments() {
        let mut deleted = comment("a.js", Some(1), Side::New, "gone");
        deleted.deleted = true;
        let payloads = assemble(
            ReviewEvent::Approve,
            "lgtm",
            &[deleted],
            DIFF,
            OverflowPolicy::Refuse,
        )
        .unwrap();
        assert!(payloads[0].comments.is_empty());
        assert_eq!(payloads[0].event, ReviewEvent::Approve);
    }

    #[test]
    fn test_assemble_refuses_overflow() {
        let comments: Vec<Comment> = (0..60)
            .map(|i| comment("a.js", Some(1), Side::New, &format!("c{i}")))
            .collect();
        let err = assemble(
            ReviewEvent::Comment,
            "",
            &comments,
            DIFF,
            OverflowPolicy::Refuse,
        )
        .unwrap_err();
        assert!(err.to_string().contains("50-comment"));
    }

    #[test]
    fn test_assemble_splits_overflow() {
        let comments: Vec<Comment> = (0..60)
            .map(|i| comment("a.js", Some(1), Side::New, &format!("c{i}")))
            .collect();
        let payloads = assemble(
            ReviewEvent::RequestChanges,
            "see inline",
            &comments,
            DIFF,
            OverflowPolicy::Split,
        )
        .unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].comments.len(), 50);
        assert_eq!(payloads[1].comments.len(), 10);
        // Only the first payload carries the event and summary
        assert_eq!(payloads[0].event, ReviewEvent::RequestChanges);
        assert_eq!(payloads[0].body, "see inline");
        assert_eq!(payloads[1].event, ReviewEvent::Comment);
        assert_eq!(payloads[1].body, "");
    }

    #[test]
    fn test_file_level_comment_has_no_anchor() {
        let c = comment("a.js", None, Side::New, "overall file note");
        let payloads = assemble(
            ReviewEvent::Comment,
            "",
            &[c],
            DIFF,
            OverflowPolicy::Refuse,
        )
        .unwrap();
        let pc = &payloads[0].comments[0];
        assert_eq!(pc.position, None);
        assert_eq!(pc.line, None);
        assert_eq!(pc.side, None);
    }

    #[test]
    fn test_event_serialization() {
        assert_eq!(ReviewEvent::RequestChanges.as_str(), "REQUEST_CHANGES");
        let json = serde_json::to_string(&ReviewEvent::Approve).unwrap();
        assert_eq!(json, "\"APPROVE\"");
    }
}
