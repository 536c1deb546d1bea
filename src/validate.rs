use std::collections::HashMap;

use crate::model::Suggestion;

/// What to do with a suggestion whose line range does not exist in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRangePolicy {
    ConvertToFileLevel,
    Drop,
}

/// Line count per file. `-1` means the file could not be read; such files
/// pass through unvalidated.
pub type LineCounts = HashMap<String, i64>;

#[derive(Debug, Default, PartialEq)]
pub struct Validated {
    pub valid: Vec<Suggestion>,
    pub converted: Vec<Suggestion>,
    pub dropped: Vec<Suggestion>,
}

impl Validated {
    /// Suggestions that survived, converted ones included.
    pub fn surviving(self) -> Vec<Suggestion> {
        let mut out = self.valid;
        out.extend(self.converted);
        out
    }
}

fn to_file_level(mut s: Suggestion) -> Suggestion {
    s.line_start = None;
    s.line_end = None;
    s.is_file_level = true;
    s
}

/// Partition suggestions by whether their coordinates exist in the target
/// file. Total: every input lands in exactly one of the three buckets, and
/// converted suggestions keep all non-coordinate fields untouched.
pub fn validate(
    suggestions: Vec<Suggestion>,
    line_counts: &LineCounts,
    policy: InvalidRangePolicy,
) -> Validated {
    let mut out = Validated::default();

    for mut s in suggestions {
        // Normalize a half-open range before checking bounds
        if s.line_end.is_none() {
            s.line_end = s.line_start;
        }

        // No coordinates at all: a file-level suggestion by definition
        if s.line_start.is_none() {
            out.valid.push(to_file_level(s));
            continue;
        }

        let Some(&count) = line_counts.get(&s.file) else {
            // File outside the diff scope; anchoring is handled elsewhere
            out.valid.push(s);
            continue;
        };
        if count < 0 {
            out.valid.push(s);
            continue;
        }

        let start = s.line_start.unwrap_or(0);
        let end = s.line_end.unwrap_or(0);
        let in_bounds = count > 0 && start >= 1 && end >= start && end <= count as u64;
        if in_bounds {
            s.is_file_level = false;
            out.valid.push(s);
        } else {
            match policy {
                InvalidRangePolicy::ConvertToFileLevel => out.converted.push(to_file_level(s)),
                InvalidRangePolicy::Drop => out.dropped.push(s),
            }
        }
    }

    out
}
