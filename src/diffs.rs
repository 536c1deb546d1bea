#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffLineKind {
    Context,
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffLine {
    pub kind: DiffLineKind,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: u64,
    pub old_count: u64,
    pub new_start: u64,
    pub new_count: u64,
    pub lines: Vec<DiffLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffFile {
    /// Post-image path (pre-image path for deletions).
    pub path: String,
    pub binary: bool,
    pub hunks: Vec<Hunk>,
}

/// Parse `@@ -a[,b] +c[,d] @@`; counts default to 1 when omitted.
fn parse_hunk_header(line: &str) -> Option<(u64, u64, u64, u64)> {
    let rest = line.strip_prefix("@@ -")?;
    let (old_part, rest) = rest.split_once(" +")?;
    let new_part = rest.split_once(" @@").map(|(n, _)| n)?;

    let parse_range = |part: &str| -> Option<(u64, u64)> {
        match part.split_once(',') {
            Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
            None => Some((part.parse().ok()?, 1)),
        }
    };
    let (old_start, old_count) = parse_range(old_part)?;
    let (new_start, new_count) = parse_range(new_part)?;
    Some((old_start, old_count, new_start, new_count))
}

fn strip_diff_path(token: &str) -> Option<String> {
    let token = token.trim();
    if token == "/dev/null" {
        return None;
    }
    let token = token
        .strip_prefix("a/")
        .or_else(|| token.strip_prefix("b/"))
        .unwrap_or(token);
    Some(token.to_string())
}

/// Parse a unified diff into per-file hunks, preserving the declared file
/// order. Iteration is over `lines()`, so a trailing newline never produces
/// a phantom empty context line.
pub fn parse_unified_diff(diff: &str) -> Vec<DiffFile> {
    let mut files: Vec<DiffFile> = Vec::new();
    let mut current: Option<DiffFile> = None;
    let mut old_path: Option<String> = None;

    for line in diff.lines() {
        if line.starts_with("diff --git ") {
            if let Some(file) = current.take() {
                files.push(file);
            }
            old_path = None;
            current = Some(DiffFile {
                path: String::new(),
                binary: false,
                hunks: vec![],
            });
            continue;
        }
        let Some(file) = current.as_mut() else {
            continue;
        };

        if let Some(rest) = line.strip_prefix("--- ") {
            old_path = strip_diff_path(rest);
            continue;
        }
        if let Some(rest) = line.strip_prefix("+++ ") {
            file.path = strip_diff_path(rest)
                .or_else(|| old_path.clone())
                .unwrap_or_default();
            continue;
        }
        if line.starts_with("Binary files ") && line.ends_with(" differ") {
            file.binary = true;
            continue;
        }
        if let Some((old_start, old_count, new_start, new_count)) = parse_hunk_header(line) {
            file.hunks.push(Hunk {
                old_start,
                old_count,
                new_start,
                new_count,
                lines: vec![],
            });
            continue;
        }
        if let Some(hunk) = file.hunks.last_mut() {
            if line == r"\ No newline at end of file" {
                continue;
            }
            let (kind, content) = match line.as_bytes().first() {
                Some(b'+') => (DiffLineKind::Added, &line[1..]),
                Some(b'-') => (DiffLineKind::Removed, &line[1..]),
                Some(b' ') => (DiffLineKind::Context, &line[1..]),
                // Some tools emit empty context lines with the marker stripped
                None => (DiffLineKind::Context, ""),
                _ => continue,
            };
            hunk.lines.push(DiffLine {
                kind,
                content: content.to_string(),
            });
        }
    }
    if let Some(file) = current.take() {
        files.push(file);
    }
    files
}

/// File paths in the order the diff declares them.
pub fn file_order(diff: &str) -> Vec<String> {
    parse_unified_diff(diff)
        .into_iter()
        .map(|f| f.path)
        .collect()
}
