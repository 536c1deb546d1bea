use serde_json::Value;

/// Upper bound on the balanced-brace scan, so runaway model output cannot
/// turn extraction into an unbounded loop.
const SCAN_LIMIT: usize = 100_000;

const PREVIEW_LEN: usize = 500;

/// Structured failure: which strategies ran, plus a bounded preview of the
/// offending input for the logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no JSON object found (tried: {})", .tried.join(", "))]
pub struct ExtractionError {
    pub tried: Vec<&'static str>,
    pub preview: String,
}

fn preview(text: &str) -> String {
    let mut end = text.len().min(PREVIEW_LEN);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Parse `candidate` and accept it only when the root is a JSON object.
fn parse_object(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

/// Bodies of markdown code fences, `json`-labelled ones first.
fn fenced_blocks(text: &str) -> Vec<(bool, String)> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let Some(label_end) = after_open.find('\n') else {
            break;
        };
        let label = after_open[..label_end].trim().to_lowercase();
        let body_start = &after_open[label_end + 1..];
        let Some(close) = body_start.find("```") else {
            break;
        };
        blocks.push((label == "json", body_start[..close].trim().to_string()));
        rest = &body_start[close + 3..];
    }
    // json-labelled fences take priority over anonymous ones
    let mut ordered: Vec<(bool, String)> = blocks
        .iter()
        .filter(|(is_json, _)| *is_json)
        .cloned()
        .collect();
    ordered.extend(
        blocks
            .into_iter()
            .filter(|(is_json, body)| !is_json && body.starts_with('{') && body.ends_with('}')),
    );
    ordered
}

fn first_to_last_brace(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Scan from the first `{` tracking brace depth (string- and escape-aware),
/// giving up after [`SCAN_LIMIT`] characters.
fn balanced_scan(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (scanned, (offset, c)) in text[start..].char_indices().enumerate() {
        if scanned >= SCAN_LIMIT {
            return None;
        }
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Recover a JSON object from arbitrary model output.
///
/// Strategies run in order and the first one yielding an object-rooted value
/// wins. Pure; never panics; total failure returns [`ExtractionError`].
pub fn extract(text: &str) -> Result<Value, ExtractionError> {
    let mut tried = Vec::new();

    tried.push("fenced");
    for (_, body) in fenced_blocks(text) {
        if let Some(value) = parse_object(&body) {
            return Ok(value);
        }
    }

    tried.push("outer-braces");
    if let Some(candidate) = first_to_last_brace(text)
        && let Some(value) = parse_object(candidate)
    {
        return Ok(value);
    }

    tried.push("balanced-scan");
    if let Some(candidate) = balanced_scan(text)
        && let Some(value) = parse_object(candidate)
    {
        return Ok(value);
    }

    tried.push("whole-text");
    if let Some(value) = parse_object(text) {
        return Ok(value);
    }

    Err(ExtractionError {
        tried,
        preview: preview(text),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_json() {
        let value = extract(r#"{"a": 1}"#).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn test_json_fence() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nHope that helps!";
        assert_eq!(extract(text).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_anonymous_fence_with_object_body() {
        let text = "```\n{\"a\": 2}\n```";
        assert_eq!(extract(text).unwrap(), json!({"a": 2}));
    }

    #[test]
    fn test_json_fence_preferred_over_anonymous() {
        let text = "```\n{\"wrong\": true}\n```\n```json\n{\"right\": true}\n```";
        assert_eq!(extract(text).unwrap(), json!({"right": true}));
    }

    #[test]
    fn test_prose_around_object() {
        let text = "The result is {\"a\": [1, 2]} as requested.";
        assert_eq!(extract(text).unwrap(), json!({"a": [1, 2]}));
    }

    #[test]
    fn test_balanced_scan_recovers_first_object() {
        // first-{ .. last-} spans both objects and fails to parse; the
        // balanced scan recovers the first complete one
        let text = "{\"a\": 1} trailing garbage with a stray }";
        assert_eq!(extract(text).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_balanced_scan_handles_braces_in_strings() {
        let text = "prefix {\"code\": \"if (x) { return; }\"} suffix with }";
        assert_eq!(
            extract(text).unwrap(),
            json!({"code": "if (x) { return; }"})
        );
    }

    #[test]
    fn test_array_root_is_rejected() {
        let err = extract("[1, 2, 3]").unwrap_err();
        assert_eq!(
            err.tried,
            vec!["fenced", "outer-braces", "balanced-scan", "whole-text"]
        );
    }

    #[test]
    fn test_failure_carries_bounded_preview() {
        let long = "x".repeat(2000);
        let err = extract(&long).unwrap_err();
        assert_eq!(err.preview.len(), 500);
        assert!(err.preview.chars().all(|c| c == 'x'));
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let text = "é".repeat(600); // 2 bytes per char
        let err = extract(&text).unwrap_err();
        assert!(err.preview.len() <= 500);
        assert!(text.starts_with(&err.preview));
    }

    #[test]
    fn test_empty_input() {
        let err = extract("").unwrap_err();
        assert!(err.preview.is_empty());
    }

    #[test]
    fn test_unterminated_object_fails_cleanly() {
        assert!(extract("{\"a\": ").is_err());
    }

    #[test]
    fn test_nested_object() {
        let text = "```json\n{\"outer\": {\"inner\": {\"deep\": true}}}\n```";
        let value = extract(text).unwrap();
        assert_eq!(value["outer"]["inner"]["deep"], json!(true));
    }

    #[test]
    fn test_runaway_input_is_bounded() {
        // An opening brace followed by a sea of text and no closing brace:
        // extraction must terminate and fail, not spin
        let mut text = String::from("{\"a\": \"");
        text.push_str(&"y".repeat(300_000));
        assert!(extract(&text).is_err());
    }
}
