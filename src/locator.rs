use regex::Regex;

use crate::error::{Error, Result};
use crate::model::SessionKey;

/// Optional repo context for inputs that carry only a PR number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoContext {
    pub owner: String,
    pub repo: String,
}

/// Canonical form of a PR key: the host pull-request URL.
pub fn serialize(key: &SessionKey) -> Result<String> {
    match key {
        SessionKey::Pr {
            owner,
            repo,
            number,
        } => Ok(format!("https://github.com/{owner}/{repo}/pull/{number}")),
        SessionKey::Local { .. } => Err(Error::InvalidInput(
            "local sessions have no PR locator".into(),
        )),
    }
}

/// Parse a PR locator. Recognized forms:
///
/// - host URL: `https://github.com/{owner}/{repo}/pull/{n}` (extra path
///   segments and query strings are tolerated)
/// - Graphite-style: `https://app.graphite.dev/github/pr/{owner}/{repo}/{n}`
/// - bare number (`42` or `#42`) combined with a repo context
pub fn parse(input: &str, context: Option<&RepoContext>) -> Result<SessionKey> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("empty PR locator".into()));
    }

    let host_re =
        Regex::new(r"^https?://[^/]*github[^/]*/([^/]+)/([^/]+)/pull/(\d+)(?:[/?#].*)?$")
            .expect("static regex");
    if let Some(caps) = host_re.captures(trimmed) {
        return Ok(SessionKey::pr(&caps[1], &caps[2], parse_number(&caps[3])?));
    }

    let graphite_re =
        Regex::new(r"^https?://app\.graphite\.dev/github/pr/([^/]+)/([^/]+)/(\d+)(?:[/?#].*)?$")
            .expect("static regex");
    if let Some(caps) = graphite_re.captures(trimmed) {
        return Ok(SessionKey::pr(&caps[1], &caps[2], parse_number(&caps[3])?));
    }

    let bare = trimmed.strip_prefix('#').unwrap_or(trimmed);
    if bare.chars().all(|c| c.is_ascii_digit()) {
        let Some(ctx) = context else {
            return Err(Error::InvalidInput(format!(
                "bare PR number '{trimmed}' needs a repo context"
            )));
        };
        return Ok(SessionKey::pr(&ctx.owner, &ctx.repo, parse_number(bare)?));
    }

    Err(Error::InvalidInput(format!("unparsable PR locator: {trimmed}")))
}

fn parse_number(digits: &str) -> Result<u64> {
    let n: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidInput(format!("invalid PR number: {digits}")))?;
    if n == 0 {
        return Err(Error::InvalidInput("PR number must be positive".into()));
    }
    Ok(n)
}
