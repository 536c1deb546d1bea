use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::assemble::ReviewPayload;
use crate::error::{Error, Result};
use crate::retry;

/// Remote PR metadata as fetched from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePr {
    pub title: String,
    pub description: String,
    pub author: String,
    pub base_branch: String,
    pub head_branch: String,
    pub base_revision: String,
    pub head_revision: String,
    pub clone_url: String,
    pub ssh_url: String,
}

/// Interface to the remote host API. Authentication is a token supplied by
/// the caller; the core never reads credentials itself.
#[async_trait]
pub trait VcsApiClient: Send + Sync {
    /// Probe that the repository exists and the token can see it.
    async fn verify_repo(&self, owner: &str, repo: &str) -> Result<()>;

    async fn fetch_pr(&self, owner: &str, repo: &str, number: u64) -> Result<RemotePr>;

    /// Submit an outgoing review. Returns the remote review id.
    async fn submit_review(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        payload: &ReviewPayload,
    ) -> Result<u64>;
}

#[derive(Debug, Deserialize)]
struct ApiRef {
    #[serde(rename = "ref")]
    branch: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiRepo {
    clone_url: String,
    ssh_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiPullFull {
    title: String,
    #[serde(default)]
    body: Option<String>,
    user: ApiUser,
    base: ApiRefWithRepo,
    head: ApiRef,
}

#[derive(Debug, Deserialize)]
struct ApiRefWithRepo {
    #[serde(rename = "ref")]
    branch: String,
    sha: String,
    repo: ApiRepo,
}

#[derive(Debug, Deserialize)]
struct ApiReview {
    id: u64,
}

/// GitHub-REST-shaped client.
pub struct HttpVcsClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpVcsClient {
    pub fn new(base_url: &str, token: &str, request_timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent("pair-review")
            .build()
            .map_err(|e| Error::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn get(&self, path: &str) -> Result<String> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "vcs api GET");
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(classify_request_error)?;
        read_body(response).await
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<String> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "vcs api POST");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .map_err(classify_request_error)?;
        read_body(response).await
    }
}

async fn read_body(response: reqwest::Response) -> Result<String> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| Error::RemoteTransient(format!("body read: {e}")))?;
    match status {
        200..=299 => Ok(body),
        401 | 403 => Err(Error::Auth(format!("host rejected token ({status})"))),
        404 => Err(Error::NotFound(format!("remote returned 404: {body}"))),
        408 | 429 | 500 | 502 | 503 | 504 => {
            Err(Error::RemoteTransient(format!("HTTP {status}: {body}")))
        }
        _ => Err(Error::RemotePermanent(format!("HTTP {status}: {body}"))),
    }
}

fn classify_request_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout("vcs api request timed out".into())
    } else {
        Error::RemoteTransient(format!("vcs api request failed: {e}"))
    }
}

#[async_trait]
impl VcsApiClient for HttpVcsClient {
    async fn verify_repo(&self, owner: &str, repo: &str) -> Result<()> {
        let path = format!("/repos/{owner}/{repo}");
        retry::with_backoff("verify repo", retry::DEFAULT_ATTEMPTS, || self.get(&path))
            .await
            .map(|_| ())
    }

    async fn fetch_pr(&self, owner: &str, repo: &str, number: u64) -> Result<RemotePr> {
        let path = format!("/repos/{owner}/{repo}/pulls/{number}");
        let body = retry::with_backoff("fetch pr", retry::DEFAULT_ATTEMPTS, || self.get(&path))
            .await?;
        let pull: ApiPullFull = serde_json::from_str(&body)
            .map_err(|e| Error::RemotePermanent(format!("malformed pull response: {e}")))?;
        Ok(RemotePr {
            title: pull.title,
            description: pull.body.unwrap_or_default(),
            author: pull.user.login,
            base_branch: pull.base.branch,
            head_branch: pull.head.branch,
            base_revision: pull.base.sha,
            head_revision: pull.head.sha,
            clone_url: pull.base.repo.clone_url,
            ssh_url: pull.base.repo.ssh_url,
        })
    }

    async fn submit_review(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        payload: &ReviewPayload,
    ) -> Result<u64> {
        let comments: Vec<serde_json::Value> = payload
            .comments
            .iter()
            .map(|c| match c.position {
                Some(position) => json!({
                    "path": c.path,
                    "position": position,
                    "body": c.body,
                }),
                None => json!({
                    "path": c.path,
                    "line": c.line,
                    "side": c.side,
                    "body": c.body,
                }),
            })
            .collect();
        let body = json!({
            "event": payload.event.as_str(),
            "body": payload.body,
            "comments": comments,
        });
        let path = format!("/repos/{owner}/{repo}/pulls/{number}/reviews");
        let response = retry::with_backoff("submit review", retry::DEFAULT_ATTEMPTS, || {
            self.post(&path, body.clone())
        })
        .await?;
        let review: ApiReview = serde_json::from_str(&response)
            .map_err(|e| Error::RemotePermanent(format!("malformed review response: {e}")))?;
        Ok(review.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_response_parses() {
        let body = r#"{
            "title": "Add widgets",
            "body": "implements the widget",
            "user": {"login": "dev"},
            "base": {
                "ref": "main",
                "sha": "aaa111",
                "repo": {
                    "clone_url": "https://github.com/acme/widget.git",
                    "ssh_url": "git@github.com:acme/widget.git"
                }
            },
            "head": {"ref": "feature", "sha": "bbb222"}
        }"#;
        let pull: ApiPullFull = serde_json::from_str(body).unwrap();
        assert_eq!(pull.title, "Add widgets");
        assert_eq!(pull.base.branch, "main");
        assert_eq!(pull.head.sha, "bbb222");
        assert_eq!(pull.base.repo.ssh_url, "git@github.com:acme/widget.git");
    }

    #[test]
    fn test_null_body_becomes_empty_description() {
        let body = r#"{
            "title": "t",
            "body": null,
            "user": {"login": "dev"},
            "base": {"ref": "main", "sha": "a", "repo": {"clone_url": "c", "ssh_url": "s"}},
            "head": {"ref": "f", "sha": "b"}
        }"#;
        let pull: ApiPullFull = serde_json::from_str(body).unwrap();
        assert!(pull.body.is_none());
    }
}
