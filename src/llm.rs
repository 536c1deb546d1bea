use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::council::Voice;
use crate::error::{Error, Result};
use crate::retry;

/// Thin interface to an AI provider endpoint. One call, one completion; the
/// scheduler owns prompts, timeouts above the transport, and cancellation.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, voice: &Voice, prompt: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// OpenAI-compatible chat-completions client. Providers that speak another
/// dialect sit behind their own `LlmClient` implementation.
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpLlmClient {
    pub fn new(base_url: &str, api_key: &str, request_timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn send_once(&self, voice: &Voice, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &voice.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let url = format!("{}/chat/completions", self.base_url);
        debug!(voice = %voice.id(), url = %url, "sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_request_error(&voice.id(), e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::RemoteTransient(format!("{}: body read: {e}", voice.id())))?;

        if !status.is_success() {
            return Err(classify_status(&voice.id(), status.as_u16(), &body));
        }

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            Error::RemotePermanent(format!("{}: malformed completion response: {e}", voice.id()))
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| {
                Error::RemotePermanent(format!("{}: completion had no choices", voice.id()))
            })
    }
}

fn classify_request_error(voice: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{voice}: request timed out"))
    } else if e.is_connect() {
        Error::RemoteTransient(format!("{voice}: connection failed: {e}"))
    } else {
        Error::RemoteTransient(format!("{voice}: request failed: {e}"))
    }
}

/// 408/429/5xx are transient; 401/403 are auth; other 4xx are permanent.
fn classify_status(voice: &str, status: u16, body: &str) -> Error {
    match status {
        401 | 403 => Error::Auth(format!("{voice}: provider rejected credentials ({status})")),
        408 | 429 | 500 | 502 | 503 | 504 => {
            Error::RemoteTransient(format!("{voice}: HTTP {status}: {body}"))
        }
        _ => Error::RemotePermanent(format!("{voice}: HTTP {status}: {body}")),
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, voice: &Voice, prompt: &str) -> Result<String> {
        retry::with_backoff(&format!("llm call {}", voice.id()), retry::DEFAULT_ATTEMPTS, || {
            self.send_once(voice, prompt)
        })
        .await
    }
}
