use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::{SinkExt, StreamExt, stream};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::assemble::{self, OverflowPolicy, ReviewEvent};
use crate::config::Config;
use crate::council::CouncilConfig;
use crate::error::{Error, ErrorKind};
use crate::model::{SessionKey, SessionStatus, Side, SuggestionStatus};
use crate::progress::ProgressBroker;
use crate::pubsub::{Broker, Frame};
use crate::scheduler::AnalysisScheduler;
use crate::setup::{SetupOrchestrator, SetupOutcome};
use crate::store::Store;
use crate::vcsapi::VcsApiClient;

/// Shared handles behind every route.
pub struct App {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub setup: Arc<SetupOrchestrator>,
    pub scheduler: Arc<AnalysisScheduler>,
    pub progress: Arc<ProgressBroker>,
    pub broker: Arc<Broker>,
    pub vcs: Arc<dyn VcsApiClient>,
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::Input => StatusCode::BAD_REQUEST,
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::RemoteTransient | ErrorKind::RemotePermanent => StatusCode::BAD_GATEWAY,
            ErrorKind::Corruption | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Programmer errors are logged in full, reported generically
            warn!(error = %self.0, "internal error");
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        (status, axum::Json(json!({"error": message}))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/setup/pr/{owner}/{repo}/{number}", post(setup_pr))
        .route(
            "/setup/pr/{owner}/{repo}/{number}/progress",
            get(setup_progress),
        )
        .route("/setup/local", post(setup_local))
        .route("/setup/local/progress", get(setup_progress))
        .route("/session/{id}", get(get_session).delete(delete_session))
        .route("/session/{id}/diff", get(get_diff))
        .route("/session/{id}/suggestions", get(get_suggestions))
        .route("/session/{id}/analyses/council", post(start_council))
        .route("/session/{id}/analyses/{run_id}/cancel", post(cancel_run))
        .route(
            "/session/{id}/comments",
            get(list_comments).post(create_comment),
        )
        .route(
            "/session/{id}/comments/{comment_id}",
            axum::routing::patch(update_comment).delete(delete_comment),
        )
        .route("/suggestions/{id}/adopt", post(adopt_suggestion))
        .route("/suggestions/{id}/dismiss", post(dismiss_suggestion))
        .route("/session/{id}/review", post(submit_review))
        .route("/ws", get(ws_upgrade))
        .with_state(app)
}

async fn healthz() -> impl IntoResponse {
    axum::Json(json!({"ok": true}))
}

// --- setup ---

async fn setup_pr(
    State(app): State<Arc<App>>,
    Path((owner, repo, number)): Path<(String, String, u64)>,
) -> ApiResult<Response> {
    if number == 0 {
        return Err(Error::InvalidInput("PR number must be positive".into()).into());
    }
    let outcome = app.setup.setup_pr(&owner, &repo, number);
    Ok(match outcome {
        SetupOutcome::Existing {
            review_url,
            session_id,
        } => axum::Json(json!({
            "existing": true,
            "review_url": review_url,
            "session_id": session_id,
        }))
        .into_response(),
        SetupOutcome::Started {
            setup_id,
            session_id,
        } => axum::Json(json!({"setup_id": setup_id, "session_id": session_id})).into_response(),
    })
}

#[derive(Deserialize)]
struct LocalSetupBody {
    path: PathBuf,
}

async fn setup_local(
    State(app): State<Arc<App>>,
    axum::Json(body): axum::Json<LocalSetupBody>,
) -> ApiResult<Response> {
    let outcome = app.setup.setup_local(&body.path)?;
    Ok(match outcome {
        SetupOutcome::Existing {
            review_url,
            session_id,
        } => axum::Json(json!({
            "existing": true,
            "review_url": review_url,
            "session_id": session_id,
        }))
        .into_response(),
        SetupOutcome::Started {
            setup_id,
            session_id,
        } => axum::Json(json!({"setup_id": setup_id, "session_id": session_id})).into_response(),
    })
}

#[derive(Deserialize)]
struct ProgressQuery {
    setup_id: String,
}

/// Named event stream for a setup operation: `step`, then `complete` or
/// `error`. Replays buffered events for late subscribers.
async fn setup_progress(
    State(app): State<Arc<App>>,
    Query(query): Query<ProgressQuery>,
) -> Sse<impl futures_util::Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = app.progress.subscribe(&query.setup_id);
    let stream = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let sse = Event::default()
            .event(event.event.clone())
            .data(event.payload.to_string());
        Some((Ok(sse), rx))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// --- session queries ---

async fn get_session(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let record = app
        .store
        .get_session(&id)
        .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
    Ok(axum::Json(json!({
        "session": record.session,
        "snapshot": record.snapshot,
        "worktree": record.worktree,
        "runs": record.runs,
    }))
    .into_response())
}

async fn delete_session(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    app.store.delete_session(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_diff(State(app): State<Arc<App>>, Path(id): Path<String>) -> ApiResult<Response> {
    let record = app
        .store
        .get_session(&id)
        .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
    let (diff, changed) = if let Some(snapshot) = &record.snapshot {
        (snapshot.unified_diff.clone(), snapshot.changed_files.clone())
    } else if let Some(local) = &record.local_diff {
        (local.unified_diff.clone(), local.changed_files.clone())
    } else {
        return Err(Error::NotFound(format!("session {id} has no diff")).into());
    };
    Ok(axum::Json(json!({"unified_diff": diff, "changed_files": changed})).into_response())
}

#[derive(Deserialize)]
struct SuggestionsQuery {
    status: Option<String>,
}

async fn get_suggestions(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
    Query(query): Query<SuggestionsQuery>,
) -> ApiResult<Response> {
    let status = match query.status.as_deref() {
        None => None,
        Some("active") => Some(SuggestionStatus::Active),
        Some("adopted") => Some(SuggestionStatus::Adopted),
        Some("dismissed") => Some(SuggestionStatus::Dismissed),
        Some(other) => {
            return Err(Error::InvalidInput(format!("unknown status filter: {other}")).into());
        }
    };
    let suggestions = app.store.suggestions_by_status(&id, status)?;
    Ok(axum::Json(json!({"suggestions": suggestions})).into_response())
}

// --- analysis ---

#[derive(Deserialize)]
struct CouncilBody {
    council_config: Option<serde_json::Value>,
    council_id: Option<String>,
    config_type: Option<String>,
}

async fn start_council(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
    axum::Json(body): axum::Json<CouncilBody>,
) -> ApiResult<Response> {
    let (value, config_type) = match (body.council_config, body.council_id) {
        (Some(value), _) => (value, body.config_type),
        (None, Some(council_id)) => {
            let stored = app.config.councils.get(&council_id).ok_or_else(|| {
                Error::NotFound(format!("council {council_id}"))
            })?;
            // Explicit config_type wins over the stored council's recorded type
            let config_type = body.config_type.or_else(|| Some(stored.config_type.clone()));
            (stored.config.clone(), config_type)
        }
        (None, None) => {
            return Err(
                Error::InvalidInput("council_config or council_id is required".into()).into(),
            );
        }
    };
    let council = CouncilConfig::from_value(&value, config_type.as_deref())?;
    let run_id = app.scheduler.start_run(&id, council)?;
    Ok(axum::Json(json!({"run_id": run_id})).into_response())
}

async fn cancel_run(
    State(app): State<Arc<App>>,
    Path((_id, run_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    app.scheduler.cancel(&run_id);
    Ok(StatusCode::ACCEPTED)
}

// --- comments & adoption ---

async fn list_comments(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let comments = app.store.list_comments(&id)?;
    Ok(axum::Json(json!({"comments": comments})).into_response())
}

#[derive(Deserialize)]
struct CommentBody {
    file: String,
    line_start: Option<u64>,
    line_end: Option<u64>,
    #[serde(default = "default_side")]
    side: Side,
    body: String,
    #[serde(default = "default_author")]
    author: String,
}

fn default_side() -> Side {
    Side::New
}

fn default_author() -> String {
    "reviewer".to_string()
}

async fn create_comment(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
    axum::Json(body): axum::Json<CommentBody>,
) -> ApiResult<Response> {
    let comment = app.store.add_comment(
        &id,
        body.file,
        body.line_start,
        body.line_end,
        body.side,
        body.body,
        body.author,
    )?;
    Ok(axum::Json(json!({"comment": comment})).into_response())
}

#[derive(Deserialize)]
struct CommentUpdateBody {
    body: String,
}

async fn update_comment(
    State(app): State<Arc<App>>,
    Path((_id, comment_id)): Path<(String, String)>,
    axum::Json(body): axum::Json<CommentUpdateBody>,
) -> ApiResult<Response> {
    let comment = app.store.update_comment(&comment_id, body.body)?;
    Ok(axum::Json(json!({"comment": comment})).into_response())
}

async fn delete_comment(
    State(app): State<Arc<App>>,
    Path((_id, comment_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    app.store.delete_comment(&comment_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Default)]
struct AdoptBody {
    body: Option<String>,
    #[serde(default = "default_author")]
    author: String,
}

async fn adopt_suggestion(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
    body: Option<axum::Json<AdoptBody>>,
) -> ApiResult<Response> {
    let body = body.map(|b| b.0).unwrap_or_default();
    let comment = app.store.adopt_suggestion(&id, body.body, &body.author)?;
    Ok(axum::Json(json!({"comment": comment})).into_response())
}

async fn dismiss_suggestion(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    app.store.dismiss_suggestion(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- review submission ---

#[derive(Deserialize)]
struct ReviewBody {
    event: ReviewEvent,
    #[serde(default)]
    body: String,
    /// `split` (default) or `refuse` when over the comment limit.
    #[serde(default)]
    overflow: Option<String>,
}

async fn submit_review(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
    axum::Json(body): axum::Json<ReviewBody>,
) -> ApiResult<Response> {
    let record = app
        .store
        .get_session(&id)
        .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
    let SessionKey::Pr {
        owner,
        repo,
        number,
    } = record.session.key.clone()
    else {
        return Err(
            Error::InvalidInput("local sessions cannot submit remote reviews".into()).into(),
        );
    };
    let snapshot = record
        .snapshot
        .as_ref()
        .ok_or_else(|| Error::NotFound(format!("session {id} has no snapshot")))?;
    let policy = match body.overflow.as_deref() {
        None | Some("split") => OverflowPolicy::Split,
        Some("refuse") => OverflowPolicy::Refuse,
        Some(other) => {
            return Err(Error::InvalidInput(format!("unknown overflow policy: {other}")).into());
        }
    };

    let comments = app.store.list_comments(&id)?;
    let payloads = assemble::assemble(
        body.event,
        &body.body,
        &comments,
        &snapshot.unified_diff,
        policy,
    )?;

    app.store.set_session_status(&id, SessionStatus::Submitting)?;
    let mut last_review_id = None;
    for payload in &payloads {
        match app.vcs.submit_review(&owner, &repo, number, payload).await {
            Ok(review_id) => last_review_id = Some(review_id),
            Err(e) => {
                let _ = app.store.set_session_status(&id, SessionStatus::Draft);
                return Err(e.into());
            }
        }
    }
    if let Some(review_id) = last_review_id {
        // A newer submission supersedes any earlier remote review
        app.store.set_remote_review_id(&id, review_id)?;
    }
    app.store.set_session_status(&id, SessionStatus::Submitted)?;
    Ok(axum::Json(json!({
        "submitted": payloads.len(),
        "remote_review_id": last_review_id,
    }))
    .into_response())
}

// --- pubsub over websocket ---

async fn ws_upgrade(State(app): State<Arc<App>>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| handle_ws(app, socket))
}

/// Bind one WebSocket to the broker: inbound text frames are control frames,
/// outbound frames are serialized messages. The broker closing the outbound
/// stream (slow subscriber) closes the socket.
async fn handle_ws(app: Arc<App>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(64);
    let mut outbound = app.broker.attach(frame_rx);

    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_rx.next().await {
            if let Message::Text(text) = message {
                match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => {
                        if frame_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring malformed frame"),
                }
            }
        }
    });

    while let Some(frame) = outbound.recv().await {
        let Ok(text) = serde_json::to_string(&frame) else {
            continue;
        };
        if ws_tx.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
    reader.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_review_event_deserializes_from_wire_form() {
        let body: ReviewBody =
            serde_json::from_str(r#"{"event": "REQUEST_CHANGES", "body": "fix"}"#).unwrap();
        assert_eq!(body.event, ReviewEvent::RequestChanges);
        assert_eq!(body.body, "fix");
        assert!(body.overflow.is_none());
    }

    #[test]
    fn test_comment_body_defaults() {
        let body: CommentBody =
            serde_json::from_str(r#"{"file": "a.js", "body": "hm"}"#).unwrap();
        assert_eq!(body.side, Side::New);
        assert_eq!(body.author, "reviewer");
        assert!(body.line_start.is_none());
    }
}
