use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::council::{CouncilConfig, Voice};
use crate::diffs;
use crate::error::{Error, Result};
use crate::extract;
use crate::llm::LlmClient;
use crate::model::{
    AnalysisRun, RunState, SessionKey, Side, Suggestion, SuggestionStatus, SuggestionType,
    now_epoch,
};
use crate::progress::ProgressBroker;
use crate::prompt::{PromptBuilder, PromptType};
use crate::pubsub::Broker;
use crate::store::{SessionRecord, Store};
use crate::validate::{self, InvalidRangePolicy, LineCounts};

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(1800);

/// How many related files level 3 pulls in alongside the changed ones.
const RELATED_FILE_LIMIT: usize = 12;

/// Fan-out/fan-in scheduler: voices × levels, per-level consolidation,
/// cross-level orchestration. Only the final orchestrated list is persisted.
pub struct AnalysisScheduler {
    store: Arc<Store>,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptBuilder>,
    broker: Arc<Broker>,
    progress: Arc<ProgressBroker>,
    max_concurrent: usize,
    task_timeout: Duration,
    run_timeout: Duration,
    in_flight: DashMap<String, CancellationToken>,
}

/// Outcome of one voice's analysis task.
enum VoiceOutcome {
    Ok(Vec<Suggestion>),
    Err(String),
    Cancelled,
}

/// Everything a run needs from the session, resolved up front.
struct RunContext {
    session_id: String,
    title: String,
    description: String,
    custom_instructions: String,
    diff: String,
    changed_paths: Vec<String>,
    workdir: Option<PathBuf>,
}

impl RunContext {
    fn from_record(record: &SessionRecord) -> Result<Self> {
        let session = &record.session;
        if let Some(snapshot) = &record.snapshot {
            let workdir = record.worktree.as_ref().map(|w| w.path.clone());
            return Ok(Self {
                session_id: session.id.clone(),
                title: snapshot.title.clone(),
                description: snapshot.description.clone(),
                custom_instructions: session.custom_instructions.clone().unwrap_or_default(),
                diff: snapshot.unified_diff.clone(),
                changed_paths: snapshot.changed_files.iter().map(|f| f.path.clone()).collect(),
                workdir,
            });
        }
        if let Some(local) = &record.local_diff {
            let root = match &session.key {
                SessionKey::Local { root, .. } => root.clone(),
                SessionKey::Pr { .. } => {
                    return Err(Error::Internal("PR session without snapshot".into()));
                }
            };
            return Ok(Self {
                session_id: session.id.clone(),
                title: format!("Working tree at {}", root.display()),
                description: String::new(),
                custom_instructions: session.custom_instructions.clone().unwrap_or_default(),
                diff: local.unified_diff.clone(),
                changed_paths: local.changed_files.iter().map(|f| f.path.clone()).collect(),
                workdir: Some(root),
            });
        }
        Err(Error::InvalidInput(format!(
            "session {} has no diff to analyze",
            session.id
        )))
    }

    fn line_counts(&self) -> LineCounts {
        let mut counts = LineCounts::new();
        for path in &self.changed_paths {
            let count = match &self.workdir {
                Some(dir) => match std::fs::read_to_string(dir.join(path)) {
                    Ok(content) => content.lines().count() as i64,
                    Err(_) => -1,
                },
                None => -1,
            };
            counts.insert(path.clone(), count);
        }
        counts
    }

    fn changed_file_contents(&self) -> String {
        let Some(dir) = &self.workdir else {
            return String::new();
        };
        let mut out = String::new();
        for path in &self.changed_paths {
            match std::fs::read_to_string(dir.join(path)) {
                Ok(content) => {
                    out.push_str(&format!("=== {path} ===\n{content}\n"));
                }
                Err(_) => {
                    out.push_str(&format!("=== {path} === (unreadable)\n"));
                }
            }
        }
        out
    }

    /// Sibling files of the changed directories, changed files excluded.
    fn related_file_contents(&self) -> String {
        let Some(dir) = &self.workdir else {
            return String::new();
        };
        let changed: std::collections::HashSet<&str> =
            self.changed_paths.iter().map(String::as_str).collect();
        let mut dirs: Vec<PathBuf> = self
            .changed_paths
            .iter()
            .filter_map(|p| std::path::Path::new(p).parent().map(|d| d.to_path_buf()))
            .collect();
        dirs.sort();
        dirs.dedup();

        let mut out = String::new();
        let mut taken = 0usize;
        for rel_dir in dirs {
            let Ok(entries) = std::fs::read_dir(dir.join(&rel_dir)) else {
                continue;
            };
            let mut names: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            names.sort();
            for path in names {
                if taken >= RELATED_FILE_LIMIT {
                    return out;
                }
                let Ok(rel) = path.strip_prefix(dir) else { continue };
                let rel_str = rel.to_string_lossy().to_string();
                if changed.contains(rel_str.as_str()) {
                    continue;
                }
                if let Ok(content) = std::fs::read_to_string(&path) {
                    out.push_str(&format!("=== {rel_str} ===\n{content}\n"));
                    taken += 1;
                }
            }
        }
        out
    }
}

/// Per-run event publisher: one monotonically increasing sequence number,
/// fanned out to the run's PubSub topic and to the ProgressBroker so
/// subscribers joining mid-run can replay the state so far.
struct RunEvents {
    run_id: String,
    broker: Arc<Broker>,
    progress: Arc<ProgressBroker>,
    seq: AtomicU64,
}

impl RunEvents {
    fn publish(&self, event: &str, mut payload: Value) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        if let Some(map) = payload.as_object_mut() {
            map.insert("seq".into(), json!(seq));
            map.insert("event".into(), json!(event));
        }
        self.broker.publish(&format!("run:{}", self.run_id), payload.clone());
        self.progress.publish(&self.run_id, event, payload);
    }
}

impl AnalysisScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptBuilder>,
        broker: Arc<Broker>,
        progress: Arc<ProgressBroker>,
        max_concurrent: usize,
        task_timeout: Duration,
        run_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            llm,
            prompts,
            broker,
            progress,
            max_concurrent,
            task_timeout,
            run_timeout,
            in_flight: DashMap::new(),
        })
    }

    /// Kick off a council run against a session. Returns the run id; progress
    /// streams on topic `run:{run_id}`.
    pub fn start_run(self: &Arc<Self>, session_id: &str, council: CouncilConfig) -> Result<String> {
        council.validate()?;
        let record = self
            .store
            .get_session(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        let context = RunContext::from_record(&record)?;

        let run_id = Uuid::new_v4().to_string();
        let run = AnalysisRun {
            id: run_id.clone(),
            session_id: session_id.to_string(),
            council: council.clone(),
            started_at: now_epoch(),
            finished_at: None,
            state: RunState::Running,
            failure_reason: None,
            warnings: vec![],
        };
        self.store.create_run(session_id, run)?;

        let token = CancellationToken::new();
        self.in_flight.insert(run_id.clone(), token.clone());
        self.progress.register(&run_id);

        let scheduler = Arc::clone(self);
        let task_run_id = run_id.clone();
        tokio::spawn(async move {
            scheduler.drive(context, council, task_run_id, token).await;
        });
        Ok(run_id)
    }

    /// Cancel a running analysis. Idempotent; unknown ids are a no-op.
    pub fn cancel(&self, run_id: &str) {
        if let Some(token) = self.in_flight.get(run_id) {
            token.cancel();
        }
    }

    async fn drive(
        self: &Arc<Self>,
        context: RunContext,
        council: CouncilConfig,
        run_id: String,
        token: CancellationToken,
    ) {
        let events = RunEvents {
            run_id: run_id.clone(),
            broker: Arc::clone(&self.broker),
            progress: Arc::clone(&self.progress),
            seq: AtomicU64::new(0),
        };
        let session_id = context.session_id.clone();

        let outcome = tokio::time::timeout(
            self.run_timeout,
            self.execute(&context, &council, &run_id, &token, &events),
        )
        .await;

        self.in_flight.remove(&run_id);

        let (state, failure, warnings, final_count) = match outcome {
            _ if token.is_cancelled() => (RunState::Cancelled, None, vec![], 0),
            Err(_) => (
                RunState::Failed,
                Some("run deadline exceeded".to_string()),
                vec![],
                0,
            ),
            Ok(Err(e)) => (RunState::Failed, Some(e.to_string()), vec![], 0),
            Ok(Ok((suggestions, warnings))) => {
                let count = suggestions.len();
                match self
                    .store
                    .replace_final_for_run(&session_id, &run_id, suggestions)
                {
                    Ok(()) => (RunState::Done, None, warnings, count),
                    Err(e) => (RunState::Failed, Some(e.to_string()), warnings, 0),
                }
            }
        };

        if let Err(e) = self.store.finish_run(
            &session_id,
            &run_id,
            state,
            failure.clone(),
            warnings.clone(),
        ) {
            warn!(run = run_id, error = %e, "failed to record run outcome");
        }

        let state_str = match state {
            RunState::Done => "done",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
            RunState::Running => "running",
        };
        events.publish(
            "run_finished",
            json!({
                "state": state_str,
                "suggestions": final_count,
                "warnings": warnings,
                "failure_reason": failure,
            }),
        );
        info!(run = run_id, state = state_str, "analysis run finished");
    }

    /// The three stages. Returns the final ordered list plus warnings.
    async fn execute(
        self: &Arc<Self>,
        context: &RunContext,
        council: &CouncilConfig,
        run_id: &str,
        token: &CancellationToken,
        events: &RunEvents,
    ) -> Result<(Vec<Suggestion>, Vec<String>)> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let line_counts = Arc::new(context.line_counts());
        let mut warnings: Vec<String> = Vec::new();
        let mut level_outputs: Vec<(u8, Vec<Suggestion>)> = Vec::new();

        for level in council.enabled_levels() {
            if token.is_cancelled() {
                return Err(Error::Scheduler("cancelled".into()));
            }
            let voices = council.voices_for_level(level);
            events.publish("level_started", json!({"level": level, "voices": voices.len()}));

            // Stage 1: fan out every voice at this level
            let vars = self.level_vars(context, level)?;
            let mut join_set: JoinSet<(Voice, VoiceOutcome)> = JoinSet::new();
            for voice in voices.iter().cloned() {
                events.publish(
                    "voice_started",
                    json!({"level": level, "voice": voice.id()}),
                );
                let scheduler = Arc::clone(self);
                let semaphore = Arc::clone(&semaphore);
                let line_counts = Arc::clone(&line_counts);
                let token = token.clone();
                let vars = vars.clone();
                let session_id = context.session_id.clone();
                let run_id = run_id.to_string();
                join_set.spawn(async move {
                    let outcome = scheduler
                        .run_voice(
                            &voice,
                            level,
                            vars,
                            &session_id,
                            &run_id,
                            &line_counts,
                            semaphore,
                            token,
                        )
                        .await;
                    (voice, outcome)
                });
            }

            let mut successes: Vec<(String, Vec<Suggestion>)> = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                let Ok((voice, outcome)) = joined else {
                    warnings.push(format!("level {level}: a voice task panicked"));
                    continue;
                };
                match outcome {
                    VoiceOutcome::Ok(suggestions) => {
                        events.publish(
                            "voice_finished",
                            json!({
                                "level": level,
                                "voice": voice.id(),
                                "status": "ok",
                                "suggestions": suggestions.len(),
                            }),
                        );
                        successes.push((voice.id(), suggestions));
                    }
                    VoiceOutcome::Err(message) => {
                        events.publish(
                            "voice_finished",
                            json!({
                                "level": level,
                                "voice": voice.id(),
                                "status": "err",
                                "message": message,
                            }),
                        );
                        warnings.push(format!("voice {} failed: {message}", voice.id()));
                    }
                    VoiceOutcome::Cancelled => {
                        events.publish(
                            "voice_finished",
                            json!({"level": level, "voice": voice.id(), "status": "cancelled"}),
                        );
                    }
                }
            }

            if token.is_cancelled() {
                return Err(Error::Scheduler("cancelled".into()));
            }

            if successes.is_empty() {
                warnings.push(format!("level {level} skipped: every voice failed"));
                events.publish(
                    "level_finished",
                    json!({"level": level, "skipped": true, "suggestions": 0}),
                );
                continue;
            }

            // Keep deterministic input order for consolidation
            successes.sort_by(|a, b| a.0.cmp(&b.0));

            // Stage 2: consolidate when at least two voices produced output
            let consolidated = if successes.len() >= 2 {
                match self
                    .consolidate(context, council, level, &successes, &line_counts, run_id)
                    .await
                {
                    Ok(list) => list,
                    Err(e) => {
                        // Parser or provider trouble must not lose the level
                        warnings.push(format!(
                            "level {level} consolidation failed ({e}); using raw union"
                        ));
                        successes.iter().flat_map(|(_, s)| s.clone()).collect()
                    }
                }
            } else {
                successes.remove(0).1
            };

            events.publish(
                "level_finished",
                json!({"level": level, "skipped": false, "suggestions": consolidated.len()}),
            );
            level_outputs.push((level, consolidated));
        }

        if token.is_cancelled() {
            return Err(Error::Scheduler("cancelled".into()));
        }

        if level_outputs.is_empty() {
            return Err(Error::Scheduler("every enabled level failed".into()));
        }

        // Stage 3: orchestrate across levels when more than one produced output
        let mut final_list = if level_outputs.len() >= 2 {
            events.publish("orchestration_started", json!({"levels": level_outputs.len()}));
            match self
                .orchestrate(context, council, &level_outputs, &line_counts, run_id)
                .await
            {
                Ok(list) => list,
                Err(e) => {
                    warnings.push(format!("orchestration failed ({e}); using concatenation"));
                    level_outputs.iter().flat_map(|(_, s)| s.clone()).collect()
                }
            }
        } else {
            level_outputs.remove(0).1
        };

        order_suggestions(&mut final_list, &diffs::file_order(&context.diff));
        Ok((final_list, warnings))
    }

    fn level_vars(&self, context: &RunContext, level: u8) -> Result<HashMap<String, String>> {
        let mut vars = HashMap::from([
            ("diff".to_string(), context.diff.clone()),
            ("title".to_string(), context.title.clone()),
            ("description".to_string(), context.description.clone()),
            (
                "custom_instructions".to_string(),
                context.custom_instructions.clone(),
            ),
        ]);
        if level >= 2 {
            vars.insert("files".to_string(), context.changed_file_contents());
        }
        if level >= 3 {
            vars.insert("related_files".to_string(), context.related_file_contents());
        }
        Ok(vars)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_voice(
        self: &Arc<Self>,
        voice: &Voice,
        level: u8,
        vars: HashMap<String, String>,
        session_id: &str,
        run_id: &str,
        line_counts: &LineCounts,
        semaphore: Arc<Semaphore>,
        token: CancellationToken,
    ) -> VoiceOutcome {
        let Some(prompt_type) = PromptType::for_level(level) else {
            return VoiceOutcome::Err(format!("no prompt for level {level}"));
        };
        let prompt = match self.prompts.build(prompt_type, voice.tier, &vars) {
            Ok(prompt) => prompt,
            Err(e) => return VoiceOutcome::Err(format!("prompt build: {e}")),
        };

        let permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return VoiceOutcome::Err("scheduler shut down".into()),
        };

        let response = tokio::select! {
            _ = token.cancelled() => {
                drop(permit);
                return VoiceOutcome::Cancelled;
            }
            result = tokio::time::timeout(self.task_timeout, self.llm.complete(voice, &prompt)) => {
                drop(permit);
                match result {
                    Ok(Ok(text)) => text,
                    Ok(Err(e)) => return VoiceOutcome::Err(e.to_string()),
                    Err(_) => return VoiceOutcome::Err("task deadline exceeded".into()),
                }
            }
        };

        if token.is_cancelled() {
            return VoiceOutcome::Cancelled;
        }

        let value = match extract::extract(&response) {
            Ok(value) => value,
            Err(e) => return VoiceOutcome::Err(format!("extraction: {e}")),
        };
        let parsed = match parse_suggestions(&value, session_id, run_id, &voice.id()) {
            Ok(parsed) => parsed,
            Err(e) => return VoiceOutcome::Err(format!("parse: {e}")),
        };
        let validated = validate::validate(
            parsed,
            line_counts,
            InvalidRangePolicy::ConvertToFileLevel,
        );
        VoiceOutcome::Ok(validated.surviving())
    }

    async fn consolidate(
        self: &Arc<Self>,
        context: &RunContext,
        council: &CouncilConfig,
        level: u8,
        successes: &[(String, Vec<Suggestion>)],
        line_counts: &LineCounts,
        run_id: &str,
    ) -> Result<Vec<Suggestion>> {
        let union: Vec<&Suggestion> = successes.iter().flat_map(|(_, s)| s).collect();
        let vars = HashMap::from([
            (
                "suggestions".to_string(),
                serde_json::to_string_pretty(&union)
                    .map_err(|e| Error::Scheduler(format!("serialize union: {e}")))?,
            ),
            ("voice_count".to_string(), successes.len().to_string()),
        ]);
        let voice = &council.consolidation;
        let prompt = self
            .prompts
            .build(PromptType::Consolidation, voice.tier, &vars)?;
        let response = tokio::time::timeout(self.task_timeout, self.llm.complete(voice, &prompt))
            .await
            .map_err(|_| Error::Timeout("consolidation deadline exceeded".into()))??;
        let value = extract::extract(&response)
            .map_err(|e| Error::Scheduler(format!("consolidation extraction: {e}")))?;
        let merged = parse_consolidated(
            &value,
            &context.session_id,
            run_id,
            &format!("consolidation:{level}"),
        )?;
        Ok(validate::validate(merged, line_counts, InvalidRangePolicy::ConvertToFileLevel)
            .surviving())
    }

    async fn orchestrate(
        self: &Arc<Self>,
        context: &RunContext,
        council: &CouncilConfig,
        level_outputs: &[(u8, Vec<Suggestion>)],
        line_counts: &LineCounts,
        run_id: &str,
    ) -> Result<Vec<Suggestion>> {
        let mut rendered = String::new();
        for (level, suggestions) in level_outputs {
            rendered.push_str(&format!(
                "## Level {level}\n{}\n",
                serde_json::to_string_pretty(suggestions)
                    .map_err(|e| Error::Scheduler(format!("serialize level output: {e}")))?
            ));
        }
        let vars = HashMap::from([("level_outputs".to_string(), rendered)]);
        let voice = &council.consolidation;
        let prompt = self
            .prompts
            .build(PromptType::Orchestration, voice.tier, &vars)?;
        let response = tokio::time::timeout(self.task_timeout, self.llm.complete(voice, &prompt))
            .await
            .map_err(|_| Error::Timeout("orchestration deadline exceeded".into()))??;
        let value = extract::extract(&response)
            .map_err(|e| Error::Scheduler(format!("orchestration extraction: {e}")))?;
        let merged = parse_consolidated(&value, &context.session_id, run_id, "orchestration")?;
        Ok(validate::validate(merged, line_counts, InvalidRangePolicy::ConvertToFileLevel)
            .surviving())
    }
}

fn parse_side(value: Option<&Value>) -> Side {
    match value.and_then(Value::as_str) {
        Some("old") => Side::Old,
        _ => Side::New,
    }
}

fn parse_type(value: Option<&Value>) -> SuggestionType {
    value
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(SuggestionType::Suggestion)
}

fn parse_one_suggestion(
    item: &Value,
    session_id: &str,
    run_id: &str,
    voice: &str,
) -> Option<Suggestion> {
    let file = item.get("file")?.as_str()?.to_string();
    let title = item.get("title")?.as_str()?.to_string();
    let kind = parse_type(item.get("type"));
    let suggestion_text = item
        .get("suggestion_text")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(Suggestion {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        file,
        line_start: item.get("line_start").and_then(Value::as_u64),
        line_end: item.get("line_end").and_then(Value::as_u64),
        side: parse_side(item.get("side")),
        kind,
        title,
        description: item
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        suggestion_text: if kind == SuggestionType::Praise {
            None
        } else {
            suggestion_text
        },
        confidence: item
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0),
        reasoning: item
            .get("reasoning")
            .and_then(Value::as_array)
            .map(|steps| {
                steps
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        status: SuggestionStatus::Active,
        is_file_level: false,
        parent_suggestion_id: None,
        voice: voice.to_string(),
        run_id: Some(run_id.to_string()),
    })
}

/// Parse a voice's `{"suggestions": [...]}` output. Malformed entries are
/// skipped rather than failing the voice wholesale.
fn parse_suggestions(
    value: &Value,
    session_id: &str,
    run_id: &str,
    voice: &str,
) -> Result<Vec<Suggestion>> {
    let items = value
        .get("suggestions")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Scheduler("response has no suggestions array".into()))?;
    Ok(items
        .iter()
        .filter_map(|item| parse_one_suggestion(item, session_id, run_id, voice))
        .collect())
}

/// Confidence adjustment for cross-voice agreement: ≥3 voices +0.2, exactly
/// 2 +0.1, single voice unchanged, contradiction −0.1; always within [0, 1].
pub fn adjust_confidence(confidence: f64, agreement: usize, contradiction: bool) -> f64 {
    let adjusted = if contradiction {
        confidence - 0.1
    } else {
        match agreement {
            n if n >= 3 => confidence + 0.2,
            2 => confidence + 0.1,
            _ => confidence,
        }
    };
    adjusted.clamp(0.0, 1.0)
}

/// Parse consolidation/orchestration output, applying the agreement-based
/// confidence adjustment in code so the arithmetic is deterministic.
fn parse_consolidated(
    value: &Value,
    session_id: &str,
    run_id: &str,
    voice: &str,
) -> Result<Vec<Suggestion>> {
    let items = value
        .get("suggestions")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Scheduler("response has no suggestions array".into()))?;
    Ok(items
        .iter()
        .filter_map(|item| {
            let mut suggestion = parse_one_suggestion(item, session_id, run_id, voice)?;
            let agreement = item
                .get("agreement")
                .and_then(Value::as_array)
                .map(|a| a.len())
                .unwrap_or(1);
            let contradiction = item
                .get("contradiction")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            suggestion.confidence =
                adjust_confidence(suggestion.confidence, agreement, contradiction);
            // Keep the strongest-agreeing voice as the stable tie-break id
            if let Some(first) = item
                .get("agreement")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .and_then(Value::as_str)
            {
                suggestion.voice = first.to_string();
            }
            Some(suggestion)
        })
        .collect())
}

/// Deterministic final ordering: diff file order, then line (file-level
/// first), then confidence descending, then voice id, then title.
pub fn order_suggestions(suggestions: &mut [Suggestion], file_order: &[String]) {
    let rank: HashMap<&str, usize> = file_order
        .iter()
        .enumerate()
        .map(|(index, file)| (file.as_str(), index))
        .collect();
    suggestions.sort_by(|a, b| {
        let rank_a = rank.get(a.file.as_str()).copied().unwrap_or(usize::MAX);
        let rank_b = rank.get(b.file.as_str()).copied().unwrap_or(usize::MAX);
        rank_a
            .cmp(&rank_b)
            .then_with(|| a.file.cmp(&b.file))
            .then_with(|| a.line_start.unwrap_or(0).cmp(&b.line_start.unwrap_or(0)))
            .then_with(|| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.voice.cmp(&b.voice))
            .then_with(|| a.title.cmp(&b.title))
    });
}
