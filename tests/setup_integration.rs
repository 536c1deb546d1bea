mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pair_review::assemble::ReviewPayload;
use pair_review::config::Config;
use pair_review::council::Tier;
use pair_review::error::{Error, Result};
use pair_review::gitio::CommandGitClient;
use pair_review::progress::{ProgressBroker, ProgressEvent};
use pair_review::setup::{SetupOrchestrator, SetupOutcome};
use pair_review::store::Store;
use pair_review::vcsapi::{RemotePr, VcsApiClient};
use pair_review::worktree::WorktreeManager;
use tempfile::TempDir;

use common::{publish_pr, setup_remote_pair};

struct FakeVcs {
    pr: RemotePr,
}

#[async_trait]
impl VcsApiClient for FakeVcs {
    async fn verify_repo(&self, _owner: &str, _repo: &str) -> Result<()> {
        Ok(())
    }

    async fn fetch_pr(&self, _owner: &str, _repo: &str, _number: u64) -> Result<RemotePr> {
        Ok(self.pr.clone())
    }

    async fn submit_review(
        &self,
        _owner: &str,
        _repo: &str,
        _number: u64,
        _payload: &ReviewPayload,
    ) -> Result<u64> {
        Err(Error::Internal("not used in setup tests".into()))
    }
}

struct Harness {
    _config_root: TempDir,
    store: Arc<Store>,
    progress: Arc<ProgressBroker>,
    setup: Arc<SetupOrchestrator>,
}

fn harness(pr: RemotePr) -> Harness {
    let config_root = TempDir::new().unwrap();
    let config = Arc::new(Config {
        config_dir: config_root.path().to_path_buf(),
        token: Some("token".into()),
        model_tier: Tier::Balanced,
        theme: "system".into(),
        monorepo_overrides: HashMap::new(),
        max_concurrent_llm_calls: 2,
        councils: HashMap::new(),
        llm_endpoint: "http://localhost".into(),
        llm_api_key: None,
        listen: "127.0.0.1:0".into(),
    });
    let store = Arc::new(Store::open(config.store_path()).unwrap());
    let git = Arc::new(CommandGitClient);
    let worktrees = Arc::new(WorktreeManager::new(
        config.worktrees_dir(),
        config.repos_dir(),
        git.clone(),
    ));
    let progress = ProgressBroker::new(Duration::from_secs(60));
    let setup = SetupOrchestrator::new(
        config,
        Arc::clone(&store),
        worktrees,
        Arc::new(FakeVcs { pr }),
        git,
        Arc::clone(&progress),
    );
    Harness {
        _config_root: config_root,
        store,
        progress,
        setup,
    }
}

fn remote_pr(pair: &common::RemotePair, base: &str, head: &str) -> RemotePr {
    let url = pair.bare.path().to_string_lossy().to_string();
    RemotePr {
        title: "Add widgets".into(),
        description: "implements the widget".into(),
        author: "dev".into(),
        base_branch: "main".into(),
        head_branch: "feature".into(),
        base_revision: base.into(),
        head_revision: head.into(),
        clone_url: url.clone(),
        ssh_url: url,
    }
}

/// Drain the progress stream until a terminal event or the deadline.
async fn collect_events(progress: &Arc<ProgressBroker>, setup_id: &str) -> Vec<ProgressEvent> {
    let mut rx = progress.subscribe(setup_id);
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = tokio::time::sleep_until(deadline) => panic!("setup did not finish in time"),
        };
        let Some(event) = event else { break };
        let terminal = event.event == "complete" || event.event == "error";
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

fn step_transitions(events: &[ProgressEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter(|e| e.event == "step")
        .map(|e| {
            (
                e.payload["step"].as_str().unwrap().to_string(),
                e.payload["status"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_cold_start_pr_setup_event_order_and_store_state() {
    let pair = setup_remote_pair();
    let (base, head) = publish_pr(&pair, 42, "feature", &[("src/new.js", "let x = 1;\n")]);
    let h = harness(remote_pr(&pair, &base, &head));

    let outcome = h.setup.setup_pr("acme", "widget", 42);
    let SetupOutcome::Started { setup_id, session_id } = outcome else {
        panic!("expected a fresh setup to start");
    };
    assert_eq!(session_id, "pr-acme-widget-42");

    let events = collect_events(&h.progress, &setup_id).await;
    let transitions = step_transitions(&events);
    let expected: Vec<(String, String)> = [
        ("verify", "running"),
        ("verify", "completed"),
        ("fetch", "running"),
        ("fetch", "completed"),
        ("repo", "running"),
        ("repo", "completed"),
        ("worktree", "running"),
        ("worktree", "completed"),
        ("sparse", "running"),
        ("sparse", "completed"),
        ("diff", "running"),
        ("diff", "completed"),
        ("store", "running"),
        ("store", "completed"),
    ]
    .iter()
    .map(|(s, t)| (s.to_string(), t.to_string()))
    .collect();
    assert_eq!(transitions, expected);

    // The repo step reports a fresh clone on cold start
    let repo_completed = events
        .iter()
        .find(|e| e.event == "step" && e.payload["step"] == "repo" && e.payload["status"] == "completed")
        .unwrap();
    assert!(
        repo_completed.payload["message"]
            .as_str()
            .unwrap()
            .contains("cloned")
    );

    let complete = events.last().unwrap();
    assert_eq!(complete.event, "complete");
    assert_eq!(complete.payload["review_url"], "/pr/acme/widget/42");
    assert_eq!(complete.payload["title"], "Add widgets");

    // Store: one session with snapshot + worktree, and a registered location
    let record = h.store.get_session("pr-acme-widget-42").unwrap();
    let snapshot = record.snapshot.unwrap();
    assert_eq!(snapshot.title, "Add widgets");
    assert!(snapshot.unified_diff.contains("src/new.js"));
    assert_eq!(snapshot.changed_files.len(), 1);
    assert!(record.worktree.unwrap().path.exists());
    assert_eq!(h.store.list_sessions().len(), 1);
    assert!(h.store.get_local_path("acme", "widget").is_some());
}

#[tokio::test]
async fn test_completed_setup_returns_existing() {
    let pair = setup_remote_pair();
    let (base, head) = publish_pr(&pair, 42, "feature", &[("f.js", "x\n")]);
    let h = harness(remote_pr(&pair, &base, &head));

    let SetupOutcome::Started { setup_id, .. } = h.setup.setup_pr("acme", "widget", 42) else {
        panic!("expected setup to start");
    };
    collect_events(&h.progress, &setup_id).await;

    match h.setup.setup_pr("acme", "widget", 42) {
        SetupOutcome::Existing { review_url, .. } => {
            assert_eq!(review_url, "/pr/acme/widget/42");
        }
        SetupOutcome::Started { .. } => panic!("fully set-up session must short-circuit"),
    }
}

#[tokio::test]
async fn test_resetup_after_worktree_loss_reruns_setup() {
    let pair = setup_remote_pair();
    let (base, head) = publish_pr(&pair, 42, "feature", &[("f.js", "x\n")]);
    let h = harness(remote_pr(&pair, &base, &head));

    let SetupOutcome::Started { setup_id, session_id } = h.setup.setup_pr("acme", "widget", 42)
    else {
        panic!("expected setup to start");
    };
    collect_events(&h.progress, &setup_id).await;

    // Snapshot present but the worktree row is gone: setup must re-run
    h.store.remove_worktree(&session_id).unwrap();
    let SetupOutcome::Started { setup_id, .. } = h.setup.setup_pr("acme", "widget", 42) else {
        panic!("missing worktree must re-run setup, not return existing");
    };
    collect_events(&h.progress, &setup_id).await;

    let record = h.store.get_session(&session_id).unwrap();
    assert!(record.worktree.is_some());
}

#[tokio::test]
async fn test_concurrent_pr_setups_share_one_flight() {
    let pair = setup_remote_pair();
    let (base, head) = publish_pr(&pair, 42, "feature", &[("f.js", "x\n")]);
    let h = harness(remote_pr(&pair, &base, &head));

    // On a current-thread runtime the spawned setup cannot progress between
    // these two calls, so the second must join the first
    let SetupOutcome::Started { setup_id: first, .. } = h.setup.setup_pr("acme", "widget", 42)
    else {
        panic!("expected setup to start");
    };
    let SetupOutcome::Started { setup_id: second, .. } = h.setup.setup_pr("acme", "widget", 42)
    else {
        panic!("expected to join the in-flight setup");
    };
    assert_eq!(first, second);
    collect_events(&h.progress, &first).await;
}

#[tokio::test]
async fn test_local_setup_is_idempotent_under_identity() {
    let repo = common::setup_local_repo();
    let root = common::canonical(repo.path());
    std::fs::write(root.join("a.js"), "const a = 2;\n").unwrap();

    let pair = setup_remote_pair();
    let h = harness(remote_pr(&pair, "x", "y"));

    let SetupOutcome::Started { setup_id: first, session_id: sid_one } =
        h.setup.setup_local(&root).unwrap()
    else {
        panic!("expected local setup to start");
    };
    // Same (root, head) while in flight: same setup id, same session id
    let SetupOutcome::Started { setup_id: second, session_id: sid_two } =
        h.setup.setup_local(&root).unwrap()
    else {
        panic!("expected to join the in-flight setup");
    };
    assert_eq!(first, second);
    assert_eq!(sid_one, sid_two);
    assert!(sid_one.starts_with("local-"));

    let events = collect_events(&h.progress, &first).await;
    assert_eq!(events.last().unwrap().event, "complete");

    let record = h.store.get_session(&sid_one).unwrap();
    let local = record.local_diff.unwrap();
    assert!(local.unified_diff.contains("+const a = 2;"));
    assert_eq!(h.store.list_sessions().len(), 1);
}

#[tokio::test]
async fn test_local_setup_rejects_non_repo() {
    let dir = TempDir::new().unwrap();
    let pair = setup_remote_pair();
    let h = harness(remote_pr(&pair, "x", "y"));

    let err = h.setup.setup_local(&common::canonical(dir.path())).unwrap_err();
    assert!(err.to_string().contains("not inside a git repository"));
}

#[tokio::test]
async fn test_local_setup_rejects_relative_path() {
    let pair = setup_remote_pair();
    let h = harness(remote_pr(&pair, "x", "y"));

    let err = h
        .setup
        .setup_local(std::path::Path::new("relative/path"))
        .unwrap_err();
    assert!(err.to_string().contains("absolute"));
}
