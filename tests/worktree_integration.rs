mod common;

use std::sync::Arc;

use pair_review::gitio::CommandGitClient;
use pair_review::worktree::{FALLBACK_REMOTE, WorktreeManager};
use tempfile::TempDir;

use common::{publish_pr, run_git, setup_remote_pair};

fn manager(config_root: &TempDir) -> WorktreeManager {
    WorktreeManager::new(
        config_root.path().join("worktrees"),
        config_root.path().join("repos"),
        Arc::new(CommandGitClient),
    )
}

fn source_for(pair: &common::RemotePair) -> pair_review::worktree::SourceRepo {
    pair_review::worktree::SourceRepo {
        main_root: pair.clone.path().to_path_buf(),
        worktree_source: None,
        newly_discovered: false,
    }
}

#[test]
fn test_create_for_pr_checks_out_head() {
    let pair = setup_remote_pair();
    let (_base, head) = publish_pr(&pair, 42, "feature", &[("src/new.js", "let x = 1;\n")]);
    let config_root = TempDir::new().unwrap();
    let mgr = manager(&config_root);

    let path = mgr
        .create_for_pr("acme", "widget", 42, "origin", "main", &head, &source_for(&pair))
        .unwrap();

    assert!(path.ends_with("acme-widget-42"));
    assert!(path.join("src/new.js").exists());
    let actual = run_git(&path, &["rev-parse", "HEAD"]);
    assert_eq!(actual.trim(), head);
}

#[test]
fn test_create_for_pr_replaces_stale_worktree() {
    let pair = setup_remote_pair();
    let (_base, head) = publish_pr(&pair, 7, "feature", &[("f.js", "one\n")]);
    let config_root = TempDir::new().unwrap();
    let mgr = manager(&config_root);
    let source = source_for(&pair);

    let first = mgr
        .create_for_pr("acme", "widget", 7, "origin", "main", &head, &source)
        .unwrap();
    // Second run over the same target must succeed and land on the same head
    let second = mgr
        .create_for_pr("acme", "widget", 7, "origin", "main", &head, &source)
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(run_git(&second, &["rev-parse", "HEAD"]).trim(), head);
}

#[test]
fn test_create_for_pr_divergent_head_is_not_fatal() {
    let pair = setup_remote_pair();
    let (_base, _head) = publish_pr(&pair, 9, "feature", &[("f.js", "one\n")]);
    let config_root = TempDir::new().unwrap();
    let mgr = manager(&config_root);

    // An expected head that no longer matches only logs a warning
    let path = mgr
        .create_for_pr(
            "acme",
            "widget",
            9,
            "origin",
            "main",
            "0000000000000000000000000000000000000000",
            &source_for(&pair),
        )
        .unwrap();
    assert!(path.exists());
}

#[test]
fn test_diff_and_changed_files_between_revisions() {
    let pair = setup_remote_pair();
    let (base, head) = publish_pr(
        &pair,
        3,
        "feature",
        &[("src/new.js", "let x = 1;\nlet y = 2;\n")],
    );
    let config_root = TempDir::new().unwrap();
    let mgr = manager(&config_root);
    let path = mgr
        .create_for_pr("acme", "widget", 3, "origin", "main", &head, &source_for(&pair))
        .unwrap();

    let diff = mgr.diff(&path, &base, &head).unwrap();
    assert!(diff.contains("src/new.js"));
    assert!(diff.contains("+let x = 1;"));

    let changed = mgr.changed_files(&path, &base, &head).unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].path, "src/new.js");
    assert_eq!(changed[0].additions, 2);
    assert!(!changed[0].binary);
}

#[test]
fn test_resolve_remote_matches_url_variants() {
    let pair = setup_remote_pair();
    let config_root = TempDir::new().unwrap();
    let mgr = manager(&config_root);
    let root = pair.clone.path();
    let origin_url = pair.bare.path().to_string_lossy().to_string();

    // Exact URL resolves to the existing remote regardless of case or .git
    let remote = mgr
        .resolve_remote_for_repo(root, &origin_url, &origin_url)
        .unwrap();
    assert_eq!(remote, "origin");

    let with_suffix = format!("{origin_url}.git");
    let remote = mgr
        .resolve_remote_for_repo(root, &with_suffix, &with_suffix)
        .unwrap();
    assert_eq!(remote, "origin");
}

#[test]
fn test_resolve_remote_falls_back_to_dedicated_remote() {
    let pair = setup_remote_pair();
    let config_root = TempDir::new().unwrap();
    let mgr = manager(&config_root);
    let root = pair.clone.path();

    let remote = mgr
        .resolve_remote_for_repo(
            root,
            "https://github.com/other/repo.git",
            "git@github.com:other/repo.git",
        )
        .unwrap();
    assert_eq!(remote, FALLBACK_REMOTE);
    let remotes = run_git(root, &["remote", "-v"]);
    assert!(remotes.contains(FALLBACK_REMOTE));

    // Re-resolving another repo re-points the same remote instead of adding one
    let remote = mgr
        .resolve_remote_for_repo(
            root,
            "https://github.com/third/repo.git",
            "git@github.com:third/repo.git",
        )
        .unwrap();
    assert_eq!(remote, FALLBACK_REMOTE);
    let remotes = run_git(root, &["remote", "get-url", FALLBACK_REMOTE]);
    assert!(remotes.contains("third/repo"));
}

#[test]
fn test_sparse_expansion_covers_changed_dirs() {
    let pair = setup_remote_pair();
    // Seed main with two directories so sparse-checkout has something to hide
    std::fs::create_dir_all(pair.clone.path().join("lib")).unwrap();
    std::fs::write(pair.clone.path().join("lib/util.js"), "x\n").unwrap();
    run_git(pair.clone.path(), &["add", "."]);
    run_git(pair.clone.path(), &["commit", "-m", "add lib"]);
    run_git(pair.clone.path(), &["push", "origin", "main"]);

    let (base, head) = publish_pr(&pair, 5, "feature", &[("lib/new.js", "y\n")]);
    let config_root = TempDir::new().unwrap();
    let mgr = manager(&config_root);
    let path = mgr
        .create_for_pr("acme", "widget", 5, "origin", "main", &head, &source_for(&pair))
        .unwrap();

    // Restrict the worktree to the repo root, then expand for the PR
    run_git(&path, &["sparse-checkout", "init", "--cone"]);
    assert!(!path.join("lib/new.js").exists());

    let changed = mgr.changed_files(&path, &base, &head).unwrap();
    mgr.ensure_pr_directories_checked_out(&path, &changed)
        .unwrap();
    assert!(path.join("lib/new.js").exists());
}

#[test]
fn test_local_diff_includes_untracked_files() {
    let repo = common::setup_local_repo();
    let mgr = manager(&TempDir::new().unwrap());

    std::fs::write(repo.path().join("a.js"), "const a = 2;\n").unwrap();
    std::fs::write(repo.path().join("brand_new.js"), "fresh\n").unwrap();

    let diff = mgr.local_diff(repo.path()).unwrap();
    assert!(diff.contains("-const a = 1;"));
    assert!(diff.contains("+const a = 2;"));
    assert!(diff.contains("brand_new.js"));
    assert!(diff.contains("+fresh"));

    // Idempotent over the same tree state
    let again = mgr.local_diff(repo.path()).unwrap();
    assert_eq!(diff, again);
}

#[test]
fn test_remove_worktree() {
    let pair = setup_remote_pair();
    let (_base, head) = publish_pr(&pair, 11, "feature", &[("f.js", "z\n")]);
    let config_root = TempDir::new().unwrap();
    let mgr = manager(&config_root);
    let path = mgr
        .create_for_pr("acme", "widget", 11, "origin", "main", &head, &source_for(&pair))
        .unwrap();
    assert!(path.exists());

    mgr.remove(pair.clone.path(), &path);
    assert!(!path.exists());
}

#[test]
fn test_line_count() {
    let pair = setup_remote_pair();
    let (_base, head) = publish_pr(&pair, 13, "feature", &[("three.txt", "a\nb\nc\n")]);
    let config_root = TempDir::new().unwrap();
    let mgr = manager(&config_root);
    let path = mgr
        .create_for_pr("acme", "widget", 13, "origin", "main", &head, &source_for(&pair))
        .unwrap();

    assert_eq!(mgr.line_count(&path, "three.txt"), 3);
    assert_eq!(mgr.line_count(&path, "missing.txt"), -1);
}
