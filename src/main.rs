use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use pair_review::cli::Cli;
use pair_review::config::Config;
use pair_review::gitio::{self, CommandGitClient};
use pair_review::llm::HttpLlmClient;
use pair_review::progress::ProgressBroker;
use pair_review::prompt::PromptBuilder;
use pair_review::pubsub::{self, Broker};
use pair_review::scheduler::{self, AnalysisScheduler};
use pair_review::server::{self, App};
use pair_review::setup::SetupOrchestrator;
use pair_review::store::Store;
use pair_review::vcsapi::HttpVcsClient;
use pair_review::worktree::WorktreeManager;

const PROGRESS_GRACE: Duration = Duration::from_secs(60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const LLM_HTTP_TIMEOUT: Duration = Duration::from_secs(120);

fn init_logging() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn fatal(message: &str) -> ! {
    eprintln!("error: {message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    info!("pair-review starting");

    let config = match Config::load(&cli) {
        Ok(config) => Arc::new(config),
        Err(e) => fatal(&e.to_string()),
    };

    if let Err(e) = gitio::preflight() {
        fatal(&e.to_string());
    }
    if config.token.is_none() {
        warn!("no remote token configured; PR setup and review submission will fail");
    }

    let store = match Store::open(config.store_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => fatal(&e.to_string()),
    };

    let git = Arc::new(CommandGitClient);
    let worktrees = Arc::new(WorktreeManager::new(
        config.worktrees_dir(),
        config.repos_dir(),
        git.clone(),
    ));
    let progress = ProgressBroker::new(PROGRESS_GRACE);
    let broker = Broker::new(pubsub::DEFAULT_OUTBOUND_BUFFER);

    let token = config.token.clone().unwrap_or_default();
    let vcs = match HttpVcsClient::new("https://api.github.com", &token, HTTP_TIMEOUT) {
        Ok(vcs) => Arc::new(vcs),
        Err(e) => fatal(&e.to_string()),
    };
    let llm = match HttpLlmClient::new(
        &config.llm_endpoint,
        config.llm_api_key.as_deref().unwrap_or_default(),
        LLM_HTTP_TIMEOUT,
    ) {
        Ok(llm) => Arc::new(llm),
        Err(e) => fatal(&e.to_string()),
    };
    let prompts = match PromptBuilder::new() {
        Ok(prompts) => Arc::new(prompts),
        Err(e) => fatal(&e.to_string()),
    };

    let setup = SetupOrchestrator::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&worktrees),
        vcs.clone(),
        git.clone(),
        Arc::clone(&progress),
    );
    let analysis = AnalysisScheduler::new(
        Arc::clone(&store),
        llm,
        prompts,
        Arc::clone(&broker),
        Arc::clone(&progress),
        config.max_concurrent_llm_calls,
        scheduler::DEFAULT_TASK_TIMEOUT,
        scheduler::DEFAULT_RUN_TIMEOUT,
    );

    let app = Arc::new(App {
        config: Arc::clone(&config),
        store,
        setup,
        scheduler: analysis,
        progress,
        broker,
        vcs,
    });

    let listener = match tokio::net::TcpListener::bind(&config.listen).await {
        Ok(listener) => listener,
        Err(e) => fatal(&format!("cannot bind {}: {e}", config.listen)),
    };
    info!(listen = %config.listen, config_dir = %config.config_dir.display(), "serving");
    if let Err(e) = axum::serve(listener, server::router(app)).await {
        fatal(&e.to_string());
    }
}
