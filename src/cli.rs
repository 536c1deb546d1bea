use clap::Parser;

/// pair-review, a local-first AI code review orchestrator
#[derive(Parser, Debug)]
#[command(name = "pair-review", version, about)]
pub struct Cli {
    /// Address to bind the HTTP surface to
    #[arg(long, default_value = "127.0.0.1:8642")]
    pub listen: String,

    /// Config directory (overrides PAIR_REVIEW_CONFIG_DIR)
    #[arg(long)]
    pub config_dir: Option<String>,

    /// Remote host token (overrides the config file)
    #[arg(long)]
    pub token: Option<String>,

    /// Maximum number of LLM calls in flight at once
    #[arg(long)]
    pub max_concurrent_llm_calls: Option<usize>,
}
