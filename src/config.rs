use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cli::Cli;
use crate::council::Tier;
use crate::error::{Error, Result};

/// Environment override for the config directory (and therefore every
/// on-disk path the server uses).
pub const CONFIG_DIR_ENV: &str = "PAIR_REVIEW_CONFIG_DIR";

const CONFIG_FILE: &str = "config.json";

/// A council saved in the config file, with the shape it was written in.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StoredCouncil {
    /// `council` (voice-centric) or `advanced` (level-centric).
    pub config_type: String,
    pub config: serde_json::Value,
}

/// On-disk shape of `<config_dir>/config.json`.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub token: Option<String>,
    pub model_tier: Option<Tier>,
    pub theme: Option<String>,
    /// `owner/repo` → absolute local root, for monorepos that should never
    /// be cloned fresh.
    #[serde(default)]
    pub monorepo_overrides: HashMap<String, PathBuf>,
    pub max_concurrent_llm_calls: Option<usize>,
    #[serde(default)]
    pub councils: HashMap<String, StoredCouncil>,
    /// Chat-completions endpoint the LLM client talks to.
    pub llm_endpoint: Option<String>,
    pub llm_api_key: Option<String>,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub config_dir: PathBuf,
    pub token: Option<String>,
    pub model_tier: Tier,
    pub theme: String,
    pub monorepo_overrides: HashMap<String, PathBuf>,
    pub max_concurrent_llm_calls: usize,
    pub councils: HashMap<String, StoredCouncil>,
    pub llm_endpoint: String,
    pub llm_api_key: Option<String>,
    pub listen: String,
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_dir = resolve_config_dir(cli);
        let path = config_dir.join(CONFIG_FILE);
        let file = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            parse_config(&content)?
        } else if cli.config_dir.is_some() {
            // An explicitly requested directory must exist and hold a config
            return Err(Error::ConfigNotFound(path));
        } else {
            ConfigFile::default()
        };
        merge(file, cli, config_dir)
    }

    pub fn store_path(&self) -> PathBuf {
        self.config_dir.join("store.db")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.config_dir.join("worktrees")
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.config_dir.join("repos")
    }

    /// Monorepo override for `owner/repo`, matched case-insensitively.
    pub fn monorepo_override(&self, owner: &str, repo: &str) -> Option<&PathBuf> {
        let wanted = format!("{owner}/{repo}").to_lowercase();
        self.monorepo_overrides
            .iter()
            .find(|(key, _)| key.to_lowercase() == wanted)
            .map(|(_, path)| path)
    }
}

fn resolve_config_dir(cli: &Cli) -> PathBuf {
    if let Some(ref dir) = cli.config_dir {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    match std::env::var("HOME") {
        Ok(home) => Path::new(&home).join(".pair-review"),
        Err(_) => PathBuf::from(".pair-review"),
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = serde_json::from_str(content)?;
    Ok(config)
}

pub fn merge(file: ConfigFile, cli: &Cli, config_dir: PathBuf) -> Result<Config> {
    let config = Config {
        config_dir,
        token: cli.token.clone().or(file.token),
        model_tier: file.model_tier.unwrap_or(Tier::Balanced),
        theme: file.theme.unwrap_or_else(|| "system".to_string()),
        monorepo_overrides: file.monorepo_overrides,
        max_concurrent_llm_calls: cli
            .max_concurrent_llm_calls
            .or(file.max_concurrent_llm_calls)
            .unwrap_or(4),
        councils: file.councils,
        llm_endpoint: file
            .llm_endpoint
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        llm_api_key: file.llm_api_key,
        listen: cli.listen.clone(),
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.max_concurrent_llm_calls == 0 {
        return Err(Error::ConfigValidation(
            "max_concurrent_llm_calls must be > 0".to_string(),
        ));
    }
    for (key, path) in &config.monorepo_overrides {
        if key.split('/').count() != 2 {
            return Err(Error::ConfigValidation(format!(
                "monorepo override key must be owner/repo, got: {key}"
            )));
        }
        if !path.is_absolute() {
            return Err(Error::ConfigValidation(format!(
                "monorepo override for {key} must be an absolute path"
            )));
        }
    }
    Ok(())
}
