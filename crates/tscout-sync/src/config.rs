//! `tscout.yaml` loading, environment overrides and secret resolution.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use tscout_adapters::classifier::DEFAULT_SYSTEM_PROMPT;
use tscout_adapters::transport::TELEGRAM_API_BASE;
use tscout_adapters::SourceSettings;
use tscout_core::{CriteriaConfig, SourceId};

pub const DEFAULT_CONFIG_PATH: &str = "tscout.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoutConfig {
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceSettings>,
    #[serde(default)]
    pub criteria: CriteriaConfig,
    #[serde(default)]
    pub classifier: ClassifierSettings,
    #[serde(default)]
    pub notifier: NotifierSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSettings {
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierSettings {
    #[serde(default = "default_classifier_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_classifier_model")]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub system_prompt_path: Option<PathBuf>,
    #[serde(default = "default_classify_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            endpoint: default_classifier_endpoint(),
            model: default_classifier_model(),
            api_key_env: default_api_key_env(),
            system_prompt_path: None,
            timeout_secs: default_classify_timeout_secs(),
        }
    }
}

impl ClassifierSettings {
    pub fn system_prompt(&self) -> Result<String> {
        match &self.system_prompt_path {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("reading system prompt {}", path.display())),
            None => Ok(DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    #[default]
    Telegram,
    /// Log messages instead of sending them.
    Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierSettings {
    #[serde(default)]
    pub kind: NotifierKind,
    #[serde(default = "default_telegram_api_base")]
    pub telegram_api_base: String,
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            kind: NotifierKind::default(),
            telegram_api_base: default_telegram_api_base(),
            excerpt_chars: default_excerpt_chars(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_true")]
    pub retry_failed_classifications: bool,
    #[serde(default = "default_max_classify_attempts")]
    pub max_classify_attempts: u32,
    #[serde(default = "default_stale_claim_minutes")]
    pub stale_claim_minutes: u32,
    #[serde(default = "default_duplicate_report_threshold")]
    pub duplicate_report_threshold: f64,
    /// Stop starting classification calls after this many seconds.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry_failed_classifications: true,
            max_classify_attempts: default_max_classify_attempts(),
            stale_claim_minutes: default_stale_claim_minutes(),
            duplicate_report_threshold: default_duplicate_report_threshold(),
            run_timeout_secs: None,
            user_agent: default_user_agent(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Six-field cron expression (seconds first).
    #[serde(default = "default_cron")]
    pub cron: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: default_cron(),
        }
    }
}

fn default_sources() -> Vec<SourceSettings> {
    SourceId::ALL.into_iter().map(SourceSettings::enabled).collect()
}

fn default_database_url() -> String {
    "sqlite://tscout.db".to_string()
}

fn default_classifier_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_classifier_model() -> String {
    "gpt-4o".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_classify_timeout_secs() -> u64 {
    60
}

fn default_telegram_api_base() -> String {
    TELEGRAM_API_BASE.to_string()
}

fn default_excerpt_chars() -> usize {
    600
}

fn default_true() -> bool {
    true
}

fn default_max_classify_attempts() -> u32 {
    3
}

fn default_stale_claim_minutes() -> u32 {
    60
}

fn default_duplicate_report_threshold() -> f64 {
    0.93
}

fn default_user_agent() -> String {
    "tender-scout/0.1".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_cron() -> String {
    "0 0 6,18 * * *".to_string()
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl ScoutConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("parsing tender scout config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Load `TSCOUT_CONFIG` (or `tscout.yaml`) and apply `TSCOUT_*` overrides.
    ///
    /// A missing default file falls back to built-in defaults; an explicitly
    /// named file must exist.
    pub fn from_env() -> Result<Self> {
        let explicit = std::env::var("TSCOUT_CONFIG").ok();
        let path = PathBuf::from(explicit.as_deref().unwrap_or(DEFAULT_CONFIG_PATH));
        let mut config = if explicit.is_none() && !path.exists() {
            info!(path = %path.display(), "no config file found, using defaults");
            Self::default_with_sources()
        } else {
            Self::load(&path)?
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn default_with_sources() -> Self {
        Self {
            sources: default_sources(),
            ..Self::default()
        }
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("TSCOUT_DATABASE_URL") {
            self.ledger.database_url = url;
        }
        if let Some(user_agent) = lookup("TSCOUT_USER_AGENT") {
            self.pipeline.user_agent = user_agent;
        }
        if let Some(secs) = lookup("TSCOUT_HTTP_TIMEOUT_SECS") {
            self.pipeline.http_timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("TSCOUT_HTTP_TIMEOUT_SECS=`{secs}`"))?;
        }
        if let Some(secs) = lookup("TSCOUT_RUN_TIMEOUT_SECS") {
            self.pipeline.run_timeout_secs = Some(
                secs.trim()
                    .parse()
                    .with_context(|| format!("TSCOUT_RUN_TIMEOUT_SECS=`{secs}`"))?,
            );
        }
        if let Some(flag) = lookup("TSCOUT_SCHEDULER_ENABLED") {
            self.scheduler.enabled = parse_flag(&flag);
        }
        if let Some(cron) = lookup("TSCOUT_CRON") {
            self.scheduler.cron = cron;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let criteria = &self.criteria;
        if !criteria.has_hard_filters() && criteria.model_criteria().is_empty() {
            bail!("criteria: at least one filter or custom criterion is required");
        }
        if criteria.budget_threshold.is_some_and(|b| b < 0.0) {
            bail!("criteria.budget_threshold must not be negative");
        }
        if criteria
            .location_filter
            .as_deref()
            .is_some_and(|l| l.trim().is_empty())
        {
            bail!("criteria.location_filter must not be blank");
        }
        if let Some(repeated) = criteria.duplicate_custom_criterion() {
            bail!("criteria.custom_text_criteria lists `{repeated}` more than once");
        }
        if self.pipeline.max_classify_attempts == 0 {
            bail!("pipeline.max_classify_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.pipeline.duplicate_report_threshold) {
            bail!("pipeline.duplicate_report_threshold must be within 0..=1");
        }
        if self.classifier.timeout_secs == 0 {
            bail!("classifier.timeout_secs must be at least 1");
        }
        let mut seen = Vec::new();
        for source in &self.sources {
            if seen.contains(&source.source) {
                bail!("source `{}` is configured twice", source.source);
            }
            seen.push(source.source);
        }
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceSettings> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// Credentials read from the environment, never from the config file.
#[derive(Clone, PartialEq, Eq)]
pub struct Secrets {
    pub classifier_api_key: String,
    pub telegram: Option<TelegramSecrets>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct TelegramSecrets {
    pub bot_token: String,
    pub chat_id: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("classifier_api_key", &"<redacted>")
            .field("telegram", &self.telegram.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Secrets {
    pub fn resolve(config: &ScoutConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |name: &str| -> Result<String> {
            match lookup(name) {
                Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
                _ => bail!("environment variable {name} is required"),
            }
        };

        let classifier_api_key = required(&config.classifier.api_key_env)?;
        let telegram = match config.notifier.kind {
            NotifierKind::Telegram => Some(TelegramSecrets {
                bot_token: required("TELEGRAM_BOT_TOKEN")?,
                chat_id: required("TELEGRAM_CHAT_ID")?,
            }),
            NotifierKind::Log => None,
        };
        Ok(Self {
            classifier_api_key,
            telegram,
        })
    }

    pub fn from_env(config: &ScoutConfig) -> Result<Self> {
        Self::resolve(config, |key| std::env::var(key).ok())
    }
}
