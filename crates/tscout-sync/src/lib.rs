//! Tender Scout pipeline: dedup, classifier loop, notifier and run orchestration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tscout_adapters::{
    adapter_for_source, ChatCompletionsClassifier, ChatCompletionsConfig, Classifier, LogTransport,
    TelegramConfig, TelegramTransport, Transport,
};
use tscout_storage::{HttpClientConfig, HttpFetcher, Ledger};

pub mod classify;
pub mod config;
pub mod context;
pub mod dedup;
pub mod notify;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{check_hard_filters, drain_backlog, DrainLimits, DrainOutcome, FilterVerdict, StrictClassifier};
pub use config::{NotifierKind, ScoutConfig, Secrets};
pub use context::RunContext;
pub use dedup::{cross_source_candidates, dedup_key, ingest, DuplicateCandidate};
pub use notify::{notify, render_message, NotifyOutcome};
pub use pipeline::{build_scheduler, Pipeline, PipelineError, RunReport, SourceFailure};

pub const CRATE_NAME: &str = "tscout-sync";

pub async fn open_ledger(config: &ScoutConfig) -> Result<Ledger> {
    Ledger::connect(&config.ledger.database_url)
        .await
        .with_context(|| format!("opening ledger {}", config.ledger.database_url))
}

/// Wire adapters, classifier and transport from configuration.
pub async fn build_pipeline(config: &ScoutConfig, secrets: &Secrets) -> Result<Pipeline> {
    let ledger = open_ledger(config).await?;
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.pipeline.http_timeout_secs),
        user_agent: Some(config.pipeline.user_agent.clone()),
        ..Default::default()
    })?);

    let sources = config.enabled_sources().map(adapter_for_source).collect();

    let classifier_http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.classifier.timeout_secs),
        user_agent: Some(config.pipeline.user_agent.clone()),
        ..Default::default()
    })?;
    let classifier: Arc<dyn Classifier> = Arc::new(ChatCompletionsClassifier::new(
        classifier_http,
        ChatCompletionsConfig {
            endpoint: config.classifier.endpoint.clone(),
            model: config.classifier.model.clone(),
            api_key: secrets.classifier_api_key.clone(),
            system_prompt: config.classifier.system_prompt()?,
        },
    ));

    let transport: Arc<dyn Transport> = match (&config.notifier.kind, &secrets.telegram) {
        (NotifierKind::Telegram, Some(telegram)) => {
            let mut telegram_config =
                TelegramConfig::new(telegram.bot_token.clone(), telegram.chat_id.clone());
            telegram_config.api_base = config.notifier.telegram_api_base.clone();
            Arc::new(TelegramTransport::new(telegram_config).context("configuring telegram")?)
        }
        (NotifierKind::Telegram, None) => {
            anyhow::bail!("telegram notifier selected but TELEGRAM_* credentials are missing")
        }
        (NotifierKind::Log, _) => Arc::new(LogTransport),
    };

    Ok(Pipeline::new(
        ledger,
        http,
        sources,
        classifier,
        transport,
        config.criteria.clone(),
        config.pipeline.clone(),
    )
    .with_classify_timeout(Duration::from_secs(config.classifier.timeout_secs))
    .with_excerpt_chars(config.notifier.excerpt_chars))
}
