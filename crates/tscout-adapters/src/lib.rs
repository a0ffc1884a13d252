//! Capability adapters: source scrapers, the classification model, and the
//! notification transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod classifier;
pub mod sources;
pub mod transport;

pub use classifier::{
    interpret_model_output, ChatCompletionsClassifier, ChatCompletionsConfig, Classifier,
    ClassifyError,
};
pub use sources::{adapter_for_source, ScrapeError, SourceAdapter, SourceSettings};
pub use transport::{LogTransport, NotifyError, TelegramConfig, TelegramTransport, Transport};

pub const CRATE_NAME: &str = "tscout-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, fetched_at: DateTime<Utc>) -> Self {
        Self { run_id, fetched_at }
    }
}
