use chrono::{DateTime, Utc};
use tscout_core::RunRecord;
use tscout_storage::Ledger;
use uuid::Uuid;

/// State threaded through the stages of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub ledger: Ledger,
    pub run: RunRecord,
}

impl RunContext {
    pub fn new(ledger: Ledger, started_at: DateTime<Utc>) -> Self {
        Self {
            ledger,
            run: RunRecord::start(started_at),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run.run_id
    }
}
