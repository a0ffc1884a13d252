//! Durable tender ledger backed by SQLite.
//!
//! Every mutation is a single statement committed on its own: inserts are
//! keyed insert-if-absent, state changes are compare-and-set on the current
//! state. Overlapping runs can share one database file without table locks.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use thiserror::Error;
use tracing::debug;
use tscout_core::{
    NewTender, NotificationState, ProcessingState, RunCounts, RunRecord, RunStatus, SourceId,
    Tender,
};
use uuid::Uuid;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("ledger migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt ledger row `{key}`: {message}")]
    Corrupt { key: String, message: String },
    #[error("illegal processing transition {from} -> {to}")]
    IllegalTransition {
        from: ProcessingState,
        to: ProcessingState,
    },
}

/// Result of recording one sighting of a listing.
#[derive(Debug, Clone, PartialEq)]
pub enum Sighting {
    /// First time this key was seen; the row was created in state `New`.
    Created(Tender),
    /// Key already present; only `last_seen_at` moved.
    Refreshed,
}

/// Terminal outcome of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

const TENDER_COLUMNS: &str = "seq, dedup_key, source, title, organization, posted_date, \
     closing_date, location, url, raw_content, budget, processing_state, notification_state, \
     classify_attempts, first_seen_at, last_seen_at, classified_at, notified_at, last_error";

impl Ledger {
    /// Open (creating if needed) a ledger from a `sqlite:` URL.
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory ledger. A single pinned connection keeps the database alive.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, LedgerError> {
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert the tender if its key is unknown, otherwise refresh `last_seen_at`.
    ///
    /// Content of an existing row is never overwritten.
    pub async fn record_sighting(
        &self,
        tender: &NewTender,
        seen_at: DateTime<Utc>,
    ) -> Result<Sighting, LedgerError> {
        let seen = timestamp(seen_at);
        let sql = format!(
            "INSERT INTO tenders (dedup_key, source, title, organization, posted_date, closing_date, \
             location, url, raw_content, budget, processing_state, first_seen_at, last_seen_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'new', ?, ?) \
             ON CONFLICT(dedup_key) DO NOTHING \
             RETURNING {TENDER_COLUMNS}"
        );
        let inserted = sqlx::query(&sql)
            .bind(&tender.dedup_key)
            .bind(tender.source.as_str())
            .bind(&tender.title)
            .bind(&tender.organization)
            .bind(tender.posted_date.map(date_text))
            .bind(tender.closing_date.map(date_text))
            .bind(&tender.location)
            .bind(tender.url.as_deref())
            .bind(&tender.raw_content)
            .bind(tender.budget)
            .bind(&seen)
            .bind(&seen)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = inserted {
            return Ok(Sighting::Created(tender_from_row(&row)?));
        }

        sqlx::query("UPDATE tenders SET last_seen_at = ? WHERE dedup_key = ? AND last_seen_at < ?")
            .bind(&seen)
            .bind(&tender.dedup_key)
            .bind(&seen)
            .execute(&self.pool)
            .await?;
        debug!(dedup_key = %tender.dedup_key, "refreshed existing tender sighting");
        Ok(Sighting::Refreshed)
    }

    pub async fn get(&self, dedup_key: &str) -> Result<Option<Tender>, LedgerError> {
        let sql = format!("SELECT {TENDER_COLUMNS} FROM tenders WHERE dedup_key = ?");
        let row = sqlx::query(&sql)
            .bind(dedup_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(tender_from_row).transpose()
    }

    pub async fn count_tenders(&self) -> Result<u64, LedgerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenders")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn count_in_state(&self, state: ProcessingState) -> Result<u64, LedgerError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tenders WHERE processing_state = ?")
                .bind(state.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn state_counts(&self) -> Result<Vec<(ProcessingState, u64)>, LedgerError> {
        let mut out = Vec::with_capacity(ProcessingState::ALL.len());
        for state in ProcessingState::ALL {
            out.push((state, self.count_in_state(state).await?));
        }
        Ok(out)
    }

    /// Oldest tender still waiting for classification, by insertion order.
    pub async fn next_new(&self) -> Result<Option<Tender>, LedgerError> {
        let sql = format!(
            "SELECT {TENDER_COLUMNS} FROM tenders WHERE processing_state = 'new' ORDER BY seq LIMIT 1"
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(tender_from_row).transpose()
    }

    /// Compare-and-set the processing state. Returns `false` when the row was
    /// no longer in `from` (another run got there first).
    pub async fn transition_processing(
        &self,
        dedup_key: &str,
        from: ProcessingState,
        to: ProcessingState,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        if !processing_transition_allowed(from, to) {
            return Err(LedgerError::IllegalTransition { from, to });
        }

        let attempt_increment = i64::from(from == ProcessingState::New);
        let classified_at = (from == ProcessingState::New).then(|| timestamp(at));
        let result = sqlx::query(
            "UPDATE tenders SET \
               processing_state = ?, \
               notification_state = CASE WHEN ? = 'classified_qualified' \
                 THEN COALESCE(notification_state, 'pending') ELSE notification_state END, \
               classify_attempts = classify_attempts + ?, \
               classified_at = COALESCE(?, classified_at), \
               last_error = ? \
             WHERE dedup_key = ? AND processing_state = ?",
        )
        .bind(to.as_str())
        .bind(to.as_str())
        .bind(attempt_increment)
        .bind(classified_at)
        .bind(error)
        .bind(dedup_key)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Put failed classifications back into the backlog while attempts remain.
    pub async fn requeue_failed_classifications(&self, max_attempts: u32) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            "UPDATE tenders SET processing_state = 'new' \
             WHERE processing_state = 'classify_failed' AND classify_attempts < ?",
        )
        .bind(i64::from(max_attempts))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Qualified tenders whose notification has not been sent, oldest first.
    pub async fn notification_candidates(&self) -> Result<Vec<Tender>, LedgerError> {
        let sql = format!(
            "SELECT {TENDER_COLUMNS} FROM tenders \
             WHERE processing_state = 'classified_qualified' \
               AND notification_state IN ('pending', 'send_failed') \
             ORDER BY seq"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(tender_from_row).collect()
    }

    /// Claim a tender for delivery by moving it from `from` to `Sending`.
    pub async fn claim_delivery(
        &self,
        dedup_key: &str,
        from: NotificationState,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        if !from.is_deliverable() {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE tenders SET notification_state = 'sending', claimed_at = ? \
             WHERE dedup_key = ? AND processing_state = 'classified_qualified' \
               AND notification_state = ?",
        )
        .bind(timestamp(at))
        .bind(dedup_key)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Resolve a held claim. Only rows still in `Sending` are touched.
    pub async fn finish_delivery(
        &self,
        dedup_key: &str,
        outcome: DeliveryOutcome,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let (state, notified_at) = match outcome {
            DeliveryOutcome::Sent => (NotificationState::Sent, Some(timestamp(at))),
            DeliveryOutcome::Failed => (NotificationState::SendFailed, None),
        };
        let result = sqlx::query(
            "UPDATE tenders SET notification_state = ?, notified_at = COALESCE(?, notified_at), \
               claimed_at = NULL, last_error = ? \
             WHERE dedup_key = ? AND notification_state = 'sending'",
        )
        .bind(state.as_str())
        .bind(notified_at)
        .bind(error)
        .bind(dedup_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Release delivery claims abandoned by a run that died mid-send.
    pub async fn release_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            "UPDATE tenders SET notification_state = 'send_failed', claimed_at = NULL, \
               last_error = 'delivery claim expired' \
             WHERE notification_state = 'sending' AND claimed_at < ?",
        )
        .bind(timestamp(claimed_before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_tenders(
        &self,
        state: Option<ProcessingState>,
        limit: u32,
    ) -> Result<Vec<Tender>, LedgerError> {
        let rows = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {TENDER_COLUMNS} FROM tenders WHERE processing_state = ? \
                     ORDER BY seq DESC LIMIT ?"
                );
                sqlx::query(&sql)
                    .bind(state.as_str())
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT {TENDER_COLUMNS} FROM tenders ORDER BY seq DESC LIMIT ?");
                sqlx::query(&sql)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(tender_from_row).collect()
    }

    pub async fn begin_run(&self, run: &RunRecord) -> Result<(), LedgerError> {
        sqlx::query("INSERT INTO runs (run_id, started_at, status) VALUES (?, ?, ?)")
            .bind(run.run_id.to_string())
            .bind(timestamp(run.started_at))
            .bind(run.status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn finish_run(&self, run: &RunRecord) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE runs SET ended_at = ?, status = ?, scraped = ?, new = ?, qualified = ?, \
               notified = ?, failed = ?, error = ? \
             WHERE run_id = ?",
        )
        .bind(run.ended_at.map(timestamp))
        .bind(run.status.as_str())
        .bind(i64::from(run.counts.scraped))
        .bind(i64::from(run.counts.new))
        .bind(i64::from(run.counts.qualified))
        .bind(i64::from(run.counts.notified))
        .bind(i64::from(run.counts.failed))
        .bind(run.error.as_deref())
        .bind(run.run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>, LedgerError> {
        let rows = sqlx::query(
            "SELECT run_id, started_at, ended_at, status, scraped, new, qualified, notified, \
               failed, error \
             FROM runs ORDER BY started_at DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }
}

fn processing_transition_allowed(from: ProcessingState, to: ProcessingState) -> bool {
    use ProcessingState::*;
    matches!(
        (from, to),
        (New, ClassifiedQualified)
            | (New, ClassifiedUnqualified)
            | (New, ClassifyFailed)
            | (ClassifyFailed, New)
    )
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn date_text(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_timestamp(key: &str, column: &str, raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| LedgerError::Corrupt {
            key: key.to_string(),
            message: format!("{column}: {e}"),
        })
}

fn parse_optional_timestamp(
    key: &str,
    column: &str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, LedgerError> {
    raw.map(|raw| parse_timestamp(key, column, &raw)).transpose()
}

fn parse_optional_date(key: &str, column: &str, raw: Option<String>) -> Result<Option<NaiveDate>, LedgerError> {
    raw.map(|raw| {
        NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| LedgerError::Corrupt {
            key: key.to_string(),
            message: format!("{column}: {e}"),
        })
    })
    .transpose()
}

fn tender_from_row(row: &SqliteRow) -> Result<Tender, LedgerError> {
    let key: String = row.try_get("dedup_key")?;
    let corrupt = |message: String| LedgerError::Corrupt {
        key: key.clone(),
        message,
    };

    let source = SourceId::from_str(&row.try_get::<String, _>("source")?)
        .map_err(|e| corrupt(e.to_string()))?;
    let processing_state = ProcessingState::from_str(&row.try_get::<String, _>("processing_state")?)
        .map_err(|e| corrupt(e.to_string()))?;
    let notification_state = row
        .try_get::<Option<String>, _>("notification_state")?
        .map(|raw| NotificationState::from_str(&raw))
        .transpose()
        .map_err(|e| corrupt(e.to_string()))?;
    let classify_attempts = u32::try_from(row.try_get::<i64, _>("classify_attempts")?)
        .map_err(|e| corrupt(format!("classify_attempts: {e}")))?;

    Ok(Tender {
        seq: row.try_get("seq")?,
        source,
        title: row.try_get("title")?,
        organization: row.try_get("organization")?,
        posted_date: parse_optional_date(&key, "posted_date", row.try_get("posted_date")?)?,
        closing_date: parse_optional_date(&key, "closing_date", row.try_get("closing_date")?)?,
        location: row.try_get("location")?,
        url: row.try_get("url")?,
        raw_content: row.try_get("raw_content")?,
        budget: row.try_get("budget")?,
        processing_state,
        notification_state,
        classify_attempts,
        first_seen_at: parse_timestamp(&key, "first_seen_at", &row.try_get::<String, _>("first_seen_at")?)?,
        last_seen_at: parse_timestamp(&key, "last_seen_at", &row.try_get::<String, _>("last_seen_at")?)?,
        classified_at: parse_optional_timestamp(&key, "classified_at", row.try_get("classified_at")?)?,
        notified_at: parse_optional_timestamp(&key, "notified_at", row.try_get("notified_at")?)?,
        last_error: row.try_get("last_error")?,
        dedup_key: key,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<RunRecord, LedgerError> {
    let run_id: String = row.try_get("run_id")?;
    let corrupt = |message: String| LedgerError::Corrupt {
        key: run_id.clone(),
        message,
    };
    let count = |column: &str| -> Result<u32, LedgerError> {
        let raw: i64 = row.try_get(column)?;
        u32::try_from(raw).map_err(|e| LedgerError::Corrupt {
            key: run_id.clone(),
            message: format!("{column}: {e}"),
        })
    };

    Ok(RunRecord {
        run_id: Uuid::parse_str(&run_id).map_err(|e| corrupt(e.to_string()))?,
        started_at: parse_timestamp(&run_id, "started_at", &row.try_get::<String, _>("started_at")?)?,
        ended_at: parse_optional_timestamp(&run_id, "ended_at", row.try_get("ended_at")?)?,
        status: RunStatus::from_str(&row.try_get::<String, _>("status")?)
            .map_err(|e| corrupt(e.to_string()))?,
        counts: RunCounts {
            scraped: count("scraped")?,
            new: count("new")?,
            qualified: count("qualified")?,
            notified: count("notified")?,
            failed: count("failed")?,
        },
        error: row.try_get("error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().unwrap()
    }

    fn new_tender(key: &str, title: &str) -> NewTender {
        NewTender {
            dedup_key: key.to_string(),
            source: SourceId::ReliefWeb,
            title: title.to_string(),
            organization: "unicef".to_string(),
            posted_date: NaiveDate::from_ymd_opt(2026, 3, 1),
            closing_date: None,
            location: "somalia".to_string(),
            url: Some("/tenders/42".to_string()),
            raw_content: "supply of erp software".to_string(),
            budget: None,
        }
    }

    #[tokio::test]
    async fn second_sighting_refreshes_without_overwriting_content() {
        let ledger = Ledger::in_memory().await.unwrap();
        let first = ledger
            .record_sighting(&new_tender("reliefweb:/tenders/42", "erp rollout"), at(6))
            .await
            .unwrap();
        let Sighting::Created(created) = first else {
            panic!("first sighting should create a row");
        };
        assert_eq!(created.processing_state, ProcessingState::New);
        assert_eq!(created.notification_state, None);

        let second = ledger
            .record_sighting(&new_tender("reliefweb:/tenders/42", "changed title"), at(18))
            .await
            .unwrap();
        assert_eq!(second, Sighting::Refreshed);

        let stored = ledger.get("reliefweb:/tenders/42").await.unwrap().unwrap();
        assert_eq!(stored.title, "erp rollout");
        assert_eq!(stored.first_seen_at, at(6));
        assert_eq!(stored.last_seen_at, at(18));
        assert_eq!(ledger.count_tenders().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn overlapping_ledgers_on_one_file_never_duplicate_a_key() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.db");
        let a = Ledger::open_path(&path).await.unwrap();
        let b = Ledger::open_path(&path).await.unwrap();
        let tender = new_tender("reliefweb:/tenders/7", "hospital erp");

        let (ra, rb) = tokio::join!(a.record_sighting(&tender, at(6)), b.record_sighting(&tender, at(6)));
        let created = [ra.unwrap(), rb.unwrap()]
            .into_iter()
            .filter(|s| matches!(s, Sighting::Created(_)))
            .count();
        assert_eq!(created, 1);
        assert_eq!(a.count_tenders().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn backlog_is_served_in_insertion_order() {
        let ledger = Ledger::in_memory().await.unwrap();
        for key in ["reliefweb:/b", "reliefweb:/a", "reliefweb:/c"] {
            ledger.record_sighting(&new_tender(key, key), at(6)).await.unwrap();
        }
        let next = ledger.next_new().await.unwrap().unwrap();
        assert_eq!(next.dedup_key, "reliefweb:/b");
    }

    #[tokio::test]
    async fn processing_transitions_are_compare_and_set() {
        let ledger = Ledger::in_memory().await.unwrap();
        ledger.record_sighting(&new_tender("reliefweb:/1", "t"), at(6)).await.unwrap();

        let won = ledger
            .transition_processing("reliefweb:/1", ProcessingState::New, ProcessingState::ClassifiedQualified, None, at(7))
            .await
            .unwrap();
        let lost = ledger
            .transition_processing("reliefweb:/1", ProcessingState::New, ProcessingState::ClassifiedUnqualified, None, at(7))
            .await
            .unwrap();
        assert!(won);
        assert!(!lost);

        let stored = ledger.get("reliefweb:/1").await.unwrap().unwrap();
        assert_eq!(stored.processing_state, ProcessingState::ClassifiedQualified);
        assert_eq!(stored.notification_state, Some(NotificationState::Pending));
        assert_eq!(stored.classify_attempts, 1);
        assert_eq!(stored.classified_at, Some(at(7)));
    }

    #[tokio::test]
    async fn undocumented_transitions_are_rejected() {
        let ledger = Ledger::in_memory().await.unwrap();
        let err = ledger
            .transition_processing(
                "reliefweb:/1",
                ProcessingState::ClassifiedUnqualified,
                ProcessingState::ClassifiedQualified,
                None,
                at(7),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn failed_classifications_requeue_until_attempts_run_out() {
        let ledger = Ledger::in_memory().await.unwrap();
        ledger.record_sighting(&new_tender("reliefweb:/1", "t"), at(6)).await.unwrap();

        let fail = |hour| {
            ledger.transition_processing(
                "reliefweb:/1",
                ProcessingState::New,
                ProcessingState::ClassifyFailed,
                Some("timeout"),
                at(hour),
            )
        };

        assert!(fail(7).await.unwrap());
        assert_eq!(ledger.requeue_failed_classifications(2).await.unwrap(), 1);
        assert_eq!(ledger.count_in_state(ProcessingState::New).await.unwrap(), 1);

        // Second failure reaches the limit: the tender stays failed.
        assert!(fail(8).await.unwrap());
        assert_eq!(ledger.requeue_failed_classifications(2).await.unwrap(), 0);
        let stored = ledger.get("reliefweb:/1").await.unwrap().unwrap();
        assert_eq!(stored.processing_state, ProcessingState::ClassifyFailed);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn delivery_claims_are_exclusive_and_sent_is_final() {
        let ledger = Ledger::in_memory().await.unwrap();
        ledger.record_sighting(&new_tender("reliefweb:/1", "t"), at(6)).await.unwrap();
        ledger
            .transition_processing("reliefweb:/1", ProcessingState::New, ProcessingState::ClassifiedQualified, None, at(7))
            .await
            .unwrap();

        assert_eq!(ledger.notification_candidates().await.unwrap().len(), 1);
        assert!(ledger.claim_delivery("reliefweb:/1", NotificationState::Pending, at(8)).await.unwrap());
        assert!(!ledger.claim_delivery("reliefweb:/1", NotificationState::Pending, at(8)).await.unwrap());
        assert!(ledger.notification_candidates().await.unwrap().is_empty());

        assert!(ledger.finish_delivery("reliefweb:/1", DeliveryOutcome::Sent, None, at(8)).await.unwrap());
        assert!(!ledger.claim_delivery("reliefweb:/1", NotificationState::Sent, at(9)).await.unwrap());
        assert!(ledger.notification_candidates().await.unwrap().is_empty());

        let stored = ledger.get("reliefweb:/1").await.unwrap().unwrap();
        assert_eq!(stored.notification_state, Some(NotificationState::Sent));
        assert_eq!(stored.notified_at, Some(at(8)));
    }

    #[tokio::test]
    async fn stale_claims_are_released_as_failed_deliveries() {
        let ledger = Ledger::in_memory().await.unwrap();
        ledger.record_sighting(&new_tender("reliefweb:/1", "t"), at(6)).await.unwrap();
        ledger
            .transition_processing("reliefweb:/1", ProcessingState::New, ProcessingState::ClassifiedQualified, None, at(7))
            .await
            .unwrap();
        ledger.claim_delivery("reliefweb:/1", NotificationState::Pending, at(8)).await.unwrap();

        assert_eq!(ledger.release_stale_claims(at(8)).await.unwrap(), 0);
        assert_eq!(ledger.release_stale_claims(at(10)).await.unwrap(), 1);
        let stored = ledger.get("reliefweb:/1").await.unwrap().unwrap();
        assert_eq!(stored.notification_state, Some(NotificationState::SendFailed));
        assert_eq!(ledger.notification_candidates().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_records_round_trip() {
        let ledger = Ledger::in_memory().await.unwrap();
        let mut run = RunRecord::start(at(6));
        ledger.begin_run(&run).await.unwrap();

        run.ended_at = Some(at(7));
        run.status = RunStatus::Completed;
        run.counts = RunCounts {
            scraped: 10,
            new: 4,
            qualified: 2,
            notified: 1,
            failed: 1,
        };
        ledger.finish_run(&run).await.unwrap();

        let runs = ledger.recent_runs(5).await.unwrap();
        assert_eq!(runs, vec![run]);
    }
}
