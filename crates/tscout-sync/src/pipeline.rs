//! Run orchestration: scrape, ingest, drain the classifier backlog, notify.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use tscout_adapters::{AdapterContext, Classifier, SourceAdapter, Transport};
use tscout_core::{CriteriaConfig, RawListing, RunRecord, RunStatus, SourceId};
use tscout_storage::{HttpFetcher, Ledger, LedgerError};

use crate::classify::{drain_backlog, DrainLimits, StrictClassifier};
use crate::config::{PipelineSettings, SchedulerSettings};
use crate::context::RunContext;
use crate::dedup::{cross_source_candidates, ingest, DuplicateCandidate};
use crate::notify::{notify, NotifyOutcome};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFailure {
    pub source: SourceId,
    pub error: String,
}

/// Summary of a finished run, returned to the caller and logged.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: RunRecord,
    pub source_failures: Vec<SourceFailure>,
    pub duplicate_candidates: Vec<DuplicateCandidate>,
    pub notifications: Vec<NotifyOutcome>,
    pub requeued: u64,
    pub released_claims: u64,
    pub stopped_early: bool,
}

#[derive(Debug, Default)]
struct StageSummary {
    source_failures: Vec<SourceFailure>,
    duplicate_candidates: Vec<DuplicateCandidate>,
    notifications: Vec<NotifyOutcome>,
    requeued: u64,
    released_claims: u64,
    stopped_early: bool,
}

pub struct Pipeline {
    ledger: Ledger,
    http: Arc<HttpFetcher>,
    sources: Vec<Box<dyn SourceAdapter>>,
    classifier: Arc<dyn Classifier>,
    transport: Arc<dyn Transport>,
    criteria: CriteriaConfig,
    settings: PipelineSettings,
    classify_timeout: Duration,
    excerpt_chars: usize,
}

impl Pipeline {
    pub fn new(
        ledger: Ledger,
        http: Arc<HttpFetcher>,
        sources: Vec<Box<dyn SourceAdapter>>,
        classifier: Arc<dyn Classifier>,
        transport: Arc<dyn Transport>,
        criteria: CriteriaConfig,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            ledger,
            http,
            sources,
            classifier,
            transport,
            criteria,
            settings,
            classify_timeout: Duration::from_secs(60),
            excerpt_chars: 600,
        }
    }

    pub fn with_classify_timeout(mut self, timeout: Duration) -> Self {
        self.classify_timeout = timeout;
        self
    }

    pub fn with_excerpt_chars(mut self, chars: usize) -> Self {
        self.excerpt_chars = chars;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Execute one full run. Per-item failures are recorded in the ledger and
    /// the report; only ledger failures abort the run.
    pub async fn run_once(&self) -> Result<RunReport, PipelineError> {
        let mut ctx = RunContext::new(self.ledger.clone(), Utc::now());
        let span = info_span!("pipeline_run", run_id = %ctx.run_id());
        self.execute(&mut ctx).instrument(span).await
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<RunReport, PipelineError> {
        self.ledger.begin_run(&ctx.run).await?;
        info!(sources = self.sources.len(), "run started");

        match self.run_stages(ctx).await {
            Ok(summary) => {
                ctx.run.status = RunStatus::Completed;
                ctx.run.ended_at = Some(Utc::now());
                self.ledger.finish_run(&ctx.run).await?;
                let counts = ctx.run.counts;
                info!(
                    scraped = counts.scraped,
                    new = counts.new,
                    qualified = counts.qualified,
                    notified = counts.notified,
                    failed = counts.failed,
                    duplicates = summary.duplicate_candidates.len(),
                    "run completed"
                );
                Ok(RunReport {
                    run: ctx.run.clone(),
                    source_failures: summary.source_failures,
                    duplicate_candidates: summary.duplicate_candidates,
                    notifications: summary.notifications,
                    requeued: summary.requeued,
                    released_claims: summary.released_claims,
                    stopped_early: summary.stopped_early,
                })
            }
            Err(err) => {
                error!(error = %err, "run aborted");
                ctx.run.status = RunStatus::Aborted;
                ctx.run.ended_at = Some(Utc::now());
                ctx.run.error = Some(err.to_string());
                if let Err(record_err) = self.ledger.finish_run(&ctx.run).await {
                    warn!(error = %record_err, "could not record aborted run");
                }
                Err(err)
            }
        }
    }

    async fn run_stages(&self, ctx: &mut RunContext) -> Result<StageSummary, PipelineError> {
        let mut summary = StageSummary::default();
        let deadline = self
            .settings
            .run_timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));

        let stale_before =
            Utc::now() - chrono::Duration::minutes(i64::from(self.settings.stale_claim_minutes));
        summary.released_claims = self.ledger.release_stale_claims(stale_before).await?;
        if summary.released_claims > 0 {
            warn!(count = summary.released_claims, "released stale delivery claims");
        }
        if self.settings.retry_failed_classifications {
            summary.requeued = self
                .ledger
                .requeue_failed_classifications(self.settings.max_classify_attempts)
                .await?;
            if summary.requeued > 0 {
                info!(count = summary.requeued, "requeued failed classifications");
            }
        }

        let listings = self.scrape_all(ctx, &mut summary).await;

        let created = ingest(ctx, &listings, Utc::now())
            .instrument(info_span!("ingest"))
            .await?;
        summary.duplicate_candidates =
            cross_source_candidates(&created, self.settings.duplicate_report_threshold);
        for candidate in &summary.duplicate_candidates {
            info!(
                a = %candidate.dedup_key_a,
                b = %candidate.dedup_key_b,
                similarity = candidate.similarity,
                "possible cross-source duplicate"
            );
        }

        let strict = StrictClassifier::new(self.classifier.clone(), Utc::now().date_naive());
        let limits = DrainLimits {
            call_timeout: self.classify_timeout,
            deadline,
        };
        let drained = drain_backlog(ctx, &strict, &self.criteria, limits)
            .instrument(info_span!("classify_backlog"))
            .await?;
        summary.stopped_early = drained.stopped_early;

        summary.notifications = notify(ctx, self.transport.as_ref(), self.excerpt_chars)
            .instrument(info_span!("notify"))
            .await?;
        Ok(summary)
    }

    async fn scrape_all(&self, ctx: &mut RunContext, summary: &mut StageSummary) -> Vec<RawListing> {
        let adapter_ctx = AdapterContext::new(ctx.run_id(), Utc::now());
        let mut listings = Vec::new();
        for adapter in &self.sources {
            let source = adapter.source_id();
            let result = adapter
                .fetch_raw_listings(&self.http, &adapter_ctx)
                .instrument(info_span!("scrape", %source))
                .await;
            match result {
                Ok(found) => {
                    info!(%source, count = found.len(), "scraped listings");
                    ctx.run.counts.scraped += found.len() as u32;
                    listings.extend(found);
                }
                Err(err) => {
                    warn!(%source, error = %err, "source failed, skipping");
                    ctx.run.counts.failed += 1;
                    summary.source_failures.push(SourceFailure {
                        source,
                        error: err.to_string(),
                    });
                }
            }
        }
        listings
    }
}

/// Build a cron scheduler that calls [`Pipeline::run_once`] on every tick.
/// Returns `None` when scheduling is disabled.
pub async fn build_scheduler(
    pipeline: Arc<Pipeline>,
    settings: &SchedulerSettings,
) -> anyhow::Result<Option<JobScheduler>> {
    if !settings.enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(settings.cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(report) => info!(run_id = %report.run.run_id, "scheduled run finished"),
                Err(err) => error!(error = %err, "scheduled run aborted"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", settings.cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use tscout_core::{NotificationState, ProcessingState};

    use super::*;
    use crate::testing::{
        raw, test_http, RecordingTransport, Script, ScriptedClassifier, StaticSource,
    };

    struct Harness {
        ledger: Ledger,
        classifier: Arc<ScriptedClassifier>,
        transport: Arc<RecordingTransport>,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_ledger(Ledger::in_memory().await.unwrap()).await
        }

        async fn with_ledger(ledger: Ledger) -> Self {
            Self {
                ledger,
                classifier: Arc::new(ScriptedClassifier::qualify_all()),
                transport: Arc::new(RecordingTransport::default()),
            }
        }

        fn pipeline(&self, sources: Vec<Box<dyn SourceAdapter>>) -> Pipeline {
            self.pipeline_with(sources, PipelineSettings::default())
        }

        fn pipeline_with(
            &self,
            sources: Vec<Box<dyn SourceAdapter>>,
            settings: PipelineSettings,
        ) -> Pipeline {
            Pipeline::new(
                self.ledger.clone(),
                test_http(),
                sources,
                self.classifier.clone(),
                self.transport.clone(),
                CriteriaConfig {
                    sector_filter: vec!["software".into()],
                    ..Default::default()
                },
                settings,
            )
            .with_classify_timeout(Duration::from_secs(5))
        }
    }

    fn reliefweb(paths: &[&str]) -> Box<dyn SourceAdapter> {
        Box::new(StaticSource::ok(
            SourceId::ReliefWeb,
            paths.iter().map(|p| raw(SourceId::ReliefWeb, p, p)).collect(),
        ))
    }

    #[tokio::test]
    async fn rescraped_listing_is_stored_once_and_only_refreshed() {
        let h = Harness::new().await;
        let pipeline = h.pipeline(vec![reliefweb(&["/tenders/42"])]);

        let first = pipeline.run_once().await.unwrap();
        let after_first = h.ledger.get("reliefweb:/tenders/42").await.unwrap().unwrap();
        let second = pipeline.run_once().await.unwrap();
        let after_second = h.ledger.get("reliefweb:/tenders/42").await.unwrap().unwrap();

        assert_eq!(h.ledger.count_tenders().await.unwrap(), 1);
        assert_eq!(first.run.counts.new, 1);
        assert_eq!(second.run.counts.new, 0);
        assert_eq!(second.run.counts.scraped, 1);
        assert_eq!(after_second.first_seen_at, after_first.first_seen_at);
        assert!(after_second.last_seen_at >= after_first.last_seen_at);
        assert_eq!(after_second.processing_state, after_first.processing_state);
        assert_eq!(h.classifier.calls(), 1);
    }

    #[tokio::test]
    async fn sent_tender_is_never_sent_again() {
        let h = Harness::new().await;
        let pipeline = h.pipeline(vec![reliefweb(&["/a", "/b"])]);
        for _ in 0..3 {
            pipeline.run_once().await.unwrap();
        }
        assert_eq!(h.transport.delivered().len(), 2);
        let a = h.ledger.get("reliefweb:/a").await.unwrap().unwrap();
        assert_eq!(a.notification_state, Some(NotificationState::Sent));
        assert!(a.notified_at.is_some());
    }

    #[tokio::test]
    async fn failed_notification_is_resent_next_run_then_excluded() {
        let ledger = Ledger::in_memory().await.unwrap();
        let mut h = Harness::with_ledger(ledger).await;
        h.transport = Arc::new(RecordingTransport::failing_first(1));
        let pipeline = h.pipeline(vec![reliefweb(&["/tenders/7"])]);

        let first = pipeline.run_once().await.unwrap();
        assert_eq!(first.notifications.len(), 1);
        assert!(!first.notifications[0].delivered);
        let t = h.ledger.get("reliefweb:/tenders/7").await.unwrap().unwrap();
        assert_eq!(t.notification_state, Some(NotificationState::SendFailed));

        let second = pipeline.run_once().await.unwrap();
        assert!(second.notifications[0].delivered);
        assert_eq!(second.run.counts.notified, 1);

        let third = pipeline.run_once().await.unwrap();
        assert!(third.notifications.is_empty());
        assert_eq!(h.transport.attempts(), 2);
        assert_eq!(h.transport.delivered().len(), 1);
    }

    #[tokio::test]
    async fn classification_failure_is_isolated_and_retried_next_run() {
        let mut h = Harness::new().await;
        h.classifier = Arc::new(ScriptedClassifier::new([("reliefweb:/b", Script::FailOnce)]));
        let pipeline = h.pipeline(vec![reliefweb(&["/a", "/b", "/c"])]);

        let first = pipeline.run_once().await.unwrap();
        assert_eq!(first.run.counts.qualified, 2);
        assert_eq!(first.run.counts.failed, 1);
        assert_eq!(h.ledger.count_in_state(ProcessingState::New).await.unwrap(), 0);
        for key in ["reliefweb:/a", "reliefweb:/c"] {
            let t = h.ledger.get(key).await.unwrap().unwrap();
            assert_eq!(t.processing_state, ProcessingState::ClassifiedQualified);
        }
        let b = h.ledger.get("reliefweb:/b").await.unwrap().unwrap();
        assert_eq!(b.processing_state, ProcessingState::ClassifyFailed);

        let second = pipeline.run_once().await.unwrap();
        assert_eq!(second.requeued, 1);
        let b = h.ledger.get("reliefweb:/b").await.unwrap().unwrap();
        assert_eq!(b.processing_state, ProcessingState::ClassifiedQualified);
        assert_eq!(b.classify_attempts, 2);
        assert_eq!(h.transport.delivered().len(), 3);
    }

    #[tokio::test]
    async fn retries_stop_after_the_attempt_limit() {
        let mut h = Harness::new().await;
        h.classifier = Arc::new(ScriptedClassifier::new([("reliefweb:/b", Script::Fail)]));
        let settings = PipelineSettings {
            max_classify_attempts: 2,
            ..PipelineSettings::default()
        };
        let pipeline = h.pipeline_with(vec![reliefweb(&["/b"])], settings);

        for _ in 0..4 {
            pipeline.run_once().await.unwrap();
        }
        let b = h.ledger.get("reliefweb:/b").await.unwrap().unwrap();
        assert_eq!(b.processing_state, ProcessingState::ClassifyFailed);
        assert_eq!(b.classify_attempts, 2);
        assert_eq!(h.classifier.calls(), 2);
    }

    #[tokio::test]
    async fn failing_source_does_not_block_the_others() {
        let h = Harness::new().await;
        let pipeline = h.pipeline(vec![
            Box::new(StaticSource::failing(SourceId::GlobalTenders, "HTTP 503")),
            reliefweb(&["/a"]),
        ]);

        let report = pipeline.run_once().await.unwrap();
        assert_eq!(report.source_failures.len(), 1);
        assert_eq!(report.source_failures[0].source, SourceId::GlobalTenders);
        assert_eq!(report.run.counts.new, 1);
        assert_eq!(report.run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn expired_run_budget_still_notifies_earlier_qualifications() {
        let h = Harness::new().await;
        h.pipeline(vec![reliefweb(&["/a"])]).run_once().await.unwrap();
        h.transport.fail_next(1);
        h.pipeline(vec![reliefweb(&["/b"])]).run_once().await.unwrap();

        let settings = PipelineSettings {
            run_timeout_secs: Some(0),
            ..PipelineSettings::default()
        };
        let report = h
            .pipeline_with(vec![reliefweb(&["/c"])], settings)
            .run_once()
            .await
            .unwrap();
        assert!(report.stopped_early);
        assert_eq!(h.ledger.count_in_state(ProcessingState::New).await.unwrap(), 1);
        assert_eq!(report.notifications.len(), 1);
        assert!(report.notifications[0].delivered);
    }

    #[tokio::test]
    async fn cross_source_duplicates_are_reported_not_merged() {
        let h = Harness::new().await;
        let pipeline = h.pipeline(vec![
            Box::new(StaticSource::ok(
                SourceId::ReliefWeb,
                vec![raw(SourceId::ReliefWeb, "/job/1", "supply of erp software")],
            )),
            Box::new(StaticSource::ok(
                SourceId::SomaliJobs,
                vec![raw(SourceId::SomaliJobs, "/tender/9", "Supply of ERP Software")],
            )),
        ]);
        let report = pipeline.run_once().await.unwrap();
        assert_eq!(report.duplicate_candidates.len(), 1);
        assert_eq!(h.ledger.count_tenders().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn runs_are_recorded_with_counts() {
        let h = Harness::new().await;
        let report = h.pipeline(vec![reliefweb(&["/a"])]).run_once().await.unwrap();
        let runs = h.ledger.recent_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, report.run.run_id);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].counts, report.run.counts);
        assert!(runs[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn unreachable_ledger_aborts_the_run() {
        let h = Harness::new().await;
        let pipeline = h.pipeline(vec![reliefweb(&["/a"])]);
        h.ledger.close().await;
        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, PipelineError::Ledger(_)));
        assert!(h.transport.delivered().is_empty());
    }

    #[tokio::test]
    async fn overlapping_runs_deliver_each_tender_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let h1 = Harness::with_ledger(Ledger::open_path(&path).await.unwrap()).await;
        let mut h2 = Harness::with_ledger(Ledger::open_path(&path).await.unwrap()).await;
        h2.transport = h1.transport.clone();

        let paths = ["/a", "/b", "/c", "/d", "/e"];
        let p1 = h1.pipeline(vec![reliefweb(&paths)]);
        let p2 = h2.pipeline(vec![reliefweb(&paths)]);
        let (r1, r2) = tokio::join!(p1.run_once(), p2.run_once());
        r1.unwrap();
        r2.unwrap();

        assert_eq!(h1.ledger.count_tenders().await.unwrap(), 5);
        let mut delivered = h1.transport.delivered();
        delivered.sort();
        delivered.dedup();
        assert_eq!(delivered.len(), 5);
        assert_eq!(h1.transport.attempts(), 5);
    }
}
