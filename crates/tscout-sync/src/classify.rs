//! Classifier loop: drains the `new` backlog one tender at a time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use tscout_adapters::{Classifier, ClassifyError};
use tscout_core::{ClassificationResult, CriteriaConfig, ProcessingState, Tender};
use tscout_storage::LedgerError;

use crate::context::RunContext;

/// Outcome of checking one locally evaluated criterion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    Match,
    Mismatch(String),
    /// The tender lacks the field the criterion needs.
    Unverifiable(String),
}

fn normalized(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Evaluate `location_filter`, `budget_threshold` and `deadline_window`.
/// The first failing criterion decides the verdict.
pub fn check_hard_filters(tender: &Tender, criteria: &CriteriaConfig, today: NaiveDate) -> FilterVerdict {
    if let Some(wanted) = criteria.location_filter.as_deref() {
        let location = normalized(&tender.location);
        let wanted = normalized(wanted);
        if location.is_empty() {
            return FilterVerdict::Unverifiable(format!("location `{wanted}` required but tender has no location"));
        }
        if !location.contains(&wanted) && !wanted.contains(&location) {
            return FilterVerdict::Mismatch(format!("location `{location}` is outside `{wanted}`"));
        }
    }

    if let Some(minimum) = criteria.budget_threshold {
        match tender.budget {
            None => {
                return FilterVerdict::Unverifiable(format!(
                    "budget of at least {minimum} required but tender states no budget"
                ))
            }
            Some(budget) if budget < minimum => {
                return FilterVerdict::Mismatch(format!("budget {budget} is below {minimum}"))
            }
            Some(_) => {}
        }
    }

    if let Some(days) = criteria.deadline_window {
        match tender.closing_date {
            None => {
                return FilterVerdict::Unverifiable(format!(
                    "{days} days before closing required but tender has no closing date"
                ))
            }
            Some(closing) => {
                let remaining = (closing - today).num_days();
                if remaining < i64::from(days) {
                    return FilterVerdict::Mismatch(format!(
                        "closes {closing}, {remaining} days left, {days} required"
                    ));
                }
            }
        }
    }

    FilterVerdict::Match
}

/// Wraps a model-backed classifier with the local hard filters.
///
/// The model is only consulted when every hard filter matches and there are
/// criteria left for it to confirm.
pub struct StrictClassifier {
    inner: Arc<dyn Classifier>,
    today: NaiveDate,
}

impl StrictClassifier {
    pub fn new(inner: Arc<dyn Classifier>, today: NaiveDate) -> Self {
        Self { inner, today }
    }
}

#[async_trait]
impl Classifier for StrictClassifier {
    async fn classify(
        &self,
        tender: &Tender,
        criteria: &CriteriaConfig,
    ) -> Result<ClassificationResult, ClassifyError> {
        let rejected = |rationale: String| ClassificationResult {
            tender_key: tender.dedup_key.clone(),
            qualified: false,
            rationale,
        };
        match check_hard_filters(tender, criteria, self.today) {
            FilterVerdict::Match => {}
            FilterVerdict::Mismatch(reason) | FilterVerdict::Unverifiable(reason) => {
                return Ok(rejected(reason));
            }
        }

        if criteria.model_criteria().is_empty() {
            return Ok(ClassificationResult {
                tender_key: tender.dedup_key.clone(),
                qualified: true,
                rationale: "all structured criteria matched".to_string(),
            });
        }

        let result = self.inner.classify(tender, criteria).await?;
        if result.tender_key != tender.dedup_key {
            return Err(ClassifyError::Malformed(format!(
                "verdict for `{}` returned while classifying `{}`",
                result.tender_key, tender.dedup_key
            )));
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DrainLimits {
    /// Upper bound on a single classification call.
    pub call_timeout: Duration,
    /// No new classification call starts after this instant.
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct DrainOutcome {
    /// Tenders moved to `classified_qualified` by this drain.
    pub qualified: Vec<Tender>,
    pub unqualified: u32,
    pub failed: u32,
    /// The run deadline passed with tenders still waiting.
    pub stopped_early: bool,
}

/// Classify `new` tenders in insertion order until none remain.
///
/// A classifier failure marks only that tender `classify_failed`; ledger
/// errors abort the drain.
pub async fn drain_backlog(
    ctx: &mut RunContext,
    classifier: &dyn Classifier,
    criteria: &CriteriaConfig,
    limits: DrainLimits,
) -> Result<DrainOutcome, LedgerError> {
    let mut outcome = DrainOutcome::default();

    loop {
        let Some(tender) = ctx.ledger.next_new().await? else {
            break;
        };
        if limits.deadline.is_some_and(|d| Instant::now() >= d) {
            info!("run deadline reached, leaving remaining backlog for the next run");
            outcome.stopped_early = true;
            break;
        }

        let span = info_span!("classify", dedup_key = %tender.dedup_key);
        let verdict = tokio::time::timeout(limits.call_timeout, classifier.classify(&tender, criteria))
            .instrument(span)
            .await
            .unwrap_or(Err(ClassifyError::Timeout(limits.call_timeout)));

        let (to, error) = match &verdict {
            Ok(result) if result.qualified => (ProcessingState::ClassifiedQualified, None),
            Ok(_) => (ProcessingState::ClassifiedUnqualified, None),
            Err(err) => {
                warn!(dedup_key = %tender.dedup_key, error = %err, "classification failed");
                (ProcessingState::ClassifyFailed, Some(err.to_string()))
            }
        };

        let applied = ctx
            .ledger
            .transition_processing(&tender.dedup_key, ProcessingState::New, to, error.as_deref(), Utc::now())
            .await?;
        if !applied {
            debug!(dedup_key = %tender.dedup_key, "tender already classified by another run");
            continue;
        }

        match (to, verdict) {
            (ProcessingState::ClassifiedQualified, Ok(result)) => {
                info!(dedup_key = %tender.dedup_key, rationale = %result.rationale, "tender qualified");
                if let Some(updated) = ctx.ledger.get(&tender.dedup_key).await? {
                    outcome.qualified.push(updated);
                }
            }
            (ProcessingState::ClassifiedUnqualified, Ok(result)) => {
                debug!(dedup_key = %tender.dedup_key, rationale = %result.rationale, "tender unqualified");
                outcome.unqualified += 1;
            }
            _ => outcome.failed += 1,
        }
    }

    ctx.run.counts.qualified += outcome.qualified.len() as u32;
    ctx.run.counts.failed += outcome.failed;
    Ok(outcome)
}
