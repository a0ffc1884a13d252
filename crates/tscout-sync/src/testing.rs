//! In-crate fakes for the scrape, classify and deliver capabilities.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use tscout_adapters::{
    AdapterContext, Classifier, ClassifyError, NotifyError, ScrapeError, SourceAdapter, Transport,
};
use tscout_core::{
    ClassificationResult, CriteriaConfig, NewTender, ProcessingState, RawListing, SourceId, Tender,
};
use tscout_storage::{HttpClientConfig, HttpFetcher};

pub(crate) fn test_http() -> Arc<HttpFetcher> {
    Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap())
}

pub(crate) fn raw(source: SourceId, path: &str, title: &str) -> RawListing {
    RawListing {
        source,
        title: title.to_string(),
        organization: "ministry of health".to_string(),
        posted_date: "2026-02-11".to_string(),
        closing_date: Some("2026-03-15".to_string()),
        location: "somalia".to_string(),
        url: path.to_string(),
        content: format!("{title}: implementation of a software platform"),
        budget: None,
    }
}

pub(crate) fn new_tender(source: SourceId, path: &str, title: &str) -> NewTender {
    NewTender {
        dedup_key: format!("{source}:{path}"),
        source,
        title: title.to_string(),
        organization: "ministry of health".to_string(),
        posted_date: NaiveDate::from_ymd_opt(2026, 2, 11),
        closing_date: None,
        location: "somalia".to_string(),
        url: Some(path.to_string()),
        raw_content: format!("{title} details"),
        budget: None,
    }
}

pub(crate) fn tender(seq: i64, source: SourceId, path: &str) -> Tender {
    let seen = Utc.with_ymd_and_hms(2026, 2, 11, 8, 0, 0).single().unwrap();
    let new = new_tender(source, path, "supply of erp software");
    Tender {
        seq,
        dedup_key: new.dedup_key,
        source,
        title: new.title,
        organization: new.organization,
        posted_date: new.posted_date,
        closing_date: new.closing_date,
        location: new.location,
        url: new.url,
        raw_content: new.raw_content,
        budget: new.budget,
        processing_state: ProcessingState::New,
        notification_state: None,
        classify_attempts: 0,
        first_seen_at: seen,
        last_seen_at: seen,
        classified_at: None,
        notified_at: None,
        last_error: None,
    }
}

/// Source adapter returning canned listings or a canned failure.
pub(crate) struct StaticSource {
    source: SourceId,
    result: Result<Vec<RawListing>, String>,
}

impl StaticSource {
    pub(crate) fn ok(source: SourceId, listings: Vec<RawListing>) -> Self {
        Self {
            source,
            result: Ok(listings),
        }
    }

    pub(crate) fn failing(source: SourceId, message: &str) -> Self {
        Self {
            source,
            result: Err(message.to_string()),
        }
    }
}

#[async_trait]
impl SourceAdapter for StaticSource {
    fn source_id(&self) -> SourceId {
        self.source
    }

    async fn fetch_raw_listings(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
    ) -> Result<Vec<RawListing>, ScrapeError> {
        self.result
            .clone()
            .map_err(|message| ScrapeError::parse(self.source, message))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Script {
    Qualify,
    Unqualified,
    Fail,
    /// Fail the first call, qualify afterwards.
    FailOnce,
    Hang,
}

/// Classifier answering per dedup key; unscripted keys qualify.
pub(crate) struct ScriptedClassifier {
    scripts: Mutex<HashMap<String, Script>>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedClassifier {
    pub(crate) fn new<const N: usize>(scripts: [(&str, Script); N]) -> Self {
        Self {
            scripts: Mutex::new(
                scripts
                    .into_iter()
                    .map(|(k, s)| (k.to_string(), s))
                    .collect(),
            ),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn qualify_all() -> Self {
        Self::new([])
    }

    pub(crate) fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub(crate) fn seen_keys(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        tender: &Tender,
        _criteria: &CriteriaConfig,
    ) -> Result<ClassificationResult, ClassifyError> {
        self.seen.lock().unwrap().push(tender.dedup_key.clone());
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts
                .get(&tender.dedup_key)
                .copied()
                .unwrap_or(Script::Qualify);
            if script == Script::FailOnce {
                scripts.insert(tender.dedup_key.clone(), Script::Qualify);
            }
            script
        };

        let verdict = |qualified| ClassificationResult {
            tender_key: tender.dedup_key.clone(),
            qualified,
            rationale: "scripted".to_string(),
        };
        match script {
            Script::Qualify => Ok(verdict(true)),
            Script::Unqualified => Ok(verdict(false)),
            Script::Fail | Script::FailOnce => {
                Err(ClassifyError::Malformed("scripted failure".to_string()))
            }
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(verdict(true))
            }
        }
    }
}

/// Transport that records messages and can be told to fail the next N sends.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    fail_remaining: AtomicUsize,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub(crate) fn failing_first(n: usize) -> Self {
        let transport = Self::default();
        transport.fail_next(n);
        transport
    }

    pub(crate) fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, message: &str) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(NotifyError::Rejected {
                status: 502,
                description: "scripted failure".to_string(),
            });
        }
        self.delivered.lock().unwrap().push(message.to_string());
        Ok(())
    }
}
