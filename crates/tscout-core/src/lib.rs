//! Core domain model for Tender Scout: tenders, their lifecycle states, and run records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tscout-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Origin site a tender was scraped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceId {
    #[serde(rename = "reliefweb")]
    ReliefWeb,
    #[serde(rename = "globaltenders")]
    GlobalTenders,
    #[serde(rename = "somalijobs")]
    SomaliJobs,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [Self::ReliefWeb, Self::GlobalTenders, Self::SomaliJobs];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReliefWeb => "reliefweb",
            Self::GlobalTenders => "globaltenders",
            Self::SomaliJobs => "somalijobs",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|source| source.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError {
                kind: "source",
                value: s.to_string(),
            })
    }
}

/// Listing exactly as a source adapter produced it, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub source: SourceId,
    pub title: String,
    pub organization: String,
    pub posted_date: String,
    pub closing_date: Option<String>,
    pub location: String,
    pub url: String,
    pub content: String,
    #[serde(default)]
    pub budget: Option<f64>,
}

/// Classification progress of a tender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    New,
    ClassifiedQualified,
    ClassifiedUnqualified,
    ClassifyFailed,
}

impl ProcessingState {
    pub const ALL: [ProcessingState; 4] = [
        Self::New,
        Self::ClassifiedQualified,
        Self::ClassifiedUnqualified,
        Self::ClassifyFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::ClassifiedQualified => "classified_qualified",
            Self::ClassifiedUnqualified => "classified_unqualified",
            Self::ClassifyFailed => "classify_failed",
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "processing state",
                value: s.to_string(),
            })
    }
}

/// Delivery progress of a qualified tender.
///
/// `Sending` is the in-flight claim a notifier holds while the transport call
/// is outstanding; it keeps overlapping runs from dispatching the same tender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationState {
    Pending,
    Sending,
    Sent,
    SendFailed,
}

impl NotificationState {
    pub const ALL: [NotificationState; 4] =
        [Self::Pending, Self::Sending, Self::Sent, Self::SendFailed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::SendFailed => "send_failed",
        }
    }

    /// States a notifier may claim for (re)delivery.
    pub fn is_deliverable(&self) -> bool {
        matches!(self, Self::Pending | Self::SendFailed)
    }
}

impl fmt::Display for NotificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "notification state",
                value: s.to_string(),
            })
    }
}

/// Normalized insert payload handed from dedup to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTender {
    pub dedup_key: String,
    pub source: SourceId,
    pub title: String,
    pub organization: String,
    pub posted_date: Option<NaiveDate>,
    pub closing_date: Option<NaiveDate>,
    pub location: String,
    pub url: Option<String>,
    pub raw_content: String,
    pub budget: Option<f64>,
}

/// Canonical persisted tender. Descriptive fields never change after the first insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tender {
    /// Ledger insertion order.
    pub seq: i64,
    pub dedup_key: String,
    pub source: SourceId,
    pub title: String,
    pub organization: String,
    pub posted_date: Option<NaiveDate>,
    pub closing_date: Option<NaiveDate>,
    pub location: String,
    pub url: Option<String>,
    pub raw_content: String,
    pub budget: Option<f64>,
    pub processing_state: ProcessingState,
    pub notification_state: Option<NotificationState>,
    pub classify_attempts: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub classified_at: Option<DateTime<Utc>>,
    pub notified_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Transient classifier verdict; only the resulting state transition is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub tender_key: String,
    pub qualified: bool,
    pub rationale: String,
}

/// Interest criteria a tender must satisfy in full to qualify.
///
/// `location_filter`, `budget_threshold` and `deadline_window` are checked against
/// structured tender fields. `sector_filter` and `custom_text_criteria` go to the
/// model, which must affirm each one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CriteriaConfig {
    #[serde(default, alias = "location")]
    pub location_filter: Option<String>,
    #[serde(default, alias = "sectors")]
    pub sector_filter: Vec<String>,
    #[serde(default, alias = "budget_min")]
    pub budget_threshold: Option<f64>,
    /// Minimum days left before the closing date.
    #[serde(default, alias = "deadline_days")]
    pub deadline_window: Option<u32>,
    #[serde(default)]
    pub custom_text_criteria: Vec<String>,
}

impl CriteriaConfig {
    /// Criteria the classification model has to confirm one by one.
    ///
    /// Entries equal up to case and surrounding whitespace are listed once,
    /// since a model answer cannot tell them apart.
    pub fn model_criteria(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        if !self.sector_filter.is_empty() {
            out.push(format!("sector is one of: {}", self.sector_filter.join(", ")));
        }
        for criterion in self.custom_text_criteria.iter().map(|c| c.trim()) {
            if !criterion.is_empty() && !out.iter().any(|c| c.eq_ignore_ascii_case(criterion)) {
                out.push(criterion.to_string());
            }
        }
        out
    }

    /// First custom criterion that repeats an earlier one, ignoring case.
    pub fn duplicate_custom_criterion(&self) -> Option<&str> {
        let trimmed: Vec<&str> = self.custom_text_criteria.iter().map(|c| c.trim()).collect();
        trimmed
            .iter()
            .enumerate()
            .find(|(i, c)| trimmed[..*i].iter().any(|p| p.eq_ignore_ascii_case(c)))
            .map(|(_, c)| *c)
    }

    pub fn has_hard_filters(&self) -> bool {
        self.location_filter.is_some()
            || self.budget_threshold.is_some()
            || self.deadline_window.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

impl FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "aborted" => Ok(Self::Aborted),
            other => Err(ParseEnumError {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub scraped: u32,
    pub new: u32,
    pub qualified: u32,
    pub notified: u32,
    pub failed: u32,
}

/// One pipeline execution. Observability only, never consulted for control flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub error: Option<String>,
}

impl RunRecord {
    pub fn start(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            ended_at: None,
            status: RunStatus::Running,
            counts: RunCounts::default(),
            error: None,
        }
    }
}
