//! Listing normalization, dedup keys and ingestion into the ledger.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::{debug, warn};
use tscout_core::{NewTender, RawListing, Tender};
use tscout_storage::{LedgerError, Sighting};

use crate::context::RunContext;

fn collapse_lower(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Path and query of `url` with scheme, host and fragment removed. `None` when
/// nothing identifying is left (`""`, `"/"`, `"#top"`).
fn url_path(url: &str) -> Option<String> {
    let trimmed = url.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or_default();
    let path = match without_fragment.split_once("://") {
        Some((_, rest)) => rest.find(['/', '?']).map(|i| &rest[i..]).unwrap_or_default(),
        None => without_fragment,
    };
    let path = collapse_lower(path);
    let path = path.trim_end_matches('/');
    if !path.chars().any(|c| c.is_alphanumeric()) {
        return None;
    }
    if path.starts_with('/') || path.starts_with('?') {
        Some(path.to_string())
    } else {
        Some(format!("/{path}"))
    }
}

/// Stable identity of a listing: `source:/url/path`, or
/// `source:title|organization` when the listing has no usable URL.
pub fn dedup_key(listing: &RawListing) -> String {
    match url_path(&listing.url) {
        Some(path) => format!("{}:{}", listing.source, path),
        None => format!(
            "{}:{}|{}",
            listing.source,
            collapse_lower(&listing.title),
            collapse_lower(&listing.organization)
        ),
    }
}

fn parse_date(raw: &str, field: &'static str, dedup_key: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(_) => {
            warn!(%dedup_key, field, value = raw, "dropping unparseable date");
            None
        }
    }
}

/// Turn a raw listing into the ledger insert payload. Listings with neither a
/// URL nor a title have no identity and are rejected.
pub fn normalize(listing: &RawListing) -> Option<NewTender> {
    let url = listing.url.trim();
    if url_path(url).is_none() && listing.title.trim().is_empty() {
        return None;
    }
    let key = dedup_key(listing);
    Some(NewTender {
        posted_date: parse_date(&listing.posted_date, "posted_date", &key),
        closing_date: listing
            .closing_date
            .as_deref()
            .and_then(|d| parse_date(d, "closing_date", &key)),
        source: listing.source,
        title: listing.title.trim().to_string(),
        organization: listing.organization.trim().to_string(),
        location: listing.location.trim().to_string(),
        url: (!url.is_empty()).then(|| url.to_string()),
        raw_content: listing.content.trim().to_string(),
        budget: listing.budget,
        dedup_key: key,
    })
}

/// Persist every listing and return the tenders created by this call.
/// Known keys only have their `last_seen_at` refreshed.
pub async fn ingest(
    ctx: &mut RunContext,
    listings: &[RawListing],
    seen_at: DateTime<Utc>,
) -> Result<Vec<Tender>, LedgerError> {
    let mut created = Vec::new();
    for listing in listings {
        let Some(tender) = normalize(listing) else {
            warn!(source = %listing.source, "skipping listing without url or title");
            continue;
        };
        match ctx.ledger.record_sighting(&tender, seen_at).await? {
            Sighting::Created(tender) => {
                debug!(dedup_key = %tender.dedup_key, "new tender");
                created.push(tender);
            }
            Sighting::Refreshed => {}
        }
    }
    ctx.run.counts.new += created.len() as u32;
    Ok(created)
}

/// Pair of tenders from different sources that look like the same opportunity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateCandidate {
    pub dedup_key_a: String,
    pub dedup_key_b: String,
    pub similarity: f64,
}

fn title_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Report likely cross-source duplicates. Nothing is merged; identity stays
/// per source.
pub fn cross_source_candidates(tenders: &[Tender], threshold: f64) -> Vec<DuplicateCandidate> {
    let titles: Vec<String> = tenders.iter().map(|t| title_fragment(&t.title)).collect();
    let mut out = Vec::new();
    for i in 0..tenders.len() {
        for j in (i + 1)..tenders.len() {
            if tenders[i].source == tenders[j].source || titles[i].is_empty() {
                continue;
            }
            let similarity = jaro_winkler(&titles[i], &titles[j]);
            if similarity >= threshold {
                out.push(DuplicateCandidate {
                    dedup_key_a: tenders[i].dedup_key.clone(),
                    dedup_key_b: tenders[j].dedup_key.clone(),
                    similarity,
                });
            }
        }
    }
    out
}
