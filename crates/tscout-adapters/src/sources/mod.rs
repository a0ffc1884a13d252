//! Source adapter contract and the HTML helpers shared by the site scrapers.

use async_trait::async_trait;
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tscout_core::{RawListing, SourceId};
use tscout_storage::{FetchError, HttpFetcher};

use crate::AdapterContext;

mod global_tenders;
mod reliefweb;
mod somali_jobs;

pub use global_tenders::GlobalTendersAdapter;
pub use reliefweb::ReliefWebAdapter;
pub use somali_jobs::SomaliJobsAdapter;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("fetching {site} listings failed: {error}")]
    Fetch {
        site: SourceId,
        #[source]
        error: FetchError,
    },
    #[error("parsing {site} listings failed: {message}")]
    Parse { site: SourceId, message: String },
}

impl ScrapeError {
    pub fn parse(site: SourceId, message: impl Into<String>) -> Self {
        Self::Parse {
            site,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> SourceId;

    /// Fetch the current listing page and return its entries in page order.
    async fn fetch_raw_listings(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawListing>, ScrapeError>;
}

/// Per-source settings from the `sources` section of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub source: SourceId,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Overrides the adapter's built-in listing URL.
    #[serde(default)]
    pub listing_url: Option<String>,
    /// Maximum listings to request where the site supports it.
    #[serde(default)]
    pub limit: Option<u32>,
    /// Country name used as the API filter and location label where the
    /// source has a country filter (ReliefWeb).
    #[serde(default)]
    pub country: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceSettings {
    pub fn enabled(source: SourceId) -> Self {
        Self {
            source,
            enabled: true,
            listing_url: None,
            limit: None,
            country: None,
        }
    }
}

pub fn adapter_for_source(settings: &SourceSettings) -> Box<dyn SourceAdapter> {
    match settings.source {
        SourceId::ReliefWeb => Box::new(ReliefWebAdapter::from_settings(settings)),
        SourceId::GlobalTenders => Box::new(GlobalTendersAdapter::from_settings(settings)),
        SourceId::SomaliJobs => Box::new(SomaliJobsAdapter::from_settings(settings)),
    }
}

pub(crate) fn selector(site: SourceId, css: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(css).map_err(|e| ScrapeError::parse(site, format!("selector `{css}`: {e}")))
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

pub(crate) fn first_text(element: ElementRef<'_>, sel: &Selector) -> Option<String> {
    element.select(sel).next().and_then(element_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_trimmed_and_collapsed() {
        assert_eq!(text_or_none("  Supply \n of   ERP ".into()).as_deref(), Some("Supply of ERP"));
        assert_eq!(text_or_none(" \t\n".into()), None);
    }

    #[test]
    fn every_source_has_an_adapter() {
        for source in SourceId::ALL {
            let adapter = adapter_for_source(&SourceSettings::enabled(source));
            assert_eq!(adapter.source_id(), source);
        }
    }
}
