use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use scraper::Html;
use tracing::debug;
use tscout_core::{RawListing, SourceId};
use tscout_storage::HttpFetcher;

use super::{element_text, selector, ScrapeError, SourceAdapter, SourceSettings};
use crate::AdapterContext;

const LISTING_URL: &str = "https://www.globaltenders.com/free-global-tenders/";

#[derive(Debug, Clone)]
pub struct GlobalTendersAdapter {
    listing_url: String,
}

impl Default for GlobalTendersAdapter {
    fn default() -> Self {
        Self {
            listing_url: LISTING_URL.to_string(),
        }
    }
}

impl GlobalTendersAdapter {
    pub fn from_settings(settings: &SourceSettings) -> Self {
        Self {
            listing_url: settings
                .listing_url
                .clone()
                .unwrap_or_else(|| LISTING_URL.to_string()),
        }
    }

    /// Detail links are site-relative; resolve them against the listing page.
    fn absolute_url(&self, href: &str) -> String {
        reqwest::Url::parse(&self.listing_url)
            .and_then(|base| base.join(href))
            .map(|url| url.to_string())
            .unwrap_or_else(|_| href.to_string())
    }

    /// Parse the free-tenders table. Each `tr#tender_GT…` row holds label/value
    /// div pairs inside its first `div.row`.
    pub fn parse_listing(&self, html: &str) -> Result<Vec<RawListing>, ScrapeError> {
        let site = SourceId::GlobalTenders;
        let document = Html::parse_document(html);
        let row_sel = selector(site, "tr[id^='tender_GT']")?;
        let grid_sel = selector(site, "div.row")?;
        let cell_sel = selector(site, "div")?;
        let link_sel = selector(site, "a.btn-sdetail")?;

        let mut listings = Vec::new();
        for row in document.select(&row_sel) {
            let Some(grid) = row.select(&grid_sel).next() else {
                debug!(row_id = ?row.value().id(), "tender row without detail grid");
                continue;
            };

            let cells: Vec<String> = grid
                .select(&cell_sel)
                .map(|cell| element_text(cell).unwrap_or_default())
                .collect();
            let mut fields: HashMap<String, String> = HashMap::new();
            // The last pair holds the action buttons.
            let mut i = 0;
            while i + 2 < cells.len() {
                let key = cells[i].trim_end_matches(':').trim().to_lowercase();
                fields.insert(key, cells[i + 1].to_lowercase());
                i += 2;
            }

            let title = fields.get("description").cloned().unwrap_or_default();
            if title.is_empty() {
                continue;
            }
            let notice_type = fields.get("notice type").cloned().unwrap_or_default();
            let url = row
                .select(&link_sel)
                .next()
                .and_then(|a| a.value().attr("href"))
                .map(|href| self.absolute_url(href.trim()))
                .unwrap_or_default();

            listings.push(RawListing {
                source: site,
                organization: fields.get("authority").cloned().unwrap_or_default(),
                posted_date: String::new(),
                closing_date: fields.get("action deadline").map(|d| convert_date(d)),
                location: fields.get("country").cloned().unwrap_or_default(),
                url,
                content: format!("{title} - {notice_type}"),
                budget: None,
                title,
            });
        }
        Ok(listings)
    }
}

/// `05 mar 2026` -> `2026-03-05`; unparseable input is passed through for ingest to reject.
fn convert_date(raw: &str) -> String {
    NaiveDate::parse_from_str(raw.trim(), "%d %b %Y")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|_| raw.trim().to_string())
}

#[async_trait]
impl SourceAdapter for GlobalTendersAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::GlobalTenders
    }

    async fn fetch_raw_listings(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawListing>, ScrapeError> {
        let response = http
            .get(ctx.run_id, self.source_id().as_str(), &self.listing_url)
            .await
            .map_err(|error| ScrapeError::Fetch {
                site: SourceId::GlobalTenders,
                error,
            })?;
        self.parse_listing(&response.text())
    }
}
