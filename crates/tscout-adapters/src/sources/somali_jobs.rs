use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate};
use scraper::Html;
use tscout_core::{RawListing, SourceId};
use tscout_storage::HttpFetcher;

use super::{element_text, first_text, selector, ScrapeError, SourceAdapter, SourceSettings};
use crate::AdapterContext;

const LISTING_URL: &str = "https://somalijobs.com/tenders";
const BASE_URL: &str = "https://somalijobs.com";
const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

#[derive(Debug, Clone)]
pub struct SomaliJobsAdapter {
    listing_url: String,
}

impl Default for SomaliJobsAdapter {
    fn default() -> Self {
        Self {
            listing_url: LISTING_URL.to_string(),
        }
    }
}

impl SomaliJobsAdapter {
    pub fn from_settings(settings: &SourceSettings) -> Self {
        Self {
            listing_url: settings
                .listing_url
                .clone()
                .unwrap_or_else(|| LISTING_URL.to_string()),
        }
    }

    /// Parse listing cards. Dates on the cards are relative to `today`.
    pub fn parse_listing(&self, html: &str, today: NaiveDate) -> Result<Vec<RawListing>, ScrapeError> {
        let site = SourceId::SomaliJobs;
        let document = Html::parse_document(html);
        let card_sel = selector(site, "a.jobs-listing-container")?;
        let title_sel = selector(site, "h2.jobs-listing-title")?;
        let detail_sel = selector(site, "div.jobs-listing-card")?;
        let advertiser_sel = selector(site, "span.uppercase")?;
        let span_sel = selector(site, "span")?;

        let mut listings = Vec::new();
        for card in document.select(&card_sel) {
            let title = first_text(card, &title_sel)
                .map(|t| t.to_lowercase())
                .unwrap_or_default();
            if title.is_empty() {
                continue;
            }
            let organization = card
                .select(&detail_sel)
                .next()
                .and_then(|detail| first_text(detail, &advertiser_sel))
                .map(|o| o.to_lowercase())
                .unwrap_or_default();

            let mut posted_date = String::new();
            let mut location = String::new();
            for detail in card.select(&detail_sel) {
                let Some(text) = detail.select(&span_sel).next().and_then(element_text) else {
                    continue;
                };
                if looks_like_date(&text) {
                    posted_date = convert_relative_date(&text, today);
                } else if !text.eq_ignore_ascii_case(&organization) {
                    location = text;
                }
            }

            let url = card
                .value()
                .attr("href")
                .map(str::trim)
                .filter(|href| !href.is_empty())
                .map(|href| {
                    if href.starts_with("http") {
                        href.to_string()
                    } else {
                        format!("{BASE_URL}{href}")
                    }
                })
                .unwrap_or_default();

            listings.push(RawListing {
                source: site,
                organization,
                posted_date,
                closing_date: None,
                location,
                url,
                content: title.clone(),
                budget: None,
                title,
            });
        }
        Ok(listings)
    }
}

fn looks_like_date(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower == "today"
        || lower == "yesterday"
        || (MONTHS.iter().any(|m| lower.starts_with(m)) && lower.chars().any(|c| c.is_ascii_digit()))
}

/// `Today`, `Yesterday` or `Jan, 28`. Month-day dates later in the year than
/// `today` belong to the previous year.
fn convert_relative_date(raw: &str, today: NaiveDate) -> String {
    let lower = raw.trim().to_lowercase();
    let date = match lower.as_str() {
        "today" => Some(today),
        "yesterday" => Some(today - Duration::days(1)),
        _ => {
            let cleaned = lower.replace(',', " ");
            let mut parts = cleaned.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(month), Some(day), None) => {
                    let month_no = MONTHS
                        .iter()
                        .position(|m| month.starts_with(m))
                        .map(|i| i as u32 + 1);
                    let day_no = day.parse::<u32>().ok();
                    match (month_no, day_no) {
                        (Some(m), Some(d)) => {
                            let year = if m <= today.month() {
                                today.year()
                            } else {
                                today.year() - 1
                            };
                            NaiveDate::from_ymd_opt(year, m, d)
                        }
                        _ => None,
                    }
                }
                _ => None,
            }
        }
    };
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| raw.trim().to_string())
}

#[async_trait]
impl SourceAdapter for SomaliJobsAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::SomaliJobs
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
                site: SourceId::SomaliJobs,
                error,
            })?;
        self.parse_listing(&response.text(), ctx.fetched_at.date_naive())
    }
}
