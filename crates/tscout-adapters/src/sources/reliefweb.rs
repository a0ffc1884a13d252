//! ReliefWeb jobs API (tender notices are a job type there).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tscout_core::{RawListing, SourceId};
use tscout_storage::HttpFetcher;

use super::{ScrapeError, SourceAdapter, SourceSettings};
use crate::AdapterContext;

const API_URL: &str = "https://api.reliefweb.int/v1/jobs?appname=tender-scout";
const TENDER_TYPE_ID: &str = "264";
const SOMALIA_COUNTRY_ID: &str = "216";

/// API filter condition selecting the country.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CountryFilter {
    Id(String),
    Name(String),
}

impl CountryFilter {
    fn condition(&self) -> serde_json::Value {
        match self {
            Self::Id(id) => json!({ "field": "country.id", "value": id }),
            Self::Name(name) => json!({ "field": "country.name", "value": name }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReliefWebAdapter {
    api_url: String,
    limit: u32,
    country: CountryFilter,
    country_name: String,
}

impl Default for ReliefWebAdapter {
    fn default() -> Self {
        Self {
            api_url: API_URL.to_string(),
            limit: 20,
            country: CountryFilter::Id(SOMALIA_COUNTRY_ID.to_string()),
            country_name: "Somalia".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    data: Vec<ApiItem>,
}

#[derive(Debug, Deserialize)]
struct ApiItem {
    #[serde(default)]
    fields: ApiFields,
}

#[derive(Debug, Default, Deserialize)]
struct ApiFields {
    #[serde(default)]
    title: String,
    #[serde(default)]
    source: Vec<ApiOrganization>,
    #[serde(default)]
    date: ApiDates,
    #[serde(default)]
    url: String,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiOrganization {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiDates {
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    closing: Option<String>,
}

impl ReliefWebAdapter {
    pub fn from_settings(settings: &SourceSettings) -> Self {
        let mut adapter = Self::default();
        if let Some(url) = &settings.listing_url {
            adapter.api_url = url.clone();
        }
        if let Some(limit) = settings.limit {
            adapter.limit = limit.max(1);
        }
        let country = settings
            .country
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        if let Some(country) = country {
            adapter.country = CountryFilter::Name(country.to_string());
            adapter.country_name = country.to_string();
        }
        adapter
    }

    fn payload(&self) -> serde_json::Value {
        json!({
            "offset": 0,
            "limit": self.limit,
            "filter": {
                "operator": "AND",
                "conditions": [
                    { "field": "type.id", "value": TENDER_TYPE_ID },
                    self.country.condition(),
                ],
            },
            "fields": { "include": ["title", "source.name", "date.created", "date.closing", "url", "body"] },
            "preset": "latest",
            "profile": "list",
        })
    }

    /// Convert an API response body into listings.
    pub fn parse_listing(&self, body: &str) -> Result<Vec<RawListing>, ScrapeError> {
        let response: ApiResponse = serde_json::from_str(body)
            .map_err(|e| ScrapeError::parse(SourceId::ReliefWeb, e.to_string()))?;

        Ok(response
            .data
            .into_iter()
            .map(|item| item.fields)
            .filter(|fields| !fields.title.trim().is_empty())
            .map(|fields| {
                let title = fields.title.trim().to_lowercase();
                let content = fields
                    .body
                    .as_deref()
                    .map(str::trim)
                    .filter(|b| !b.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| title.clone());
                RawListing {
                    source: SourceId::ReliefWeb,
                    organization: fields
                        .source
                        .first()
                        .map(|org| org.name.trim().to_lowercase())
                        .unwrap_or_default(),
                    posted_date: date_part(fields.date.created.as_deref()).unwrap_or_default(),
                    closing_date: date_part(fields.date.closing.as_deref()),
                    location: self.country_name.clone(),
                    url: fields.url.trim().to_string(),
                    content,
                    budget: None,
                    title,
                }
            })
            .collect())
    }
}

/// `2026-02-11T00:00:00+00:00` -> `2026-02-11`.
fn date_part(raw: Option<&str>) -> Option<String> {
    raw.map(|r| r.split('T').next().unwrap_or(r).trim().to_string())
        .filter(|d| !d.is_empty())
}

#[async_trait]
impl SourceAdapter for ReliefWebAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::ReliefWeb
    }

    async fn fetch_raw_listings(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawListing>, ScrapeError> {
        let response = http
            .post_json(ctx.run_id, self.source_id().as_str(), &self.api_url, &self.payload())
            .await
            .map_err(|error| ScrapeError::Fetch {
                site: SourceId::ReliefWeb,
                error,
            })?;
        self.parse_listing(&response.text())
    }
}
