//! Notifier: renders qualified tenders and dispatches them through a transport.

use askama::Template;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use tscout_adapters::Transport;
use tscout_core::Tender;
use tscout_storage::{DeliveryOutcome, LedgerError};

use crate::context::RunContext;

const HASHTAG_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifyOutcome {
    pub tender_key: String,
    pub delivered: bool,
}

/// Telegram-flavoured HTML alert; askama escapes every interpolated field.
#[derive(Template)]
#[template(path = "tender_alert.html")]
struct TenderAlert<'a> {
    title: &'a str,
    organization: &'a str,
    location: &'a str,
    posted_date: String,
    closing_date: String,
    excerpt: String,
    url: Option<&'a str>,
    source: &'static str,
    hashtags: String,
}

fn excerpt(content: &str, max_chars: usize) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(max_chars).collect();
    if let Some(space) = cut.rfind(' ') {
        cut.truncate(space);
    }
    cut.push('…');
    cut
}

/// Words longer than three characters from title and organization, as
/// hashtags, first occurrence order, capped at 50 characters.
fn hashtags(tender: &Tender) -> String {
    let mut words: Vec<&str> = Vec::new();
    for word in tender
        .title
        .split_whitespace()
        .chain(tender.organization.split_whitespace())
    {
        if word.chars().count() > 3 && !words.contains(&word) {
            words.push(word);
        }
    }
    words
        .iter()
        .map(|w| format!("#{w}"))
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(HASHTAG_LIMIT)
        .collect()
}

fn date_or_na(date: Option<chrono::NaiveDate>) -> String {
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "n/a".to_string())
}

/// Render the alert message for one tender.
pub fn render_message(tender: &Tender, excerpt_chars: usize) -> Result<String, askama::Error> {
    TenderAlert {
        title: &tender.title,
        organization: &tender.organization,
        location: &tender.location,
        posted_date: date_or_na(tender.posted_date),
        closing_date: date_or_na(tender.closing_date),
        excerpt: excerpt(&tender.raw_content, excerpt_chars),
        url: tender.url.as_deref(),
        source: tender.source.as_str(),
        hashtags: hashtags(tender),
    }
    .render()
}

/// Deliver every qualified tender whose notification is pending or failed.
///
/// Each tender is claimed before dispatch and gets exactly one attempt per
/// run; failures stay `send_failed` for the next run.
pub async fn notify(
    ctx: &mut RunContext,
    transport: &dyn Transport,
    excerpt_chars: usize,
) -> Result<Vec<NotifyOutcome>, LedgerError> {
    let candidates = ctx.ledger.notification_candidates().await?;
    let mut outcomes = Vec::with_capacity(candidates.len());

    for tender in candidates {
        let Some(from) = tender.notification_state else {
            continue;
        };
        if !ctx.ledger.claim_delivery(&tender.dedup_key, from, Utc::now()).await? {
            info!(dedup_key = %tender.dedup_key, "delivery claimed by another run");
            continue;
        }

        let result = match render_message(&tender, excerpt_chars) {
            Ok(message) => {
                let span =
                    info_span!("deliver", dedup_key = %tender.dedup_key, transport = transport.name());
                transport
                    .deliver(&message)
                    .instrument(span)
                    .await
                    .map_err(|err| err.to_string())
            }
            Err(err) => Err(format!("rendering alert: {err}")),
        };

        let (outcome, error) = match result {
            Ok(()) => (DeliveryOutcome::Sent, None),
            Err(err) => {
                warn!(dedup_key = %tender.dedup_key, error = %err, "notification failed");
                (DeliveryOutcome::Failed, Some(err))
            }
        };
        let recorded = ctx
            .ledger
            .finish_delivery(&tender.dedup_key, outcome, error.as_deref(), Utc::now())
            .await?;
        if !recorded {
            warn!(dedup_key = %tender.dedup_key, "delivery claim was released before completion");
        }

        match outcome {
            DeliveryOutcome::Sent => ctx.run.counts.notified += 1,
            DeliveryOutcome::Failed => ctx.run.counts.failed += 1,
        }
        outcomes.push(NotifyOutcome {
            tender_key: tender.dedup_key,
            delivered: outcome == DeliveryOutcome::Sent,
        });
    }
    Ok(outcomes)
}
