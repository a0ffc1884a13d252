//! Read-only JSON status API over the tender ledger.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use tscout_core::{ProcessingState, RunRecord, Tender};
use tscout_storage::{Ledger, LedgerError};

pub const CRATE_NAME: &str = "tscout-web";

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
}

impl AppState {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TendersQuery {
    state: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct StatsBody {
    total: u64,
    states: Vec<StateCount>,
    last_run: Option<RunRecord>,
}

#[derive(Debug, Serialize)]
struct StateCount {
    state: ProcessingState,
    count: u64,
}

/// Trimmed tender view; raw content stays in the ledger.
#[derive(Debug, Serialize)]
struct TenderRow {
    dedup_key: String,
    source: String,
    title: String,
    organization: String,
    closing_date: Option<String>,
    url: Option<String>,
    processing_state: ProcessingState,
    notification_state: Option<String>,
    classify_attempts: u32,
    last_error: Option<String>,
}

impl From<Tender> for TenderRow {
    fn from(t: Tender) -> Self {
        Self {
            dedup_key: t.dedup_key,
            source: t.source.to_string(),
            title: t.title,
            organization: t.organization,
            closing_date: t.closing_date.map(|d| d.format("%Y-%m-%d").to_string()),
            url: t.url,
            processing_state: t.processing_state,
            notification_state: t.notification_state.map(|s| s.to_string()),
            classify_attempts: t.classify_attempts,
            last_error: t.last_error,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/runs", get(runs_handler))
        .route("/tenders", get(tenders_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(ledger: Ledger, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "status api listening");
    axum::serve(listener, app(AppState::new(ledger))).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let result = async {
        let total = state.ledger.count_tenders().await?;
        let states = state
            .ledger
            .state_counts()
            .await?
            .into_iter()
            .map(|(state, count)| StateCount { state, count })
            .collect();
        let last_run = state.ledger.recent_runs(1).await?.into_iter().next();
        Ok::<_, LedgerError>(StatsBody {
            total,
            states,
            last_run,
        })
    }
    .await;

    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => server_error(err),
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    match state.ledger.recent_runs(clamp_limit(query.limit)).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

async fn tenders_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TendersQuery>,
) -> Response {
    let filter = match query.state.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => match ProcessingState::from_str(raw) {
            Ok(parsed) => Some(parsed),
            Err(err) => return bad_request(err.to_string()),
        },
        None => None,
    };

    match state.ledger.list_tenders(filter, clamp_limit(query.limit)).await {
        Ok(tenders) => {
            let rows: Vec<TenderRow> = tenders.into_iter().map(TenderRow::from).collect();
            Json(rows).into_response()
        }
        Err(err) => server_error(err),
    }
}

fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn server_error(err: LedgerError) -> Response {
    error!(error = %err, "ledger query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
