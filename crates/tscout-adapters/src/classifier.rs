//! Classification capability and the OpenAI-compatible chat-completions client.
//!
//! Model output is validated against a fixed schema before it is trusted. A
//! response that does not conform is a [`ClassifyError::Malformed`], never a
//! best-effort guess.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;
use tscout_core::{ClassificationResult, CriteriaConfig, Tender};
use tscout_storage::{FetchError, HttpFetcher};
use uuid::Uuid;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a procurement analyst screening public tenders for a \
technology services company. Judge the tender strictly on the information given. For every \
criterion listed, answer `met` only when the tender text explicitly supports it, `not_met` when \
it contradicts it, and `unknown` when the tender does not say. Set `qualified` to true only when \
every criterion is `met`. Keep the rationale to one or two sentences.";

const CONTENT_LIMIT: usize = 8_000;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classification timed out after {0:?}")]
    Timeout(Duration),
    #[error("classification request failed: {0}")]
    Transport(#[from] FetchError),
    #[error("classification request rejected: {0}")]
    Rejected(String),
    #[error("malformed classifier output: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Decide whether `tender` satisfies `criteria`. Must fail rather than
    /// return a default verdict.
    async fn classify(
        &self,
        tender: &Tender,
        criteria: &CriteriaConfig,
    ) -> Result<ClassificationResult, ClassifyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Met,
    NotMet,
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelOutput {
    qualified: bool,
    rationale: String,
    criteria: Vec<CriterionOutput>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CriterionOutput {
    criterion: String,
    verdict: Verdict,
}

fn same_criterion(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Validate raw model JSON against the verdict schema and the expected criteria.
///
/// Every expected criterion must be answered exactly once and no others may
/// appear. A claimed qualification with any criterion not `met` is downgraded
/// to unqualified.
pub fn interpret_model_output(
    tender_key: &str,
    raw: &str,
    expected_criteria: &[String],
) -> Result<ClassificationResult, ClassifyError> {
    let output: ModelOutput =
        serde_json::from_str(raw).map_err(|e| ClassifyError::Malformed(e.to_string()))?;

    let rationale = output.rationale.trim().to_string();
    if rationale.is_empty() {
        return Err(ClassifyError::Malformed("empty rationale".into()));
    }

    for expected in expected_criteria {
        let answers = output
            .criteria
            .iter()
            .filter(|c| same_criterion(&c.criterion, expected))
            .count();
        if answers != 1 {
            return Err(ClassifyError::Malformed(format!(
                "criterion `{expected}` answered {answers} times"
            )));
        }
    }
    if let Some(extra) = output
        .criteria
        .iter()
        .find(|c| !expected_criteria.iter().any(|e| same_criterion(e, &c.criterion)))
    {
        return Err(ClassifyError::Malformed(format!(
            "unexpected criterion `{}`",
            extra.criterion
        )));
    }

    let unmet: Vec<&str> = output
        .criteria
        .iter()
        .filter(|c| c.verdict != Verdict::Met)
        .map(|c| c.criterion.as_str())
        .collect();
    let (qualified, rationale) = if output.qualified && !unmet.is_empty() {
        (
            false,
            format!("{rationale} (not confirmed: {})", unmet.join("; ")),
        )
    } else {
        (output.qualified, rationale)
    };

    Ok(ClassificationResult {
        tender_key: tender_key.to_string(),
        qualified,
        rationale,
    })
}

#[derive(Debug, Clone)]
pub struct ChatCompletionsConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub system_prompt: String,
}

/// Classifier backed by an OpenAI-compatible `/chat/completions` endpoint with
/// JSON-schema structured output.
pub struct ChatCompletionsClassifier {
    http: HttpFetcher,
    config: ChatCompletionsConfig,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

impl ChatCompletionsClassifier {
    pub fn new(http: HttpFetcher, config: ChatCompletionsConfig) -> Self {
        Self { http, config }
    }

    fn request_body(&self, tender: &Tender, criteria: &[String]) -> serde_json::Value {
        let content: String = tender.raw_content.chars().take(CONTENT_LIMIT).collect();
        let user = json!({
            "criteria": criteria,
            "tender": {
                "title": tender.title,
                "organization": tender.organization,
                "location": tender.location,
                "posted_date": tender.posted_date,
                "closing_date": tender.closing_date,
                "budget": tender.budget,
                "url": tender.url,
                "content": content,
            },
        });

        json!({
            "model": self.config.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": self.config.system_prompt },
                { "role": "user", "content": user.to_string() },
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "tender_verdict",
                    "strict": true,
                    "schema": verdict_schema(),
                },
            },
        })
    }
}

fn verdict_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["qualified", "rationale", "criteria"],
        "properties": {
            "qualified": { "type": "boolean" },
            "rationale": { "type": "string" },
            "criteria": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["criterion", "verdict"],
                    "properties": {
                        "criterion": { "type": "string" },
                        "verdict": { "type": "string", "enum": ["met", "not_met", "unknown"] },
                    },
                },
            },
        },
    })
}

#[async_trait]
impl Classifier for ChatCompletionsClassifier {
    async fn classify(
        &self,
        tender: &Tender,
        criteria: &CriteriaConfig,
    ) -> Result<ClassificationResult, ClassifyError> {
        let expected = criteria.model_criteria();
        let request = self
            .http
            .client()
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&self.request_body(tender, &expected));

        let response = self
            .http
            .send(Uuid::nil(), "classifier", request)
            .await
            .map_err(|err| match err {
                FetchError::HttpStatus { status, url } => {
                    ClassifyError::Rejected(format!("http status {status} from {url}"))
                }
                other => ClassifyError::Transport(other),
            })?;

        let content = completion_content(&response.body)?;
        debug!(dedup_key = %tender.dedup_key, "classifier responded");

        interpret_model_output(&tender.dedup_key, &content, &expected)
    }
}

/// Message content of the first choice. Refusals are `Rejected`; truncated
/// or empty completions are `Malformed`.
fn completion_content(body: &[u8]) -> Result<String, ClassifyError> {
    let completion: CompletionResponse = serde_json::from_slice(body)
        .map_err(|e| ClassifyError::Malformed(format!("completion envelope: {e}")))?;
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ClassifyError::Malformed("completion has no choices".into()))?;
    if let Some(refusal) = choice.message.refusal {
        return Err(ClassifyError::Rejected(format!("model refused: {refusal}")));
    }
    if choice.finish_reason.as_deref() == Some("length") {
        return Err(ClassifyError::Malformed("completion truncated".into()));
    }
    choice
        .message
        .content
        .ok_or_else(|| ClassifyError::Malformed("completion has no content".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected() -> Vec<String> {
        vec![
            "sector is one of: software, erp".to_string(),
            "not hardware-only".to_string(),
        ]
    }

    #[test]
    fn full_positive_match_qualifies() {
        let raw = r#"{"qualified": true, "rationale": "ERP rollout.", "criteria": [
            {"criterion": "sector is one of: software, erp", "verdict": "met"},
            {"criterion": "Not hardware-only", "verdict": "met"}]}"#;
        let result = interpret_model_output("reliefweb:/1", raw, &expected()).unwrap();
        assert!(result.qualified);
        assert_eq!(result.tender_key, "reliefweb:/1");
        assert_eq!(result.rationale, "ERP rollout.");
    }

    #[test]
    fn claimed_qualification_with_unknown_criterion_is_downgraded() {
        let raw = r#"{"qualified": true, "rationale": "Looks relevant.", "criteria": [
            {"criterion": "sector is one of: software, erp", "verdict": "met"},
            {"criterion": "not hardware-only", "verdict": "unknown"}]}"#;
        let result = interpret_model_output("reliefweb:/1", raw, &expected()).unwrap();
        assert!(!result.qualified);
        assert!(result.rationale.contains("not hardware-only"));
    }

    #[test]
    fn missing_or_extra_criteria_are_malformed() {
        let missing = r#"{"qualified": false, "rationale": "No.", "criteria": [
            {"criterion": "not hardware-only", "verdict": "met"}]}"#;
        assert!(matches!(
            interpret_model_output("k", missing, &expected()),
            Err(ClassifyError::Malformed(_))
        ));

        let extra = r#"{"qualified": false, "rationale": "No.", "criteria": [
            {"criterion": "sector is one of: software, erp", "verdict": "met"},
            {"criterion": "not hardware-only", "verdict": "met"},
            {"criterion": "budget over 1m", "verdict": "met"}]}"#;
        assert!(matches!(
            interpret_model_output("k", extra, &expected()),
            Err(ClassifyError::Malformed(_))
        ));
    }

    #[test]
    fn loosely_shaped_output_is_rejected() {
        for raw in [
            r#"{"qualified": "yes", "rationale": "x", "criteria": []}"#,
            r#"{"qualified": true, "rationale": "x"}"#,
            r#"{"qualified": true, "rationale": "x", "criteria": [], "score": 0.9}"#,
            r#"{"qualified": true, "rationale": "  ", "criteria": []}"#,
            r#"{"qualified": true, "rationale": "x", "criteria": [{"criterion": "a", "verdict": "probably"}]}"#,
            "Sure! Here is the JSON you asked for",
        ] {
            assert!(
                matches!(interpret_model_output("k", raw, &[]), Err(ClassifyError::Malformed(_))),
                "accepted {raw}"
            );
        }
    }

    #[test]
    fn no_model_criteria_means_plain_verdict() {
        let raw = r#"{"qualified": true, "rationale": "Fits.", "criteria": []}"#;
        assert!(interpret_model_output("k", raw, &[]).unwrap().qualified);
    }

    #[test]
    fn completion_envelope_yields_first_choice_content() {
        let body = br#"{"choices": [{"message": {"role": "assistant", "content": "{}"}, "finish_reason": "stop"}]}"#;
        assert_eq!(completion_content(body).unwrap(), "{}");
    }

    #[test]
    fn refused_truncated_or_empty_completions_fail() {
        let refused = br#"{"choices": [{"message": {"content": null, "refusal": "cannot help"}}]}"#;
        assert!(matches!(completion_content(refused), Err(ClassifyError::Rejected(_))));

        let truncated = br#"{"choices": [{"message": {"content": "{\"qual"}, "finish_reason": "length"}]}"#;
        assert!(matches!(completion_content(truncated), Err(ClassifyError::Malformed(_))));

        let unusable: [&[u8]; 3] = [
            br#"{"choices": []}"#,
            br#"{"choices": [{"message": {}}]}"#,
            b"<html>bad gateway</html>",
        ];
        for body in unusable {
            assert!(matches!(completion_content(body), Err(ClassifyError::Malformed(_))));
        }
    }

    #[test]
    fn request_carries_criteria_tender_and_strict_schema() {
        use chrono::{TimeZone, Utc};
        use tscout_core::{ProcessingState, SourceId};
        use tscout_storage::HttpClientConfig;

        let seen = Utc.with_ymd_and_hms(2026, 2, 11, 8, 0, 0).single().unwrap();
        let tender = Tender {
            seq: 1,
            dedup_key: "reliefweb:/t/1".into(),
            source: SourceId::ReliefWeb,
            title: "erp rollout".into(),
            organization: "ministry of finance".into(),
            posted_date: None,
            closing_date: None,
            location: "somalia".into(),
            url: None,
            raw_content: "x".repeat(CONTENT_LIMIT + 100),
            budget: Some(250_000.0),
            processing_state: ProcessingState::New,
            notification_state: None,
            classify_attempts: 0,
            first_seen_at: seen,
            last_seen_at: seen,
            classified_at: None,
            notified_at: None,
            last_error: None,
        };
        let classifier = ChatCompletionsClassifier::new(
            HttpFetcher::new(HttpClientConfig::default()).unwrap(),
            ChatCompletionsConfig {
                endpoint: "http://localhost/v1/chat/completions".into(),
                model: "test-model".into(),
                api_key: "key".into(),
                system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            },
        );

        let body = classifier.request_body(&tender, &expected());
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
        assert_eq!(body["messages"][0]["role"], "system");

        let user: serde_json::Value =
            serde_json::from_str(body["messages"][1]["content"].as_str().unwrap()).unwrap();
        assert_eq!(user["criteria"][1], "not hardware-only");
        assert_eq!(user["tender"]["budget"], 250_000.0);
        assert_eq!(user["tender"]["content"].as_str().unwrap().len(), CONTENT_LIMIT);
    }
}
