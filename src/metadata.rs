//! LLM metadata extraction collaborator.
//!
//! The metadata branch asks a chat model to pull structured contract facts
//! (vendor, dates, value, commercial terms, per-term risk scores) out of the
//! extracted text, validates the response, and aggregates the per-term
//! scores into a single weighted risk figure with a band and display color.
//!
//! Providers mirror the embedding side: `"disabled"` fails the branch with
//! an explanatory error, `"openai"` calls the chat completions API with the
//! same retry and backoff treatment.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;

use crate::config::MetadataConfig;
use crate::error::PipelineError;
use crate::models::FileMetadata;

/// Weights for the per-term risk scores. Liability exposure dominates,
/// followed by payment terms.
const RISK_WEIGHTS: [(&str, f64); 5] = [
    ("auto_renewal", 0.20),
    ("payment_terms", 0.25),
    ("liability_cap", 0.30),
    ("termination_for_convenience", 0.15),
    ("price_escalation", 0.10),
];

/// Raw fields as returned by the model, before validation and risk
/// aggregation. Every field is optional; absent means "not found in text".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContractFields {
    pub vendor_name: Option<String>,
    pub contract_type: Option<String>,
    pub scope_of_services: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub contract_duration: Option<String>,
    pub contract_value_local: Option<f64>,
    pub currency: Option<String>,
    pub contract_value_usd: Option<f64>,
    pub contract_status: Option<String>,

    pub auto_renewal: Option<String>,
    pub payment_terms: Option<String>,
    pub liability_cap: Option<String>,
    pub termination_for_convenience: Option<String>,
    pub price_escalation: Option<String>,

    pub auto_renewal_risk_score: Option<i64>,
    pub payment_terms_risk_score: Option<i64>,
    pub liability_cap_risk_score: Option<i64>,
    pub termination_risk_score: Option<i64>,
    pub price_escalation_risk_score: Option<i64>,

    pub confidence_score: Option<f64>,
}

#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    /// Extract structured contract fields from plain text.
    async fn extract_fields(&self, text: &str) -> Result<ContractFields, PipelineError>;
}

pub fn create_metadata_extractor(config: &MetadataConfig) -> Result<Box<dyn MetadataExtractor>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledMetadataExtractor)),
        "openai" => Ok(Box::new(OpenAIMetadataExtractor::new(config)?)),
        other => anyhow::bail!("Unknown metadata provider: {}", other),
    }
}

/// Validate model output and fold it into a persistable [`FileMetadata`].
///
/// Rejects output with no usable vendor name or with risk scores outside
/// the 0..=2 range. The total risk score is the weighted mean over the
/// scores the model actually produced, with weights renormalized so a
/// contract missing a term is not silently scored safer.
pub fn build_metadata(
    file_id: &str,
    fields: ContractFields,
    raw_text_length: usize,
) -> Result<FileMetadata, PipelineError> {
    let vendor = fields
        .vendor_name
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if vendor.is_none() {
        return Err(PipelineError::Metadata(
            "model output missing vendor_name".to_string(),
        ));
    }

    let scores = [
        ("auto_renewal", fields.auto_renewal_risk_score),
        ("payment_terms", fields.payment_terms_risk_score),
        ("liability_cap", fields.liability_cap_risk_score),
        ("termination_for_convenience", fields.termination_risk_score),
        ("price_escalation", fields.price_escalation_risk_score),
    ];
    for (name, score) in &scores {
        if let Some(s) = score {
            if !(0..=2).contains(s) {
                return Err(PipelineError::Metadata(format!(
                    "risk score out of range for {}: {}",
                    name, s
                )));
            }
        }
    }

    let (total, band, color) = aggregate_risk(&scores);

    Ok(FileMetadata {
        file_id: file_id.to_string(),
        vendor_name: vendor.map(str::to_string),
        contract_type: fields.contract_type,
        scope_of_services: fields.scope_of_services,
        start_date: fields.start_date,
        end_date: fields.end_date,
        contract_duration: fields.contract_duration,
        contract_value_local: fields.contract_value_local,
        currency: fields.currency,
        contract_value_usd: fields.contract_value_usd,
        contract_status: fields.contract_status,
        auto_renewal: fields.auto_renewal,
        payment_terms: fields.payment_terms,
        liability_cap: fields.liability_cap,
        termination_for_convenience: fields.termination_for_convenience,
        price_escalation: fields.price_escalation,
        auto_renewal_risk_score: fields.auto_renewal_risk_score,
        payment_terms_risk_score: fields.payment_terms_risk_score,
        liability_cap_risk_score: fields.liability_cap_risk_score,
        termination_risk_score: fields.termination_risk_score,
        price_escalation_risk_score: fields.price_escalation_risk_score,
        total_risk_score: total,
        risk_band: band.map(str::to_string),
        risk_color: color.map(str::to_string),
        raw_text_length: Some(raw_text_length as i64),
        extraction_timestamp: Some(Utc::now()),
        confidence_score: Some(fields.confidence_score.unwrap_or(0.95)),
    })
}

/// Weighted mean over present scores, then banded:
/// `<= 0.67` Low/green, `<= 1.33` Medium/yellow, else High/red.
fn aggregate_risk(
    scores: &[(&str, Option<i64>)],
) -> (Option<f64>, Option<&'static str>, Option<&'static str>) {
    let mut weighted_sum = 0.0;
    let mut weight_sum = 0.0;

    for (name, score) in scores {
        if let Some(s) = score {
            let weight = RISK_WEIGHTS
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, w)| *w)
                .unwrap_or(0.0);
            weighted_sum += *s as f64 * weight;
            weight_sum += weight;
        }
    }

    if weight_sum == 0.0 {
        return (None, None, None);
    }

    let total = weighted_sum / weight_sum;
    let (band, color) = if total <= 0.67 {
        ("Low", "green")
    } else if total <= 1.33 {
        ("Medium", "yellow")
    } else {
        ("High", "red")
    };
    (Some(total), Some(band), Some(color))
}

// ============ Disabled ============

pub struct DisabledMetadataExtractor;

#[async_trait]
impl MetadataExtractor for DisabledMetadataExtractor {
    async fn extract_fields(&self, _text: &str) -> Result<ContractFields, PipelineError> {
        Err(PipelineError::Metadata(
            "metadata provider is disabled".to_string(),
        ))
    }
}

// ============ OpenAI ============

pub struct OpenAIMetadataExtractor {
    model: String,
    endpoint: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIMetadataExtractor {
    pub fn new(config: &MetadataConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("metadata.model required for OpenAI provider"))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            anyhow::bail!("OPENAI_API_KEY environment variable not set");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());

        Ok(Self {
            model,
            endpoint,
            max_retries: config.max_retries,
            client,
        })
    }

    fn build_prompt(text: &str) -> String {
        format!(
            "Extract contract metadata from the document below. Respond with a single JSON \
             object and nothing else, using these keys (use null when the document does not \
             state a value): vendor_name, contract_type, scope_of_services, start_date, \
             end_date, contract_duration, contract_value_local, currency, contract_value_usd, \
             contract_status, auto_renewal, payment_terms, liability_cap, \
             termination_for_convenience, price_escalation, auto_renewal_risk_score, \
             payment_terms_risk_score, liability_cap_risk_score, termination_risk_score, \
             price_escalation_risk_score, confidence_score.\n\
             Risk scores are integers: 0 = favorable, 1 = neutral, 2 = unfavorable to the buyer. \
             Dates are ISO 8601 strings. confidence_score is a float in [0, 1].\n\n\
             Document:\n{}",
            text
        )
    }
}

#[async_trait]
impl MetadataExtractor for OpenAIMetadataExtractor {
    async fn extract_fields(&self, text: &str) -> Result<ContractFields, PipelineError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| PipelineError::Metadata("OPENAI_API_KEY not set".to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You are a contract analysis assistant. You respond only with JSON."},
                {"role": "user", "content": Self::build_prompt(text)},
            ],
            "temperature": 0.0,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| PipelineError::Metadata(e.to_string()))?;
                        return parse_completion(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(PipelineError::Metadata(format!(
                            "OpenAI API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(PipelineError::Metadata(format!(
                        "OpenAI API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(PipelineError::Metadata(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            PipelineError::Metadata("metadata extraction failed after retries".to_string())
        }))
    }
}

fn parse_completion(json: &serde_json::Value) -> Result<ContractFields, PipelineError> {
    let content = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| PipelineError::Metadata("completion missing content".to_string()))?;

    parse_fields_json(content)
}

/// Parse the model's JSON payload, tolerating a markdown code fence around
/// it but nothing else.
pub fn parse_fields_json(content: &str) -> Result<ContractFields, PipelineError> {
    let trimmed = content.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(stripped)
        .map_err(|e| PipelineError::Metadata(format!("malformed model output: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields_with_scores(scores: [Option<i64>; 5]) -> ContractFields {
        ContractFields {
            vendor_name: Some("Acme Corp".to_string()),
            auto_renewal_risk_score: scores[0],
            payment_terms_risk_score: scores[1],
            liability_cap_risk_score: scores[2],
            termination_risk_score: scores[3],
            price_escalation_risk_score: scores[4],
            ..Default::default()
        }
    }

    #[test]
    fn test_all_low_scores_band_low() {
        let md = build_metadata("f1", fields_with_scores([Some(0); 5]), 100).unwrap();
        assert_eq!(md.total_risk_score, Some(0.0));
        assert_eq!(md.risk_band.as_deref(), Some("Low"));
        assert_eq!(md.risk_color.as_deref(), Some("green"));
    }

    #[test]
    fn test_all_high_scores_band_high() {
        let md = build_metadata("f1", fields_with_scores([Some(2); 5]), 100).unwrap();
        assert_eq!(md.total_risk_score, Some(2.0));
        assert_eq!(md.risk_band.as_deref(), Some("High"));
        assert_eq!(md.risk_color.as_deref(), Some("red"));
    }

    #[test]
    fn test_all_medium_scores_band_medium() {
        let md = build_metadata("f1", fields_with_scores([Some(1); 5]), 100).unwrap();
        assert_eq!(md.total_risk_score, Some(1.0));
        assert_eq!(md.risk_band.as_deref(), Some("Medium"));
        assert_eq!(md.risk_color.as_deref(), Some("yellow"));
    }

    #[test]
    fn test_missing_scores_renormalized() {
        // Only liability (weight 0.30) present at score 2: mean is still 2.0,
        // not 0.6, because absent terms carry no weight.
        let md =
            build_metadata("f1", fields_with_scores([None, None, Some(2), None, None]), 100)
                .unwrap();
        assert_eq!(md.total_risk_score, Some(2.0));
        assert_eq!(md.risk_band.as_deref(), Some("High"));
    }

    #[test]
    fn test_weighting_tilts_toward_liability() {
        // liability 2 (0.30), payment 0 (0.25): (2*0.30)/(0.55) ≈ 1.09
        let md =
            build_metadata("f1", fields_with_scores([None, Some(0), Some(2), None, None]), 100)
                .unwrap();
        let total = md.total_risk_score.unwrap();
        assert!((total - 1.0909).abs() < 0.001);
        assert_eq!(md.risk_band.as_deref(), Some("Medium"));
    }

    #[test]
    fn test_no_scores_no_band() {
        let md = build_metadata("f1", fields_with_scores([None; 5]), 100).unwrap();
        assert_eq!(md.total_risk_score, None);
        assert_eq!(md.risk_band, None);
        assert_eq!(md.risk_color, None);
    }

    #[test]
    fn test_missing_vendor_rejected() {
        let mut fields = fields_with_scores([Some(0); 5]);
        fields.vendor_name = Some("   ".to_string());
        let err = build_metadata("f1", fields, 100).unwrap_err();
        assert!(matches!(err, PipelineError::Metadata(_)));
    }

    #[test]
    fn test_out_of_range_score_rejected() {
        let fields = fields_with_scores([Some(3), None, None, None, None]);
        let err = build_metadata("f1", fields, 100).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_parse_fields_with_code_fence() {
        let content = "```json\n{\"vendor_name\": \"Acme Corp\", \"liability_cap_risk_score\": 1}\n```";
        let fields = parse_fields_json(content).unwrap();
        assert_eq!(fields.vendor_name.as_deref(), Some("Acme Corp"));
        assert_eq!(fields.liability_cap_risk_score, Some(1));
    }

    #[test]
    fn test_parse_fields_bare_json() {
        let fields = parse_fields_json("{\"vendor_name\": \"Initech\"}").unwrap();
        assert_eq!(fields.vendor_name.as_deref(), Some("Initech"));
    }

    #[test]
    fn test_parse_fields_garbage_rejected() {
        assert!(parse_fields_json("the vendor is Acme").is_err());
    }

    #[test]
    fn test_confidence_defaults() {
        let md = build_metadata("f1", fields_with_scores([Some(0); 5]), 42).unwrap();
        assert_eq!(md.confidence_score, Some(0.95));
        assert_eq!(md.raw_text_length, Some(42));
    }
}
