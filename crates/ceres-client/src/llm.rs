use std::fmt::Write as _;
use std::time::Duration;

use ceres_core::error::AppError;
use ceres_core::traits::{EstimateRequest, PriceEstimate, PriceEstimator};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SYSTEM_PROMPT: &str = "You estimate current retail prices of food commodities in Turkey in Turkish lira. Use the observation history and the prices of comparable products you are given. Respond ONLY with JSON matching the requested schema. Set price to null when the data gives no reasonable basis.";
/// Observations included in the prompt.
const PROMPT_HISTORY: usize = 30;
const PROMPT_COMPARABLES: usize = 15;

/// OpenAI-compatible chat client used as the last-resort price estimator.
///
/// Works with any OpenAI-compatible API, including:
/// - OpenAI directly (`https://api.openai.com/v1`)
/// - Gemini via compatibility layer (`https://generativelanguage.googleapis.com/v1beta/openai`)
#[derive(Clone)]
pub struct OpenAiEstimator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    system_prompt: String,
}

impl OpenAiEstimator {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, model, base_url, DEFAULT_LLM_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        let prompt = self.system_prompt.clone();
        Ok(Self::build(&self.api_key, &self.model, &self.base_url, timeout)?.with_system_prompt(prompt))
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Reads `OPENAI_API_KEY`, `OPENAI_MODEL` and `OPENAI_BASE_URL`.
    /// Returns `Ok(None)` when no key is configured.
    pub fn from_env() -> Result<Option<Self>, AppError> {
        let Some(key) = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()) else {
            return Ok(None);
        };
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::with_base_url(&key, &model, &base_url).map(Some)
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::NetworkError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: timeout.as_secs(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        })
    }
}

/// The user message describing the product and its price context.
pub fn build_prompt(request: &EstimateRequest) -> String {
    let product = &request.product;
    let mut prompt = format!(
        "Product: {} (category: {}, unit: {})\nDate: {}\n",
        product.name,
        product.category,
        product.unit,
        request.now.format("%Y-%m-%d")
    );

    if request.history.is_empty() {
        prompt.push_str("\nNo observations recorded for this product.\n");
    } else {
        prompt.push_str("\nObservations (newest first):\n");
        for obs in request.history.iter().take(PROMPT_HISTORY) {
            let _ = writeln!(
                prompt,
                "- {} {}: {:.2} TL/{} ({})",
                obs.observed_at.format("%Y-%m-%d"),
                obs.source_id,
                obs.price,
                obs.unit,
                obs.quality.as_str()
            );
        }
    }

    if !request.comparables.is_empty() {
        prompt.push_str("\nCurrent prices in the same category:\n");
        for (other, price) in request.comparables.iter().take(PROMPT_COMPARABLES) {
            let _ = writeln!(prompt, "- {}: {:.2} TL/{}", other.name, price.price, price.unit);
        }
    }

    let _ = write!(
        prompt,
        "\nEstimate the current price per {} of {}.",
        product.unit, product.name
    );
    prompt
}

fn response_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "price": { "type": ["number", "null"] },
            "unit": { "type": "string" },
            "rationale": { "type": "string" }
        },
        "required": ["price", "unit", "rationale"],
        "additionalProperties": false
    })
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchemaWrapper,
}

#[derive(Serialize)]
struct JsonSchemaWrapper {
    name: &'static str,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Deserialize)]
struct EstimateAnswer {
    price: Option<f64>,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    rationale: String,
}

/// Turns the model's JSON answer into an estimate. A null, zero or
/// non-finite price means "no estimate".
fn parse_answer(content: &str, default_unit: &str) -> Result<Option<PriceEstimate>, AppError> {
    let answer: EstimateAnswer =
        serde_json::from_str(content.trim()).map_err(|e| AppError::EstimationError {
            message: format!("model returned invalid JSON: {e}"),
            status_code: 200,
            retryable: false,
        })?;
    Ok(answer
        .price
        .filter(|p| p.is_finite() && *p > 0.0)
        .map(|price| PriceEstimate {
            price,
            unit: if answer.unit.trim().is_empty() {
                default_unit.to_string()
            } else {
                answer.unit
            },
            rationale: answer.rationale,
        }))
}

impl PriceEstimator for OpenAiEstimator {
    async fn estimate(&self, request: &EstimateRequest) -> Result<Option<PriceEstimate>, AppError> {
        let url = format!("{}/chat/completions", self.base_url);

        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system",
                    content: self.system_prompt.clone(),
                },
                Message {
                    role: "user",
                    content: build_prompt(request),
                },
            ],
            response_format: ResponseFormat {
                format_type: "json_schema",
                json_schema: JsonSchemaWrapper {
                    name: "price_estimate",
                    strict: true,
                    schema: response_schema(),
                },
            },
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else {
                    AppError::NetworkError(format!("Estimator request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status_code}: {body}"));

            if status_code == 429 {
                return Err(AppError::RateLimitExceeded);
            }
            return Err(AppError::EstimationError {
                message,
                status_code,
                retryable: status_code >= 500,
            });
        }

        let chat: ChatResponse = response.json().await.map_err(|e| AppError::EstimationError {
            message: format!("Failed to parse model response: {e}"),
            status_code: 200,
            retryable: false,
        })?;

        let content = chat
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| AppError::EstimationError {
                message: "Empty response from model".into(),
                status_code: 200,
                retryable: false,
            })?;

        let estimate = parse_answer(content, &request.product.unit)?;
        tracing::debug!(
            product = %request.product.key,
            price = ?estimate.as_ref().map(|e| e.price),
            "Model estimate"
        );
        Ok(estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ceres_core::models::{ActivePrice, MatchQuality, PriceBasis, PriceObservation, Product};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn product(key: &str, name: &str) -> Product {
        Product {
            key: key.into(),
            name: name.into(),
            category: "sebze".into(),
            unit: "kg".into(),
            search_term: None,
            aliases: vec![],
        }
    }

    fn request() -> EstimateRequest {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        EstimateRequest {
            product: product("domates", "Domates"),
            history: vec![PriceObservation {
                id: Uuid::new_v4(),
                product_key: "domates".into(),
                source_id: "hal".into(),
                price: 24.5,
                unit: "kg".into(),
                observed_at: now - chrono::TimeDelta::days(40),
                recorded_at: now - chrono::TimeDelta::days(40),
                quality: MatchQuality::Exact,
            }],
            comparables: vec![(
                product("biber", "Biber"),
                ActivePrice {
                    id: Uuid::new_v4(),
                    product_key: "biber".into(),
                    price: 55.0,
                    unit: "kg".into(),
                    basis: PriceBasis::Source("tzob".into()),
                    confidence: 0.9,
                    base_price: 55.0,
                    seasonal_factor: 1.0,
                    stale: false,
                    computed_at: now,
                    is_current: true,
                },
            )],
            now,
        }
    }

    #[test]
    fn test_prompt_lists_history_and_comparables() {
        let prompt = build_prompt(&request());
        assert!(prompt.contains("Product: Domates (category: sebze, unit: kg)"));
        assert!(prompt.contains("2026-01-29 hal: 24.50 TL/kg (exact)"));
        assert!(prompt.contains("- Biber: 55.00 TL/kg"));
        assert!(prompt.ends_with("Estimate the current price per kg of Domates."));
    }

    #[test]
    fn test_parses_answers() {
        let estimate = parse_answer(r#"{"price": 31.2, "unit": "", "rationale": "trend"}"#, "kg")
            .unwrap()
            .unwrap();
        assert_eq!(estimate.price, 31.2);
        assert_eq!(estimate.unit, "kg");

        assert!(
            parse_answer(r#"{"price": null, "unit": "kg", "rationale": "no data"}"#, "kg")
                .unwrap()
                .is_none()
        );
        assert!(parse_answer(r#"{"price": -3, "unit": "kg", "rationale": ""}"#, "kg").unwrap().is_none());

        let err = parse_answer("not json", "kg").unwrap_err();
        assert_eq!(err.code(), "estimation_error");
    }

    #[test]
    fn test_schema_requires_every_field() {
        let schema = response_schema();
        assert_eq!(schema["required"].as_array().unwrap().len(), 3);
    }
}
