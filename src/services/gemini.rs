use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::ExtractedReceipt;
use crate::services::extraction::{parse_receipt, Document, ExtractionClient, ExtractionError};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part {
    Inline { inline_data: InlineData },
    Text { text: String },
}

#[derive(Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

/// Extraction client backed by the Gemini `generateContent` endpoint.
/// One instance is built at startup and shared for every receipt.
pub struct GeminiExtractor {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiExtractor {
    pub fn new(api_key: String, model: String) -> Self {
        GeminiExtractor {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: API_BASE.to_string(),
        }
    }

    async fn call_gemini(&self, request: &GenerateRequest) -> Result<String, ExtractionError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ExtractionError::Auth {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        decode_response(&text)
    }
}

#[async_trait]
impl ExtractionClient for GeminiExtractor {
    async fn extract(&self, document: &Document) -> Result<(ExtractedReceipt, String), ExtractionError> {
        debug!(file = %document.file_name, bytes = document.bytes.len(), model = %self.model, "calling gemini");
        let request = build_request(document);
        let raw = self.call_gemini(&request).await?;
        let receipt = parse_receipt(&raw)?;
        Ok((receipt, raw))
    }
}

fn build_request(document: &Document) -> GenerateRequest {
    GenerateRequest {
        contents: vec![Content {
            parts: vec![
                Part::Inline {
                    inline_data: InlineData {
                        mime_type: document.mime_type.clone(),
                        data: general_purpose::STANDARD.encode(&document.bytes),
                    },
                },
                Part::Text {
                    text: instruction_prompt(),
                },
            ],
        }],
        generation_config: GenerationConfig {
            response_mime_type: "application/json".to_string(),
            temperature: 0.1,
        },
    }
}

// A 2xx body that does not decode is Malformed, not Transport.
fn decode_response(text: &str) -> Result<String, ExtractionError> {
    let body: GenerateResponse = serde_json::from_str(text)
        .map_err(|e| ExtractionError::Malformed(format!("undecodable response body: {}", e)))?;
    response_text(body)
}

fn response_text(body: GenerateResponse) -> Result<String, ExtractionError> {
    let text = body
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<String>()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(ExtractionError::EmptyResponse);
    }
    Ok(text.trim().to_string())
}

fn instruction_prompt() -> String {
    r#"You read grocery receipts and return structured purchase data. Return JSON only.
1. Read the receipt header and footer: the store name and location, the purchase date, and the total paid.
2. List every purchased line item with its product name exactly as printed, the quantity or weight, and the total price for that line.
   Leave out non-food lines such as carrier bags and bottle deposits, or give them a non-food category.
3. Give each item a broad category such as Produce, Dairy, Meat, Pantry, Bakery, Snacks, Beverages or Household.
4. Estimate typical calories per 100 g for each food item. Use null for non-food items.

Respond with exactly this shape:
{
  "receipt_metadata": {"store": "string", "date": "YYYY-MM-DD", "total_receipt_cost": 0.00},
  "items": [
    {"product_name": "string", "quantity_or_weight": "string", "item_total_price": 0.00,
     "category": "string", "calories_per_100g": 0}
  ]
}
"#
    .to_string()
}
