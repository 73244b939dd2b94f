use anyhow::{anyhow, Result};
use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::models::ExtractedPrazoData;
use crate::services::extraction::{compute_confidence, FieldExtractor};
use crate::utils::normalize_date;

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
const MODEL: &str = "gpt-4o-mini";
const MAX_TEXT_CHARS: usize = 12_000;

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    messages: Vec<Message>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
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
    content: String,
}

/// Structured deadline extraction through the chat completions API.
pub struct OpenAIExtractor {
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIExtractor {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(OpenAIExtractor { api_key, client })
    }

    async fn call(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: MODEL.to_string(),
            temperature: 0.1,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        let response = self
            .client
            .post(CHAT_COMPLETIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("OpenAI error {}: {}", status, body));
        }

        let body: ChatResponse = response.json().await?;
        let content = body
            .choices
            .first()
            .ok_or_else(|| anyhow!("Empty response"))?
            .message
            .content
            .trim()
            .to_string();
        Ok(content)
    }
}

#[async_trait]
impl FieldExtractor for OpenAIExtractor {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn extract(&self, text: &str) -> Result<ExtractedPrazoData> {
        let prompt = system_prompt();
        let excerpt: String = text.chars().take(MAX_TEXT_CHARS).collect();
        let user = format!("Document text:\n{}", excerpt);

        let mut raw = self.call(prompt, &user).await?;
        let mut value = parse_json(&raw)?;

        if !matches_schema(&value)? {
            let fix_prompt = format!(
                "Corrija este JSON para que siga exatamente o schema. Responda apenas com JSON. JSON:\n{}",
                raw
            );
            raw = self.call(prompt, &fix_prompt).await?;
            value = parse_json(&raw)?;
            if !matches_schema(&value)? {
                return Err(anyhow!("JSON validation failed"));
            }
        }

        parse_extracted(value)
    }
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str::<Value>(raw).map_err(|e| anyhow!("Invalid JSON: {}", e))
}

fn matches_schema(value: &Value) -> Result<bool> {
    let schema_value = extraction_schema();
    let schema = JSONSchema::compile(&schema_value).map_err(|e| anyhow!("Invalid JSON schema: {}", e))?;
    Ok(schema.is_valid(value))
}

fn parse_extracted(value: Value) -> Result<ExtractedPrazoData> {
    let mut data: ExtractedPrazoData = serde_json::from_value(value)?;
    data.due_date = normalize_date(data.due_date);
    if data.extraction_notes.trim().is_empty() {
        data.extraction_notes = "notes missing".to_string();
    }
    if data.confidence_score.is_none() && !data.is_empty() {
        data.confidence_score = Some(compute_confidence(&data));
    }
    Ok(data)
}

fn extraction_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["due_date", "amount", "obligation_type", "extraction_notes"],
        "properties": {
            "description": {"type": ["string", "null"]},
            "due_date": {"type": ["string", "null"]},
            "amount": {"type": ["number", "null"]},
            "obligation_type": {"type": ["string", "null"]},
            "company_document": {"type": ["string", "null"]},
            "reference_period": {"type": ["string", "null"]},
            "extraction_notes": {"type": "string"},
            "confidence_score": {"type": ["number", "null"], "minimum": 0, "maximum": 1}
        }
    })
}

fn system_prompt() -> &'static str {
    r#"You extract fiscal deadlines from Brazilian tax documents (DAS, DARF, GPS, FGTS, DCTFWeb...).
Return JSON only and match the schema exactly.
Fields:
- description (string|null, short label such as "DAS 02/2026")
- due_date (YYYY-MM-DD|null, the payment or filing deadline)
- amount (number|null, amount due in BRL)
- obligation_type (string|null, e.g. DAS, DARF, GPS)
- company_document (string|null, CNPJ as printed)
- reference_period (MM/YYYY|null)
- extraction_notes (string, short)
- confidence_score (number 0..1|null)
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_accepts_a_complete_answer_and_rejects_extra_fields() {
        let good = json!({
            "due_date": "20/03/2026",
            "amount": 99.9,
            "obligation_type": "DARF",
            "extraction_notes": "ok"
        });
        assert!(matches_schema(&good).unwrap());
        assert!(!matches_schema(&json!({"due_date": null, "unexpected": 1})).unwrap());

        let data = parse_extracted(good).unwrap();
        assert_eq!(data.due_date.as_deref(), Some("2026-03-20"));
        assert!(data.confidence_score.is_some());
    }
}
