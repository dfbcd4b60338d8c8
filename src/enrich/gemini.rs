use std::time::Duration;

use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GeminiConfig;
use crate::error::CollaboratorError;

const ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const TEMPERATURE: f32 = 0.1;

/// One piece of a multimodal prompt.
#[derive(Debug, Clone)]
pub enum Part {
    Text(String),
    Image { mime_type: String, bytes: Vec<u8> },
}

#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, config })
    }

    /// Single-turn generation. `grounded` enables web-search grounding.
    pub async fn generate(&self, parts: Vec<Part>, grounded: bool) -> Result<String, CollaboratorError> {
        let url = format!("{}/{}:generateContent", ENDPOINT, self.config.model);
        let body = request_body(parts, grounded);

        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Transport(format!(
                "HTTP {}: {}",
                status,
                detail.chars().take(200).collect::<String>()
            )));
        }

        let payload: GenerateResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Malformed(e.to_string()))?;
        let text = response_text(payload)?;
        debug!("Gemini reply: {} chars", text.len());
        Ok(text)
    }
}

fn request_body(parts: Vec<Part>, grounded: bool) -> GenerateRequest {
    let parts = parts
        .into_iter()
        .map(|part| match part {
            Part::Text(text) => RequestPart::Text { text },
            Part::Image { mime_type, bytes } => RequestPart::InlineData {
                inline_data: Blob {
                    mime_type,
                    data: base64::engine::general_purpose::STANDARD.encode(bytes),
                },
            },
        })
        .collect();

    GenerateRequest {
        contents: vec![Content { role: "user", parts }],
        generation_config: GenerationConfig {
            temperature: TEMPERATURE,
        },
        tools: if grounded {
            vec![Tool {
                google_search: serde_json::json!({}),
            }]
        } else {
            Vec::new()
        },
    }
}

/// Text of the first candidate, all parts joined.
fn response_text(payload: GenerateResponse) -> Result<String, CollaboratorError> {
    let text: String = payload
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        Err(CollaboratorError::Empty)
    } else {
        Ok(text)
    }
}

// ── Wire types ──

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart {
    Text { text: String },
    InlineData { inline_data: Blob },
}

#[derive(Debug, Serialize)]
struct Blob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Tool {
    google_search: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grounded_request_shape() {
        let body = request_body(
            vec![
                Part::Text("find it".into()),
                Part::Image {
                    mime_type: "image/png".into(),
                    bytes: b"png".to_vec(),
                },
            ],
            true,
        );
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "find it");
        assert_eq!(json["contents"][0]["parts"][1]["inline_data"]["mime_type"], "image/png");
        assert_eq!(json["contents"][0]["parts"][1]["inline_data"]["data"], "cG5n");
        assert!(json["tools"][0]["google_search"].is_object());
        assert!((json["generationConfig"]["temperature"].as_f64().unwrap() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn ungrounded_request_has_no_tools() {
        let json = serde_json::to_value(request_body(vec![Part::Text("x".into())], false)).unwrap();
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn joins_candidate_parts() {
        let payload: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"{\"a\":"},{"text":"1}"},{"functionCall":{}}]}}]}"#,
        )
        .unwrap();
        assert_eq!(response_text(payload).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn no_candidates_is_empty() {
        let payload: GenerateResponse = serde_json::from_str(r#"{"promptFeedback":{}}"#).unwrap();
        assert!(matches!(response_text(payload), Err(CollaboratorError::Empty)));
    }
}
