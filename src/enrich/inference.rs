use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::gemini::{GeminiClient, Part};
use super::{normalize_inference, parse_object, InferenceService};
use crate::config::USER_AGENT;
use crate::error::CollaboratorError;
use crate::models::{InferenceResult, RawProductRecord};

const MAX_IMAGES: usize = 3;
const IMAGE_TIMEOUT: Duration = Duration::from_secs(10);

const PROMPT: &str = r#"You identify wholesale catalog products for an official-product matching pipeline.
Look at the product images and text, then return:
- the most likely brand (read logos, monogram patterns, hardware; null if generic),
- a short category such as "shoulder bag", "sneakers" or "belt",
- a plausible official-style product name,
- 3 to 7 web search queries of 3 to 15 words, most specific first, that would find the official product page. Never mention the wholesale site.

Reply with a single JSON object and nothing else:
{
  "product_internal_id": "copied from the input",
  "inferred_brand": "string or null",
  "inferred_category": "string or null",
  "inferred_product_name": "string or null",
  "search_queries": ["string"],
  "notes": "one to three sentences on your reasoning or uncertainty"
}"#;

pub struct GeminiInference {
    client: GeminiClient,
    images: reqwest::Client,
}

impl GeminiInference {
    pub fn new(client: GeminiClient) -> anyhow::Result<Self> {
        let images = reqwest::Client::builder()
            .timeout(IMAGE_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, images })
    }

    /// Best-effort download; a missing image only narrows what the model sees.
    async fn fetch_image(&self, url: &str) -> Option<Part> {
        let result = async {
            let response = self.images.get(url).send().await?.error_for_status()?;
            let mime_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .filter(|v| v.starts_with("image/"))
                .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
                .unwrap_or_else(|| mime_from_path(url).to_string());
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>(Part::Image {
                mime_type,
                bytes: bytes.to_vec(),
            })
        }
        .await;

        match result {
            Ok(part) => Some(part),
            Err(e) => {
                warn!("Error fetching image {}: {}", url, e);
                None
            }
        }
    }
}

#[async_trait]
impl InferenceService for GeminiInference {
    async fn infer(&self, raw: &RawProductRecord) -> Result<InferenceResult, CollaboratorError> {
        let id = raw.internal_id.clone().unwrap_or_default();
        info!("Inferring product {}", id);

        let mut parts = vec![Part::Text(PROMPT.to_string()), Part::Text(prompt_input(raw))];
        for url in raw.image_urls.iter().take(MAX_IMAGES) {
            if let Some(image) = self.fetch_image(url).await {
                parts.push(image);
            }
        }

        let reply = self.client.generate(parts, false).await?;
        let parsed: InferenceReply = parse_object(&reply)?;
        Ok(normalize_inference(parsed.into_result(), &id))
    }
}

/// The record as the model sees it.
fn prompt_input(raw: &RawProductRecord) -> String {
    let input = serde_json::json!({
        "product_page_url": raw.product_url,
        "category_id": raw.category_id,
        "product_internal_id": raw.internal_id,
        "raw_title": raw.title,
        "raw_description": raw.description,
        "raw_price_text": raw.price,
        "image_urls": raw.image_urls,
        "scraped_at": raw.scraped_at,
    });
    format!("Input JSON:\n{input}")
}

fn mime_from_path(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

/// Lenient view of the model's reply; anything missing becomes null or empty.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InferenceReply {
    inferred_brand: Option<String>,
    inferred_category: Option<String>,
    inferred_product_name: Option<String>,
    search_queries: Vec<String>,
    notes: Option<String>,
}

impl InferenceReply {
    fn into_result(self) -> InferenceResult {
        InferenceResult {
            product_internal_id: String::new(),
            inferred_brand: self.inferred_brand.filter(|s| !s.trim().is_empty()),
            inferred_category: self.inferred_category.filter(|s| !s.trim().is_empty()),
            inferred_product_name: self.inferred_product_name.filter(|s| !s.trim().is_empty()),
            search_queries: self.search_queries,
            notes: self.notes.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;

    use super::*;

    #[test]
    fn reply_maps_to_result() {
        let reply = r#"```json
        {"product_internal_id": "wrong", "inferred_brand": "Marc Jacobs", "inferred_category": "",
         "search_queries": ["Marc Jacobs Snapshot camera bag", "Marc Jacobs crossbody", "camera bag leather"]}
        ```"#;
        let parsed: InferenceReply = parse_object(reply).unwrap();
        let r = normalize_inference(parsed.into_result(), "655730");
        assert_eq!(r.product_internal_id, "655730");
        assert_eq!(r.inferred_brand.as_deref(), Some("Marc Jacobs"));
        assert!(r.inferred_category.is_none());
        assert!(r.inferred_product_name.is_none());
        assert_eq!(r.search_queries.len(), 3);
        assert_eq!(r.notes, "");
    }

    #[test]
    fn prompt_input_carries_record() {
        let raw = RawProductRecord {
            product_url: "https://bags.qiqiyg.com/productinfoen_655730.html".into(),
            category_id: Some("44188".into()),
            internal_id: Some("655730".into()),
            title: Some("Marc Jacobs jy (65)".into()),
            description: None,
            price: None,
            image_urls: BTreeSet::from(["https://pic.example/a.png".to_string()]),
            scraped_at: Utc::now(),
        };
        let input = prompt_input(&raw);
        assert!(input.starts_with("Input JSON:\n"));
        let json: serde_json::Value = serde_json::from_str(&input["Input JSON:\n".len()..]).unwrap();
        assert_eq!(json["product_internal_id"], "655730");
        assert_eq!(json["raw_title"], "Marc Jacobs jy (65)");
        assert!(json["raw_description"].is_null());
        assert_eq!(json["image_urls"][0], "https://pic.example/a.png");
    }

    #[test]
    fn mime_guess() {
        assert_eq!(mime_from_path("https://x/a%20b_1.PNG?v=2"), "image/png");
        assert_eq!(mime_from_path("https://x/a.webp"), "image/webp");
        assert_eq!(mime_from_path("https://x/a"), "image/jpeg");
    }
}
