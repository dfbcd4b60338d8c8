use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::gemini::{GeminiClient, Part};
use super::{normalize_match, parse_object, MatchService};
use crate::error::CollaboratorError;
use crate::models::{Checkpoint, MatchResult};

const PROMPT: &str = r#"You find the official retail page for a wholesale catalog product.

Search the web, starting from the provided search queries, for the official product page: the
brand's own site or a major department store (Nordstrom, Saks, Bloomingdale's, Farfetch,
Net-a-Porter). Ignore replica and wholesale sites. The official product must share the inferred
brand; compare shape, colour, logo pattern and hardware, and prefer an exact product page over a
brand landing page.

When you find a match you must return a direct image URL you actually saw in the results. Prefer
image CDNs that serve without blocking (images.bloomingdalesassets.com, image.s5a.com,
slimages.macysassets.com, cdn.shopify.com). Avoid Farfetch and Revolve image URLs. Never construct an
image URL from a guessed CDN pattern.

Confidence: 0.80-1.00 strong match, 0.60-0.79 plausible, below 0.60 no match.

Wholesale record:
{raw}

Inference:
{inference}

Reply with a single JSON object and nothing else:
{
  "product_internal_id": "{id}",
  "match_found": true or false,
  "match_confidence": 0.0 to 1.0,
  "official_page_url": "string or null",
  "official_brand": "string or null",
  "official_product_name": "string or null",
  "official_sku": "string or null",
  "official_price": "string or null",
  "official_currency": "string or null",
  "official_main_image_url": "direct image URL or null",
  "notes": "your matching reasoning"
}"#;

pub struct GeminiMatcher {
    client: GeminiClient,
}

impl GeminiMatcher {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MatchService for GeminiMatcher {
    async fn find_match(&self, cp: &Checkpoint) -> Result<MatchResult, CollaboratorError> {
        let id = cp.internal_id();
        let prompt = build_prompt(cp)?;

        let reply = self.client.generate(vec![Part::Text(prompt)], true).await?;
        info!("Match reply for {}: {} chars", id, reply.len());

        let parsed: MatchReply = parse_object(&reply)?;
        normalize_match(parsed.into_result(), id)
    }
}

fn build_prompt(cp: &Checkpoint) -> Result<String, CollaboratorError> {
    Ok(PROMPT
        .replace("{raw}", &serde_json::to_string_pretty(&cp.raw)?)
        .replace("{inference}", &serde_json::to_string_pretty(&cp.inference)?)
        .replace("{id}", cp.internal_id()))
}

/// The model's reply. `match_found` and `match_confidence` are required; the rest may be absent.
#[derive(Debug, Deserialize)]
struct MatchReply {
    match_found: bool,
    match_confidence: f64,
    #[serde(default)]
    official_page_url: Option<String>,
    #[serde(default)]
    official_brand: Option<String>,
    #[serde(default)]
    official_product_name: Option<String>,
    #[serde(default)]
    official_sku: Option<String>,
    #[serde(default)]
    official_price: Option<String>,
    #[serde(default)]
    official_currency: Option<String>,
    #[serde(default)]
    official_main_image_url: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

impl MatchReply {
    fn into_result(self) -> MatchResult {
        let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        MatchResult {
            product_internal_id: String::new(),
            match_found: self.match_found,
            match_confidence: self.match_confidence,
            official_page_url: present(self.official_page_url),
            official_brand: present(self.official_brand),
            official_product_name: present(self.official_product_name),
            official_sku: present(self.official_sku),
            official_price: present(self.official_price),
            official_currency: present(self.official_currency),
            official_main_image_url: present(self.official_main_image_url),
            notes: self.notes.unwrap_or_default(),
        }
    }
}
