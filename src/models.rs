use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;

/// One product detail page as recovered by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawProductRecord {
    pub product_url: String,
    pub category_id: Option<String>,
    pub internal_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    /// Absolute, deduplicated and sorted.
    pub image_urls: BTreeSet<String>,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub product_internal_id: String,
    pub inferred_brand: Option<String>,
    pub inferred_category: Option<String>,
    pub inferred_product_name: Option<String>,
    pub search_queries: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

impl InferenceResult {
    /// Null enrichment carrying the collaborator failure in `notes`.
    pub fn degraded(internal_id: &str, err: &CollaboratorError) -> Self {
        Self {
            product_internal_id: internal_id.to_string(),
            inferred_brand: None,
            inferred_category: None,
            inferred_product_name: None,
            search_queries: Vec::new(),
            notes: format!("Error during processing: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub product_internal_id: String,
    pub match_found: bool,
    pub match_confidence: f64,
    #[serde(default)]
    pub official_page_url: Option<String>,
    #[serde(default)]
    pub official_brand: Option<String>,
    #[serde(default)]
    pub official_product_name: Option<String>,
    #[serde(default)]
    pub official_sku: Option<String>,
    #[serde(default)]
    pub official_price: Option<String>,
    #[serde(default)]
    pub official_currency: Option<String>,
    #[serde(default)]
    pub official_main_image_url: Option<String>,
    #[serde(default)]
    pub notes: String,
}

impl MatchResult {
    /// No match, zero confidence. Always routed to review.
    pub fn degraded(internal_id: &str, err: &CollaboratorError) -> Self {
        Self {
            product_internal_id: internal_id.to_string(),
            match_found: false,
            match_confidence: 0.0,
            official_page_url: None,
            official_brand: None,
            official_product_name: None,
            official_sku: None,
            official_price: None,
            official_currency: None,
            official_main_image_url: None,
            notes: format!("Error during matching: {err}"),
        }
    }
}

/// Durable raw + inference snapshot; the only input the match stage needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub raw: RawProductRecord,
    pub inference: InferenceResult,
}

impl Checkpoint {
    pub fn internal_id(&self) -> &str {
        &self.inference.product_internal_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewSignal {
    #[serde(rename = "YES")]
    Yes,
    #[serde(rename = "NO")]
    No,
}

impl ReviewSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewSignal::Yes => "YES",
            ReviewSignal::No => "NO",
        }
    }
}

impl fmt::Display for ReviewSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the run aggregator sees of a recorded product.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub internal_id: String,
    pub match_found: bool,
    pub match_confidence: Option<f64>,
    pub needs_review: ReviewSignal,
    pub official_image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub supplier_name: String,
    pub total: usize,
    pub matched: usize,
    pub needs_review_yes: usize,
    pub needs_review_no: usize,
    pub avg_confidence: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
    pub discover_limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_match_is_unmatched() {
        let m = MatchResult::degraded("655730", &CollaboratorError::Empty);
        assert!(!m.match_found);
        assert_eq!(m.match_confidence, 0.0);
        assert!(m.official_main_image_url.is_none());
        assert!(m.notes.contains("empty response"));
    }

    #[test]
    fn match_result_tolerates_missing_optionals() {
        let json = r#"{"product_internal_id":"1","match_found":true,"match_confidence":0.9}"#;
        let m: MatchResult = serde_json::from_str(json).unwrap();
        assert!(m.official_brand.is_none());
        assert_eq!(m.notes, "");
    }

    #[test]
    fn review_signal_serializes_as_flag() {
        assert_eq!(serde_json::to_string(&ReviewSignal::Yes).unwrap(), "\"YES\"");
        assert_eq!(ReviewSignal::No.to_string(), "NO");
    }
}
