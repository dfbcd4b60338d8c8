pub mod gemini;
pub mod inference;
pub mod matcher;

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::CollaboratorError;
use crate::models::{Checkpoint, InferenceResult, MatchResult, RawProductRecord};

pub use gemini::GeminiClient;
pub use inference::GeminiInference;
pub use matcher::GeminiMatcher;

const MIN_QUERIES: usize = 3;
const MAX_QUERIES: usize = 7;

static JSON_OBJECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

/// Brand, category, name and search queries for one scraped product.
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn infer(&self, raw: &RawProductRecord) -> Result<InferenceResult, CollaboratorError>;
}

/// Official-product lookup for a checkpointed product.
#[async_trait]
pub trait MatchService: Send + Sync {
    async fn find_match(&self, cp: &Checkpoint) -> Result<MatchResult, CollaboratorError>;
}

/// Strip markdown code fences from a model reply.
pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Parse the JSON object in a model reply, tolerating fences and surrounding prose.
pub fn parse_object<T: DeserializeOwned>(reply: &str) -> Result<T, CollaboratorError> {
    let text = strip_code_blocks(reply);
    if text.is_empty() {
        return Err(CollaboratorError::Empty);
    }
    let object = JSON_OBJECT
        .find(text)
        .map(|m| m.as_str())
        .ok_or_else(|| CollaboratorError::Malformed("no JSON object in reply".into()))?;
    Ok(serde_json::from_str(object)?)
}

pub fn normalize_inference(mut result: InferenceResult, internal_id: &str) -> InferenceResult {
    result.product_internal_id = internal_id.to_string();
    result.search_queries = result
        .search_queries
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .take(MAX_QUERIES)
        .collect();
    if result.search_queries.len() < MIN_QUERIES {
        warn!(
            "Inference for {} returned {} search queries",
            internal_id,
            result.search_queries.len()
        );
    }
    result
}

pub fn normalize_match(mut result: MatchResult, internal_id: &str) -> Result<MatchResult, CollaboratorError> {
    if result.match_confidence.is_nan() {
        return Err(CollaboratorError::Malformed("match_confidence is NaN".into()));
    }
    result.product_internal_id = internal_id.to_string();
    result.match_confidence = result.match_confidence.clamp(0.0, 1.0);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Probe {
        a: u32,
    }

    #[test]
    fn strips_fences() {
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("{}"), "{}");
    }

    #[test]
    fn parses_object_inside_prose() {
        let reply = "Here is the result:\n```json\n{\"a\": 7}\n```\nHope that helps.";
        assert_eq!(parse_object::<Probe>(reply).unwrap(), Probe { a: 7 });
    }

    #[test]
    fn malformed_and_empty_replies() {
        assert!(matches!(parse_object::<Probe>("   "), Err(CollaboratorError::Empty)));
        assert!(matches!(parse_object::<Probe>("no json"), Err(CollaboratorError::Malformed(_))));
        assert!(matches!(parse_object::<Probe>("{\"a\": \"x\"}"), Err(CollaboratorError::Malformed(_))));
    }

    #[test]
    fn queries_are_capped() {
        let raw = InferenceResult {
            product_internal_id: "other".into(),
            inferred_brand: None,
            inferred_category: None,
            inferred_product_name: None,
            search_queries: (0..10).map(|i| format!("query {i}")).chain(["  ".to_string()]).collect(),
            notes: String::new(),
        };
        let r = normalize_inference(raw, "655730");
        assert_eq!(r.product_internal_id, "655730");
        assert_eq!(r.search_queries.len(), 7);
        assert_eq!(r.search_queries[0], "query 0");
    }

    #[test]
    fn confidence_is_clamped() {
        let mut m = MatchResult::degraded("x", &CollaboratorError::Empty);
        m.match_confidence = 1.7;
        assert_eq!(normalize_match(m.clone(), "1").unwrap().match_confidence, 1.0);
        m.match_confidence = -0.2;
        assert_eq!(normalize_match(m.clone(), "1").unwrap().match_confidence, 0.0);
        m.match_confidence = f64::NAN;
        assert!(normalize_match(m, "1").is_err());
    }
}
