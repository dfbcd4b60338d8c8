use crate::models::{MatchResult, ReviewSignal};

pub const REVIEW_THRESHOLD: f64 = 0.8;

/// A product needs a human look unless it matched with at least `REVIEW_THRESHOLD` confidence.
pub fn needs_review(m: &MatchResult) -> ReviewSignal {
    if !m.match_found || m.match_confidence < REVIEW_THRESHOLD {
        ReviewSignal::Yes
    } else {
        ReviewSignal::No
    }
}
