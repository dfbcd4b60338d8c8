use chrono::{DateTime, Utc};

use crate::models::{Outcome, ReviewSignal, RunRecord};

/// Identifier for one batch: `<supplier>-YYYYMMDDTHHMMSS[-limitN]`.
pub fn run_id(supplier: &str, started_at: DateTime<Utc>, limit: Option<usize>) -> String {
    let base = format!(
        "{}-{}",
        supplier.to_lowercase().replace(char::is_whitespace, "-"),
        started_at.format("%Y%m%dT%H%M%S")
    );
    match limit {
        Some(n) => format!("{base}-limit{n}"),
        None => base,
    }
}

/// Per-batch accumulator. Owned by the batch that feeds it.
#[derive(Debug, Default)]
pub struct RunStats {
    total: usize,
    matched: usize,
    review_yes: usize,
    review_no: usize,
    confidences: Vec<f64>,
}

impl RunStats {
    pub fn record(&mut self, outcome: &Outcome) {
        self.total += 1;
        if outcome.match_found {
            self.matched += 1;
        }
        match outcome.needs_review {
            ReviewSignal::Yes => self.review_yes += 1,
            ReviewSignal::No => self.review_no += 1,
        }
        if let Some(c) = outcome.match_confidence.filter(|c| c.is_finite()) {
            self.confidences.push(c);
        }
    }

    pub fn finish(
        &self,
        run_id: String,
        supplier_name: String,
        started_at: DateTime<Utc>,
        discover_limit: Option<usize>,
    ) -> RunRecord {
        let (avg, min, max) = if self.confidences.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let sum: f64 = self.confidences.iter().sum();
            let min = self.confidences.iter().copied().fold(f64::INFINITY, f64::min);
            let max = self.confidences.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (sum / self.confidences.len() as f64, min, max)
        };

        RunRecord {
            run_id,
            started_at,
            finished_at: Utc::now(),
            supplier_name,
            total: self.total,
            matched: self.matched,
            needs_review_yes: self.review_yes,
            needs_review_no: self.review_no,
            avg_confidence: avg,
            min_confidence: min,
            max_confidence: max,
            discover_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn outcome(found: bool, confidence: Option<f64>, review: ReviewSignal) -> Outcome {
        Outcome {
            internal_id: "1".into(),
            match_found: found,
            match_confidence: confidence,
            needs_review: review,
            official_image: None,
        }
    }

    #[test]
    fn empty_confidences_are_zero() {
        let mut stats = RunStats::default();
        stats.record(&outcome(false, None, ReviewSignal::Yes));
        let r = stats.finish("r".into(), "QiQiYG".into(), Utc::now(), None);
        assert_eq!(r.total, 1);
        assert_eq!((r.avg_confidence, r.min_confidence, r.max_confidence), (0.0, 0.0, 0.0));

        let none = RunStats::default().finish("r".into(), "QiQiYG".into(), Utc::now(), None);
        assert_eq!(none.total, 0);
        assert_eq!(none.avg_confidence, 0.0);
    }

    #[test]
    fn aggregates_counts_and_spread() {
        let mut stats = RunStats::default();
        stats.record(&outcome(true, Some(0.9), ReviewSignal::No));
        stats.record(&outcome(true, Some(0.5), ReviewSignal::Yes));
        stats.record(&outcome(false, Some(0.0), ReviewSignal::Yes));
        let r = stats.finish("r".into(), "QiQiYG".into(), Utc::now(), Some(10));

        assert_eq!(r.total, 3);
        assert_eq!(r.matched, 2);
        assert_eq!(r.needs_review_yes, 2);
        assert_eq!(r.needs_review_no, 1);
        assert!((r.avg_confidence - 1.4 / 3.0).abs() < 1e-9);
        assert_eq!(r.min_confidence, 0.0);
        assert_eq!(r.max_confidence, 0.9);
        assert_eq!(r.discover_limit, Some(10));
    }

    #[test]
    fn run_id_format() {
        let t = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(run_id("QiQiYG", t, None), "qiqiyg-20250304T050607");
        assert_eq!(run_id("QiQiYG", t, Some(25)), "qiqiyg-20250304T050607-limit25");
    }
}
