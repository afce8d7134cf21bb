//! Materialized speculative-decoding metrics.

use std::fmt;

use serde::Serialize;

/// Upper bound on emitted tokens for `draft_tokens` drafted at branch length `k`.
///
/// Every speculated sequence proposes `k` tokens and can emit at most `k + 1`
/// (all drafts accepted plus one bonus token).
pub fn max_num_emitted_tokens(draft_tokens: u64, k: usize) -> u64 {
    let k = k as u64;
    if k == 0 {
        return 0;
    }
    (draft_tokens / k) * (k + 1)
}

/// Aggregate acceptance counters snapshotted from the sampler, tagged with
/// the branch length of the step that materialized them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpecDecodeMetrics {
    /// Branch length `k` passed to the poll that returned this record.
    pub num_spec_tokens: usize,
    pub accepted_tokens: u64,
    pub emitted_tokens: u64,
    pub draft_tokens: u64,
    /// `accepted / draft`; `None` before any token was drafted.
    pub draft_acceptance_rate: Option<f64>,
    /// `emitted / max_emitted`; `None` when nothing could have been emitted.
    pub system_efficiency: Option<f64>,
}

impl SpecDecodeMetrics {
    pub fn new(k: usize, accepted_tokens: u64, emitted_tokens: u64, draft_tokens: u64) -> Self {
        let draft_acceptance_rate =
            (draft_tokens > 0).then(|| accepted_tokens as f64 / draft_tokens as f64);
        let max_emitted = max_num_emitted_tokens(draft_tokens, k);
        let system_efficiency =
            (max_emitted > 0).then(|| emitted_tokens as f64 / max_emitted as f64);

        Self {
            num_spec_tokens: k,
            accepted_tokens,
            emitted_tokens,
            draft_tokens,
            draft_acceptance_rate,
            system_efficiency,
        }
    }
}

fn fmt_rate(rate: Option<f64>) -> String {
    match rate {
        Some(r) => format!("{:.3}", r),
        None => "n/a".to_string(),
    }
}

impl fmt::Display for SpecDecodeMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "k={} acceptance_rate={} efficiency={} accepted={} drafted={} emitted={}",
            self.num_spec_tokens,
            fmt_rate(self.draft_acceptance_rate),
            fmt_rate(self.system_efficiency),
            self.accepted_tokens,
            self.draft_tokens,
            self.emitted_tokens,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_num_emitted_tokens() {
        assert_eq!(max_num_emitted_tokens(12, 4), 15);
        assert_eq!(max_num_emitted_tokens(0, 4), 0);
        assert_eq!(max_num_emitted_tokens(5, 1), 10);
    }

    #[test]
    fn test_max_num_emitted_tokens_partial_batch_rounds_down() {
        assert_eq!(max_num_emitted_tokens(10, 4), 10);
    }

    #[test]
    fn test_max_num_emitted_tokens_zero_k() {
        assert_eq!(max_num_emitted_tokens(10, 0), 0);
    }

    #[test]
    fn test_rates() {
        let m = SpecDecodeMetrics::new(4, 6, 9, 12);
        assert_eq!(m.num_spec_tokens, 4);
        assert_eq!(m.draft_acceptance_rate, Some(0.5));
        assert_eq!(m.system_efficiency, Some(9.0 / 15.0));
    }

    #[test]
    fn test_rates_undefined_without_drafts() {
        let m = SpecDecodeMetrics::new(3, 0, 0, 0);
        assert_eq!(m.draft_acceptance_rate, None);
        assert_eq!(m.system_efficiency, None);
    }

    #[test]
    fn test_display() {
        let m = SpecDecodeMetrics::new(4, 6, 9, 12);
        assert_eq!(
            m.to_string(),
            "k=4 acceptance_rate=0.500 efficiency=0.600 accepted=6 drafted=12 emitted=9"
        );
        let empty = SpecDecodeMetrics::new(2, 0, 0, 0);
        assert!(empty.to_string().contains("acceptance_rate=n/a"));
    }

    #[test]
    fn test_serialize_json() {
        let m = SpecDecodeMetrics::new(2, 1, 2, 0);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["num_spec_tokens"], 2);
        assert_eq!(json["accepted_tokens"], 1);
        assert!(json["draft_acceptance_rate"].is_null());
    }
}
