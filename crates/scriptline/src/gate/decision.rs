use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject,
}

/// The gate's terminal accept/reject call for one item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GateDecision {
    pub verdict: Verdict,
    pub final_score: f64,
    pub confidence: f64,
    pub reason: String,
    /// Effective threshold at decision time.
    pub threshold: f64,
    /// Approved, but with confidence under the configured floor.
    #[serde(default)]
    pub low_confidence: bool,
    pub decided_at: DateTime<Utc>,
}

impl GateDecision {
    pub fn is_approved(&self) -> bool {
        self.verdict == Verdict::Approve
    }
}

/// Rejects when `final_score < threshold`, approves otherwise.
pub fn decide(
    final_score: f64,
    confidence: f64,
    threshold: f64,
    confidence_floor: f64,
    now: DateTime<Utc>,
) -> GateDecision {
    if final_score < threshold {
        return GateDecision {
            verdict: Verdict::Reject,
            final_score,
            confidence,
            reason: format!(
                "Final score {} is below threshold {}",
                final_score, threshold
            ),
            threshold,
            low_confidence: false,
            decided_at: now,
        };
    }

    let low_confidence = confidence < confidence_floor;
    let reason = if low_confidence {
        format!(
            "Final score {} meets threshold {} (low confidence {:.2})",
            final_score, threshold, confidence
        )
    } else {
        format!("Final score {} meets threshold {}", final_score, threshold)
    };
    GateDecision {
        verdict: Verdict::Approve,
        final_score,
        confidence,
        reason,
        threshold,
        low_confidence,
        decided_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_below_threshold_names_both_numbers() {
        let d = decide(62.0, 0.9, 65.0, 0.6, Utc::now());
        assert_eq!(d.verdict, Verdict::Reject);
        assert!(d.reason.contains("62"));
        assert!(d.reason.contains("65"));
        assert_eq!(d.threshold, 65.0);
    }

    #[test]
    fn test_equal_score_approves() {
        let d = decide(65.0, 0.9, 65.0, 0.6, Utc::now());
        assert!(d.is_approved());
        assert!(!d.low_confidence);
    }

    #[test]
    fn test_low_confidence_flagged_on_approval_only() {
        let approved = decide(80.0, 0.3, 65.0, 0.6, Utc::now());
        assert!(approved.is_approved());
        assert!(approved.low_confidence);

        let rejected = decide(50.0, 0.3, 65.0, 0.6, Utc::now());
        assert!(!rejected.low_confidence);
    }

    #[test]
    fn test_fractional_scores_in_reason() {
        let d = decide(64.5, 0.9, 65.25, 0.6, Utc::now());
        assert!(d.reason.contains("64.5"));
        assert!(d.reason.contains("65.25"));
    }

    #[test]
    fn test_near_miss_reason_keeps_full_precision() {
        let d = decide(64.96, 0.9, 65.0, 0.6, Utc::now());
        assert_eq!(d.verdict, Verdict::Reject);
        assert_eq!(d.reason, "Final score 64.96 is below threshold 65");
    }
}
