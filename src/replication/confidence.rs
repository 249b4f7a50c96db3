//! Confidence scoring policies for evidence bundles.

use serde::{Deserialize, Serialize};

/// Statistics a confidence policy scores
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInputs {
    /// Mean share of valid replicates agreeing with each field's consensus, in `[0, 1]`
    pub agreement_ratio: f64,
    /// Mean off-diagonal pairwise distance, in `[0, 1]`
    pub mean_distance: f64,
    /// Share of replicates that passed validation, in `[0, 1]`
    pub valid_ratio: f64,
}

/// Maps agreement statistics to a single score in `[0, 1]`. Implementations
/// must be non-decreasing in `agreement_ratio` and `valid_ratio` and
/// non-increasing in `mean_distance`.
pub trait ConfidencePolicy: Send + Sync {
    fn confidence(&self, inputs: &ConfidenceInputs) -> f64;

    fn policy_name(&self) -> &'static str;
}

/// Weighted blend of agreement and distance spread, scaled by validity:
///
/// `(a·agreement + s·(1 − mean_distance)) / (a + s) × valid_ratio`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgreementSpreadConfidence {
    pub agreement_weight: f64,
    pub spread_weight: f64,
}

impl Default for AgreementSpreadConfidence {
    fn default() -> Self {
        Self {
            agreement_weight: 0.7,
            spread_weight: 0.3,
        }
    }
}

impl ConfidencePolicy for AgreementSpreadConfidence {
    fn confidence(&self, inputs: &ConfidenceInputs) -> f64 {
        let total_weight = self.agreement_weight + self.spread_weight;
        if total_weight <= 0.0 {
            return 0.0;
        }

        let agreement = inputs.agreement_ratio.clamp(0.0, 1.0);
        let spread = 1.0 - inputs.mean_distance.clamp(0.0, 1.0);
        let blended = (self.agreement_weight * agreement + self.spread_weight * spread) / total_weight;
        (blended * inputs.valid_ratio.clamp(0.0, 1.0)).clamp(0.0, 1.0)
    }

    fn policy_name(&self) -> &'static str {
        "agreement_spread"
    }
}
