//! # Evidence Bundles
//!
//! Replicates and the pure reduction that turns them into a consensus
//! summary. The reduction never performs I/O and depends only on its inputs,
//! so identical replicates always yield identical bundles.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::confidence::{ConfidenceInputs, ConfidencePolicy};
use super::distance::{mean_pairwise_distance, pairwise_matrix};
use super::schema::FieldSpec;
use crate::config::ReplicationConfig;
use crate::orchestration::Usage;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicateQuality {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// One independent execution of the replicated task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replicate {
    pub id: String,
    pub data: Value,
    pub quality: ReplicateQuality,
    pub usage: Usage,
}

impl Replicate {
    pub fn valid(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
            quality: ReplicateQuality {
                valid: true,
                errors: Vec::new(),
            },
            usage: Usage::default(),
        }
    }

    pub fn invalid(id: impl Into<String>, data: Value, errors: Vec<String>) -> Self {
        Self {
            id: id.into(),
            data,
            quality: ReplicateQuality {
                valid: false,
                errors,
            },
            usage: Usage::default(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// Elected value for one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConsensus {
    pub field: String,
    pub value: Value,
    /// Valid replicates whose value equals the elected one
    pub support: usize,
}

/// A field on which valid replicates diverge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disagreement {
    pub field: String,
    /// Distinct values in replicate order; a missing value appears as null
    pub values: Vec<Value>,
}

/// Summary statistics of a numeric field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDistribution {
    pub field: String,
    pub count: usize,
    pub mean: f64,
    /// Population standard deviation
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSummary {
    pub consensus: Vec<FieldConsensus>,
    pub disagreements: Vec<Disagreement>,
    pub pairwise_distance: Vec<Vec<f64>>,
    pub distributions: Vec<FieldDistribution>,
    pub confidence: f64,
    /// Set when any size cap dropped detail
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceMeta {
    pub task_id: String,
    pub requested_replicas: usize,
    pub completed_replicas: usize,
    pub epsilon: f64,
    /// Distance between the first two replicates, when both ran
    pub early_distance: Option<f64>,
    pub early_stopped: bool,
    pub usage_total: Usage,
    pub elapsed: Duration,
    pub confidence_policy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub meta: EvidenceMeta,
    pub replicates: Vec<Replicate>,
    pub summary: EvidenceSummary,
}

/// Size caps applied to a summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeCaps {
    /// Maximum consensus entries, and maximum distribution entries
    pub max_fields: usize,
    pub max_diffs: usize,
    /// Maximum serialized size of the summary
    pub max_bytes: usize,
}

impl From<&ReplicationConfig> for SizeCaps {
    fn from(config: &ReplicationConfig) -> Self {
        Self {
            max_fields: config.max_fields,
            max_diffs: config.max_diffs,
            max_bytes: config.max_bytes,
        }
    }
}

/// Reduce replicates to a summary over the declared fields.
///
/// Consensus, disagreements, and distributions consider valid replicates
/// only; the distance matrix covers every replicate, with invalid ones at
/// maximum distance.
pub fn reduce(
    replicates: &[Replicate],
    fields: &[FieldSpec],
    caps: SizeCaps,
    policy: &dyn ConfidencePolicy,
) -> EvidenceSummary {
    let valid: Vec<&Replicate> = replicates.iter().filter(|r| r.quality.valid).collect();

    let mut consensus = Vec::new();
    let mut disagreements = Vec::new();
    let mut distributions = Vec::new();
    let mut agreement_total = 0.0;

    if !valid.is_empty() {
        for field in fields {
            let values: Vec<Value> = valid
                .iter()
                .map(|r| field.extract(&r.data).cloned().unwrap_or(Value::Null))
                .collect();
            if values.iter().all(Value::is_null) {
                continue;
            }

            let distinct = distinct_values(&values);
            let elected = elect(&values, &distinct);
            let support = values.iter().filter(|v| **v == elected).count();
            agreement_total += support as f64 / values.len() as f64;

            if distinct.len() > 1 {
                disagreements.push(Disagreement {
                    field: field.name.clone(),
                    values: distinct,
                });
            }
            if let Some(distribution) = distribution(&field.name, &values) {
                distributions.push(distribution);
            }
            consensus.push(FieldConsensus {
                field: field.name.clone(),
                value: elected,
                support,
            });
        }
    }

    let agreement_ratio = if consensus.is_empty() {
        0.0
    } else {
        agreement_total / consensus.len() as f64
    };
    let pairwise_distance = pairwise_matrix(replicates, fields);
    let valid_ratio = if replicates.is_empty() {
        0.0
    } else {
        valid.len() as f64 / replicates.len() as f64
    };
    let confidence = policy.confidence(&ConfidenceInputs {
        agreement_ratio,
        mean_distance: mean_pairwise_distance(&pairwise_distance),
        valid_ratio,
    });

    let mut summary = EvidenceSummary {
        consensus,
        disagreements,
        pairwise_distance,
        distributions,
        confidence,
        truncated: false,
    };
    truncate(&mut summary, caps);
    summary
}

/// Distinct values in first-seen order
fn distinct_values(values: &[Value]) -> Vec<Value> {
    let mut distinct: Vec<Value> = Vec::new();
    for value in values {
        if !distinct.contains(value) {
            distinct.push(value.clone());
        }
    }
    distinct
}

/// Strict majority if one exists; otherwise the lower median for all-numeric
/// fields, else the most frequent value. Ties go to the value seen first,
/// i.e. the one from the lowest replicate index.
fn elect(values: &[Value], distinct: &[Value]) -> Value {
    let counts: Vec<usize> = distinct
        .iter()
        .map(|candidate| values.iter().filter(|v| *v == candidate).count())
        .collect();

    // max_by_key keeps the last maximum; scan manually so the first one wins
    let mut best = 0;
    for (index, count) in counts.iter().enumerate() {
        if *count > counts[best] {
            best = index;
        }
    }

    if counts[best] * 2 > values.len() {
        return distinct[best].clone();
    }

    let mut numbers: Vec<(f64, usize)> = Vec::with_capacity(values.len());
    for (index, value) in values.iter().enumerate() {
        match value.as_f64() {
            Some(number) => numbers.push((number, index)),
            None => return distinct[best].clone(),
        }
    }
    numbers.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    let (_, index) = numbers[(numbers.len() - 1) / 2];
    values[index].clone()
}

fn distribution(field: &str, values: &[Value]) -> Option<FieldDistribution> {
    let numbers: Vec<f64> = values.iter().map(Value::as_f64).collect::<Option<_>>()?;
    if numbers.is_empty() {
        return None;
    }

    let count = numbers.len();
    let mean = numbers.iter().sum::<f64>() / count as f64;
    let variance = numbers.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / count as f64;
    Some(FieldDistribution {
        field: field.to_string(),
        count,
        mean,
        std_dev: variance.sqrt(),
        min: numbers.iter().copied().fold(f64::INFINITY, f64::min),
        max: numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    })
}

/// Apply caps, dropping distributions first, then disagreements, then consensus
fn truncate(summary: &mut EvidenceSummary, caps: SizeCaps) {
    if summary.distributions.len() > caps.max_fields {
        summary.distributions.truncate(caps.max_fields);
        summary.truncated = true;
    }
    if summary.disagreements.len() > caps.max_diffs {
        summary.disagreements.truncate(caps.max_diffs);
        summary.truncated = true;
    }
    if summary.consensus.len() > caps.max_fields {
        summary.consensus.truncate(caps.max_fields);
        summary.truncated = true;
    }

    while serialized_len(summary) > caps.max_bytes {
        if summary.distributions.pop().is_some()
            || summary.disagreements.pop().is_some()
            || summary.consensus.pop().is_some()
        {
            summary.truncated = true;
        } else {
            // Only the distance matrix remains; it is never dropped
            summary.truncated = true;
            break;
        }
    }
}

fn serialized_len(summary: &EvidenceSummary) -> usize {
    serde_json::to_vec(summary).map_or(usize::MAX, |bytes| bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::confidence::AgreementSpreadConfidence;
    use crate::replication::schema::FieldKind;
    use serde_json::json;

    const WIDE: SizeCaps = SizeCaps {
        max_fields: 64,
        max_diffs: 64,
        max_bytes: 1 << 20,
    };

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::required("label", FieldKind::String),
            FieldSpec::required("score", FieldKind::Number),
        ]
    }

    fn summarize(replicates: &[Replicate], caps: SizeCaps) -> EvidenceSummary {
        reduce(replicates, &fields(), caps, &AgreementSpreadConfidence::default())
    }

    #[test]
    fn test_unanimous_replicates() {
        let replicates = vec![
            Replicate::valid("r1", json!({"label": "cat", "score": 2.0})),
            Replicate::valid("r2", json!({"label": "cat", "score": 2.0})),
        ];
        let summary = summarize(&replicates, WIDE);

        assert_eq!(summary.consensus.len(), 2);
        assert_eq!(summary.consensus[0].value, json!("cat"));
        assert_eq!(summary.consensus[0].support, 2);
        assert!(summary.disagreements.is_empty());
        assert_eq!(summary.distributions[0].std_dev, 0.0);
        assert_eq!(summary.confidence, 1.0);
        assert!(!summary.truncated);
    }

    #[test]
    fn test_majority_and_median_election() {
        let replicates = vec![
            Replicate::valid("r1", json!({"label": "dog", "score": 3.0})),
            Replicate::valid("r2", json!({"label": "cat", "score": 1.0})),
            Replicate::valid("r3", json!({"label": "cat", "score": 2.0})),
        ];
        let summary = summarize(&replicates, WIDE);

        assert_eq!(summary.consensus[0].value, json!("cat"));
        assert_eq!(summary.consensus[1].value, json!(2.0));
        assert_eq!(summary.disagreements.len(), 2);
        assert_eq!(summary.disagreements[0].values, vec![json!("dog"), json!("cat")]);

        let distribution = &summary.distributions[0];
        assert_eq!(distribution.field, "score");
        assert_eq!(distribution.mean, 2.0);
        assert_eq!(distribution.min, 1.0);
        assert_eq!(distribution.max, 3.0);
    }

    #[test]
    fn test_ties_go_to_lowest_replicate_index() {
        let replicates = vec![
            Replicate::valid("r1", json!({"label": "dog", "score": 4.0})),
            Replicate::valid("r2", json!({"label": "cat", "score": 1.0})),
        ];
        let summary = summarize(&replicates, WIDE);
        assert_eq!(summary.consensus[0].value, json!("dog"));
        // Lower median of [1.0, 4.0]
        assert_eq!(summary.consensus[1].value, json!(1.0));
    }

    #[test]
    fn test_invalid_replicates_are_kept_but_excluded() {
        let replicates = vec![
            Replicate::valid("r1", json!({"label": "cat", "score": 1.0})),
            Replicate::invalid("r2", json!({"label": 7}), vec!["bad label".to_string()]),
        ];
        let summary = summarize(&replicates, WIDE);

        assert_eq!(summary.consensus[0].support, 1);
        assert!(summary.disagreements.is_empty());
        assert_eq!(summary.pairwise_distance[0][1], 1.0);
        assert!(summary.confidence < 0.5);
    }

    #[test]
    fn test_no_valid_replicates() {
        let replicates = vec![Replicate::invalid("r1", Value::Null, vec!["failed".to_string()])];
        let summary = summarize(&replicates, WIDE);
        assert!(summary.consensus.is_empty());
        assert_eq!(summary.confidence, 0.0);
        assert_eq!(summary.pairwise_distance, vec![vec![0.0]]);
    }

    #[test]
    fn test_count_caps_truncate() {
        let replicates = vec![
            Replicate::valid("r1", json!({"label": "dog", "score": 3.0})),
            Replicate::valid("r2", json!({"label": "cat", "score": 1.0})),
        ];
        let caps = SizeCaps {
            max_fields: 1,
            max_diffs: 1,
            max_bytes: 1 << 20,
        };
        let summary = summarize(&replicates, caps);
        assert!(summary.truncated);
        assert_eq!(summary.consensus.len(), 1);
        assert_eq!(summary.disagreements.len(), 1);
        assert_eq!(summary.distributions.len(), 1);
    }

    #[test]
    fn test_byte_cap_drops_distributions_first() {
        let replicates = vec![
            Replicate::valid("r1", json!({"label": "dog", "score": 3.0})),
            Replicate::valid("r2", json!({"label": "cat", "score": 1.0})),
        ];
        let full = summarize(&replicates, WIDE);
        let without_distributions = EvidenceSummary {
            distributions: Vec::new(),
            ..full.clone()
        };
        let caps = SizeCaps {
            max_bytes: serialized_len(&without_distributions),
            ..WIDE
        };

        let summary = summarize(&replicates, caps);
        assert!(summary.truncated);
        assert!(summary.distributions.is_empty());
        assert_eq!(summary.disagreements, full.disagreements);
        assert_eq!(summary.consensus, full.consensus);
    }
}
