//! # Replication
//!
//! K-way replicated execution of a single task with early stopping, and the
//! reduction of its replicas into an [`EvidenceBundle`]: per-field
//! consensus, disagreements, a pairwise distance matrix, numeric
//! distributions, and a confidence score.
//!
//! Comparison runs over the fields a [`SchemaValidator`] declares. Replicas
//! that fail validation stay in the bundle, flagged invalid, and count as
//! maximally distant from every other replica.

pub mod barrier;
pub mod confidence;
pub mod distance;
pub mod evidence;
pub mod schema;

pub use barrier::ReplicationBarrier;
pub use confidence::{AgreementSpreadConfidence, ConfidenceInputs, ConfidencePolicy};
pub use distance::{field_distance, pairwise_matrix, replica_distance};
pub use evidence::{
    reduce, Disagreement, EvidenceBundle, EvidenceMeta, EvidenceSummary, FieldConsensus,
    FieldDistribution, Replicate, ReplicateQuality, SizeCaps,
};
pub use schema::{FieldKind, FieldSchema, FieldSpec, SchemaValidator};
