//! # Idempotency
//!
//! Best-effort request deduplication within the process lifetime. Same key
//! and same payload hash replays the prior result; same key with a different
//! payload is a conflict; no key means no deduplication.

pub mod store;

pub use store::{
    IdempotencyConfig, IdempotencyOutcome, IdempotencyRecord, IdempotencyStore, PendingPolicy,
};
