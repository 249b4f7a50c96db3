//! # Task Executor Contract
//!
//! The scheduler never talks to an endpoint directly. Each unit of work is
//! handed to a [`TaskExecutor`], which translates the opaque payload into a
//! vendor call, honors the deadline and cancellation token at a safe point,
//! and reports any consumed usage even when it fails. Executors must not
//! retry internally; retries belong to the
//! [`RetryManager`](crate::orchestration::RetryManager).

pub mod executor;

pub use executor::{
    EndpointKind, ExecutionContext, ExecutionError, ExecutionOutput, ProgressReporter,
    TaskExecutor,
};
