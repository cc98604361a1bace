//! stitch-core library.
//!
//! Incremental ingestion of a batched click-stream log into an embedded
//! SQLite store: exactly-once file admission ([`ledger`]), per-batch staging
//! ([`staging`]), cross-batch session-start reconciliation ([`session`]),
//! an append-only enriched fact table ([`store`]), per-session event-kind
//! aggregates maintained in the merge transaction ([`aggregate`]), and the
//! click-without-completion evaluator that reads them ([`fraud`]).
//! [`cycle`] wires the pieces into one batch cycle.
//!
//! # Conventions
//!
//! - **Errors**: `anyhow::Result` inside the storage layer, `thiserror`
//!   enums at module boundaries, each mapped to an [`error::ErrorCode`].
//! - **Logging**: `tracing` macros with structured fields.
//! - **Time**: every timestamp is `i64` epoch microseconds.

pub mod aggregate;
pub mod config;
pub mod cycle;
pub mod db;
pub mod enrich;
pub mod error;
pub mod event;
pub mod fraud;
pub mod ledger;
pub mod lock;
pub mod session;
pub mod source;
pub mod staging;
pub mod store;

pub use cycle::{CycleError, CycleReport, Pipeline, run_cycle};
pub use fraud::{DetectParams, FraudEvaluator, FraudFlag};
