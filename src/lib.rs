//! Flagging and routing rule engine for export-licensing cases.
//!
//! The crate evaluates flagging rules against a case and its products and
//! destinations, routes the case into work queues using tiered routing rules,
//! and emits an append-only history of every flag and queue movement. It
//! performs no I/O: callers supply case snapshots and rule tables and persist
//! the returned state and history records.

pub mod config;
pub mod engine;
pub mod error;
pub mod telemetry;

pub use config::{AppConfig, AppEnvironment, EngineConfig, TelemetryConfig};
pub use error::AppError;
