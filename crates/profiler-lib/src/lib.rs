//! Core library for the pprof server
//!
//! This crate provides:
//! - Host discovery over the cluster API with a liveness cache
//! - pprof session management (web UI sessions and one-shot captures)
//! - Cron-driven snapshot capture with retention
//! - Metrics and structured logging

pub mod artifacts;
pub mod capture;
pub mod discovery;
pub mod models;
pub mod observability;
pub mod session;

pub use models::*;
pub use observability::{ProfilerMetrics, StructuredLogger};
