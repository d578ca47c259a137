//! dbwarden - admission control for database telemetry.
//!
//! dbwarden sits inside a database-monitoring pipeline and decides, per
//! telemetry record, whether to keep it, drop it or reduce its detail. It
//! protects the pipeline and the backend from bursty or pathological
//! workloads such as a database emitting unbounded distinct query texts.
//!
//! # Components
//!
//! - `breaker`: per-resource circuit breaker with bounded key cardinality
//! - `sampling`: rule-based adaptive sampler with sticky, deterministic verdicts
//! - `ash`: active-session-history sampler with load-adaptive capture,
//!   rolling wait aggregates and anomaly flags
//! - `pipeline`: composition of the above onto a bounded output queue
//! - `expr`: the rule condition language
//! - `tracking`: cardinality windows and the decision cache
//! - `core`: records, configuration and errors
//!
//! # Example
//!
//! ```no_run
//! use dbwarden_lib::core::{attrs, Config, TelemetryRecord};
//! use dbwarden_lib::pipeline::AdmissionPipeline;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (pipeline, mut rx) = AdmissionPipeline::new(&Config::default())?;
//!     let record = TelemetryRecord::new("db.query.duration")
//!         .with_attr(attrs::RESOURCE_ID, "orders")
//!         .with_attr(attrs::DURATION_MS, 2500);
//!     pipeline.process(record);
//!     if let Some(out) = rx.recv().await {
//!         println!("{}", serde_json::to_string(&out)?);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod ash;
pub mod breaker;
pub mod cli;
pub mod core;
pub mod expr;
pub mod monitoring;
pub mod pipeline;
pub mod sampling;
pub mod tracking;

// Re-export core types for convenience
pub use crate::core::{Config, Result};
pub use crate::pipeline::AdmissionPipeline;
