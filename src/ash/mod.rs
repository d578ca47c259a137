//! Active Session History.
//!
//! A timer-driven sampler pulls session activity from the monitored database,
//! keeps a load-adaptive subset in a bounded ring buffer, maintains rolling
//! wait-event aggregates over several windows and flags wait events whose
//! activity departs from their recent baseline. It runs independently of the
//! record pipeline and only shares the output queue with it.

pub mod aggregate;
pub mod anomaly;
pub mod buffer;
pub mod features;
pub mod rate;
pub mod sampler;
pub mod source;
pub mod types;

pub use aggregate::{WaitStats, WaitSummary, WindowAggregate, WindowAggregator};
pub use anomaly::{AnomalyDetector, AnomalyFlag, AnomalyMetric};
pub use buffer::{BufferedSample, SampleBuffer};
pub use features::{CaptureProfile, FeatureSet};
pub use rate::{capture_rate, categorize, inclusion_probability, load_factor};
pub use sampler::{AshSampler, SnapshotSummary};
pub use source::{SessionSource, SyntheticSessionSource};
pub use types::{SessionCategory, SessionRow, SessionSample, SessionState};
