//! Outbound records and the queue that carries them to the exporter layer.

use crate::ash::{AnomalyFlag, SnapshotSummary, WindowAggregate};
use crate::breaker::CircuitState;
use crate::core::{GuardError, ResourceId, Result, TelemetryRecord};
use crate::monitoring::{Counter, GuardStats, StatsSnapshot};
use crate::tracking::Dimension;
use serde::Serialize;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Everything the admission layer hands downstream
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputRecord {
    /// A surviving telemetry record, annotated
    Telemetry(TelemetryRecord),
    /// Per-cycle session activity summary
    SessionSummary(SnapshotSummary),
    /// Rolling wait-event aggregate for one window
    WaitAggregate(WindowAggregate),
    /// Wait-event anomaly
    Anomaly(AnomalyFlag),
    /// First key coalesced into overflow in a window
    CardinalityOverflow(OverflowEvent),
    /// Breaker state change
    BreakerTransition(BreakerEvent),
    /// Counter snapshot
    Stats(StatsSnapshot),
}

impl OutputRecord {
    /// Short name of the variant, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            OutputRecord::Telemetry(_) => "telemetry",
            OutputRecord::SessionSummary(_) => "session_summary",
            OutputRecord::WaitAggregate(_) => "wait_aggregate",
            OutputRecord::Anomaly(_) => "anomaly",
            OutputRecord::CardinalityOverflow(_) => "cardinality_overflow",
            OutputRecord::BreakerTransition(_) => "breaker_transition",
            OutputRecord::Stats(_) => "stats",
        }
    }
}

/// Cardinality protection engaged for a resource
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverflowEvent {
    /// Resource whose limit was reached
    pub resource: ResourceId,
    /// Which key dimension overflowed
    pub dimension: Dimension,
    /// Configured distinct-key limit
    pub limit: usize,
    /// When the limit was first exceeded
    pub timestamp: SystemTime,
}

/// Breaker state change for a resource
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerEvent {
    /// Resource that changed state
    pub resource: ResourceId,
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
    /// Open duration after the transition
    pub backoff_ms: u64,
    /// Failures in the window at transition time
    pub failures: u32,
    /// When the transition happened
    pub timestamp: SystemTime,
}

/// Cloneable handle onto the bounded outbound queue
#[derive(Debug, Clone)]
pub struct OutputQueue {
    tx: mpsc::Sender<OutputRecord>,
    stats: Arc<GuardStats>,
}

impl OutputQueue {
    /// Create a queue and its receiving end
    pub fn bounded(capacity: usize, stats: Arc<GuardStats>) -> (Self, mpsc::Receiver<OutputRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, stats }, rx)
    }

    /// Enqueue without waiting. A full queue drops the record and counts it.
    pub fn try_emit(&self, record: OutputRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                self.stats.incr(Counter::OutputDropped);
                debug!(kind = dropped.kind(), "output queue full, record dropped");
                false
            },
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Enqueue, waiting for capacity
    pub async fn emit(&self, record: OutputRecord) -> Result<()> {
        self.tx.send(record).await.map_err(|_| GuardError::ChannelClosed)
    }

    /// True once the receiver is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
