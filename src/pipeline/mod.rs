//! Admission pipeline: breaker gate, outcome feed, sampler, output queue.
//!
//! `process` runs synchronously on whichever worker delivers the record. It
//! performs no I/O; survivors are handed to the bounded output queue without
//! waiting.

pub mod output;

pub use output::{BreakerEvent, OutputQueue, OutputRecord, OverflowEvent};

use crate::breaker::{CircuitBreaker, OutcomeClass, RejectReason};
use crate::core::{Config, ResourceId, Result, TelemetryRecord};
use crate::monitoring::{Counter, GuardStats, SystemHealth};
use crate::sampling::{AdaptiveSampler, Verdict};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::info;

/// What happened to one record
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Passed downstream with sampling annotations
    Kept(Verdict),
    /// Dropped by the sampler
    Dropped(Verdict),
    /// Rejected by the resource's breaker
    Rejected(RejectReason),
}

impl Disposition {
    /// True for `Kept`
    pub fn is_kept(&self) -> bool {
        matches!(self, Disposition::Kept(_))
    }
}

/// Breaker and sampler wired onto one output queue
pub struct AdmissionPipeline {
    breaker: CircuitBreaker,
    sampler: AdaptiveSampler,
    queue: OutputQueue,
    stats: Arc<GuardStats>,
    report_record_errors: bool,
    resource_attribute: String,
}

impl AdmissionPipeline {
    /// Build every component from a validated configuration. The returned
    /// receiver is the exporter side of the output queue.
    pub fn new(config: &Config) -> Result<(Self, mpsc::Receiver<OutputRecord>)> {
        config.validate()?;
        let stats = Arc::new(GuardStats::new());
        let (queue, rx) = OutputQueue::bounded(config.pipeline.output_queue_capacity, Arc::clone(&stats));

        let breaker = CircuitBreaker::with_stats(&config.circuit_breaker, Arc::clone(&stats))?
            .with_events(queue.clone())
            .with_query_attribute(&config.sampler.query_attribute);
        let sampler = AdaptiveSampler::with_stats(&config.sampler, Arc::clone(&stats))?;
        info!(
            rules = sampler.rules().len(),
            default_rate = config.sampler.default_sampling_rate,
            failure_threshold = config.circuit_breaker.failure_threshold,
            "admission pipeline ready"
        );

        Ok((
            Self {
                breaker,
                sampler,
                queue,
                stats,
                report_record_errors: config.pipeline.report_record_errors,
                resource_attribute: config.sampler.resource_attribute.clone(),
            },
            rx,
        ))
    }

    /// Admit one record now
    pub fn process(&self, record: TelemetryRecord) -> Disposition {
        self.process_at(record, Instant::now())
    }

    /// Admit one record at an explicit instant. Records without a resource
    /// id skip the breaker and go straight to the sampler.
    pub fn process_at(&self, mut record: TelemetryRecord, now: Instant) -> Disposition {
        self.stats.incr(Counter::RecordsIn);

        if let Some(resource) = record.resource_id_from(&self.resource_attribute) {
            let admission = self.breaker.admit_at(&resource, &mut record, now);
            if let Some(reason) = admission.reason.filter(|_| !admission.allowed) {
                return Disposition::Rejected(reason);
            }
            if self.report_record_errors {
                self.breaker
                    .report_outcome_at(&resource, !record.is_error(), record.error_message(), now);
            }
        }

        let verdict = self.sampler.evaluate_at(&record, now);
        if !verdict.keep {
            return Disposition::Dropped(verdict);
        }
        verdict.annotate(&mut record);
        self.stats.incr(Counter::Kept);
        self.queue.try_emit(OutputRecord::Telemetry(record));
        Disposition::Kept(verdict)
    }

    /// Feed an out-of-band outcome, e.g. an export result, to the breaker
    pub fn report_outcome(&self, resource: &ResourceId, success: bool, error_text: &str) -> OutcomeClass {
        self.breaker.report_outcome(resource, success, error_text)
    }

    /// Push a counter snapshot downstream
    pub fn emit_stats(&self) -> bool {
        self.queue.try_emit(OutputRecord::Stats(self.stats.snapshot()))
    }

    /// Overall health given the ASH capture status
    pub fn health(&self, capture_failing: bool) -> SystemHealth {
        SystemHealth::assess(self.breaker.tracked(), self.breaker.not_closed(), capture_failing)
    }

    /// Handle for other producers, such as the ASH sampler
    pub fn queue(&self) -> OutputQueue {
        self.queue.clone()
    }

    /// Shared counters
    pub fn stats(&self) -> Arc<GuardStats> {
        Arc::clone(&self.stats)
    }

    /// The breaker stage
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The sampler stage
    pub fn sampler(&self) -> &AdaptiveSampler {
        &self.sampler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use crate::core::{attrs, ConfigBuilder};

    fn pipeline(rate: f64) -> (AdmissionPipeline, mpsc::Receiver<OutputRecord>) {
        let config = ConfigBuilder::new()
            .sampling_rate(rate)
            .failure_threshold(3)
            .build()
            .unwrap();
        AdmissionPipeline::new(&config).unwrap()
    }

    fn record(db: &str, query: usize) -> TelemetryRecord {
        TelemetryRecord::new("db.query.duration")
            .with_attr(attrs::RESOURCE_ID, db)
            .with_attr(attrs::QUERY_ID, format!("q{query}"))
            .with_attr(attrs::DURATION_MS, 12)
    }

    fn failing(db: &str) -> TelemetryRecord {
        record(db, 0)
            .with_attr(attrs::ERROR, true)
            .with_attr(attrs::ERROR_MESSAGE, "connection refused")
    }

    #[tokio::test]
    async fn test_kept_records_are_annotated_and_queued() {
        let (pipeline, mut rx) = pipeline(1.0);
        assert!(pipeline.process(record("db1", 1)).is_kept());

        match rx.recv().await.unwrap() {
            OutputRecord::Telemetry(r) => {
                assert_eq!(r.attr(attrs::SAMPLING_RATE).and_then(|v| v.as_f64()), Some(1.0));
                assert!(r.attr(attrs::SAMPLING_RULE).is_some());
            },
            other => panic!("unexpected record {other:?}"),
        }
        assert_eq!(pipeline.stats().get(Counter::Kept), 1);
    }

    #[test]
    fn test_error_records_trip_the_breaker() {
        let (pipeline, _rx) = pipeline(1.0);
        let now = Instant::now();
        for _ in 0..3 {
            pipeline.process_at(failing("db1"), now);
        }
        let db1 = ResourceId::new("db1").unwrap();
        assert_eq!(pipeline.breaker().state(&db1), Some(CircuitState::Open));
        assert_eq!(
            pipeline.process_at(record("db1", 2), now),
            Disposition::Rejected(RejectReason::CircuitOpen)
        );
        assert!(pipeline.process_at(record("db2", 2), now).is_kept());
        assert_eq!(pipeline.health(false), SystemHealth::Degraded);
    }

    #[test]
    fn test_zero_rate_drops_unmatched_records() {
        let config = ConfigBuilder::new()
            .sampling_rate(0.0)
            .rules(Vec::new())
            .build()
            .unwrap();
        let (pipeline, _rx) = AdmissionPipeline::new(&config).unwrap();
        for i in 0..200 {
            assert!(!pipeline.process(record("db1", i)).is_kept());
        }
        assert_eq!(pipeline.stats().get(Counter::SampledOut), 200);
    }

    #[tokio::test]
    async fn test_stats_are_emitted() {
        let (pipeline, mut rx) = pipeline(0.0);
        pipeline.process(record("db1", 1));
        assert!(pipeline.emit_stats());
        let mut saw_stats = false;
        while let Ok(r) = rx.try_recv() {
            if let OutputRecord::Stats(s) = r {
                assert_eq!(s.records_in, 1);
                saw_stats = true;
            }
        }
        assert!(saw_stats);
    }
}
