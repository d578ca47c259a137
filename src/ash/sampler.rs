//! The periodic capture loop.

use super::aggregate::{WindowAggregate, WindowAggregator};
use super::anomaly::{AnomalyDetector, AnomalyFlag};
use super::buffer::SampleBuffer;
use super::features::CaptureProfile;
use super::rate::{capture_rate, categorize, inclusion_probability, smooth_rate};
use super::source::SessionSource;
use super::types::{SessionCategory, SessionRow, SessionSample, SessionState};
use crate::core::{AshConfig, GuardError, Result};
use crate::monitoring::{Counter, GuardStats};
use crate::pipeline::{OutputQueue, OutputRecord};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Per-cycle view of session activity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotSummary {
    /// Wall-clock capture time
    pub timestamp: SystemTime,
    /// All captured rows
    pub total_sessions: usize,
    /// Sessions in state `active`
    pub active: usize,
    /// Sessions in state `idle`
    pub idle: usize,
    /// Idle in transaction, aborted included
    pub idle_in_transaction: usize,
    /// Active sessions with a wait event
    pub waiting: usize,
    /// Sessions categorized as blocked
    pub blocked: usize,
    /// Sessions categorized as long-running
    pub long_running: usize,
    /// Sessions running maintenance
    pub maintenance: usize,
    /// Longest chain of sessions waiting on each other
    pub max_blocking_depth: usize,
    /// Base rate used for this cycle
    pub applied_rate: f64,
    /// Samples added to the buffer this cycle
    pub samples_taken: usize,
}

/// Active-session-history sampler
pub struct AshSampler {
    config: AshConfig,
    source: Arc<dyn SessionSource>,
    profile: CaptureProfile,
    last_probe: Option<Instant>,
    buffer: SampleBuffer,
    windows: Vec<WindowAggregator>,
    detector: AnomalyDetector,
    rng: StdRng,
    stats: Arc<GuardStats>,
    output: Option<OutputQueue>,
    last_emit: Option<Instant>,
    last_anomaly_check: Option<Instant>,
    last_rate: Option<f64>,
}

impl AshSampler {
    /// Create a sampler from validated configuration
    pub fn new(config: &AshConfig, source: Arc<dyn SessionSource>) -> Result<Self> {
        Self::with_stats(config, source, Arc::new(GuardStats::new()))
    }

    /// Create a sampler reporting into shared counters
    pub fn with_stats(config: &AshConfig, source: Arc<dyn SessionSource>, stats: Arc<GuardStats>) -> Result<Self> {
        config.validate()?;
        let mut windows: Vec<WindowAggregator> = config
            .aggregation_windows
            .iter()
            .map(|w| WindowAggregator::new(*w, config.max_wait_keys))
            .collect();
        windows.sort_by_key(WindowAggregator::window);

        Ok(Self {
            buffer: SampleBuffer::new(config.buffer_size, config.retention_duration),
            windows,
            detector: AnomalyDetector::new(&config.anomaly),
            profile: CaptureProfile::minimal(),
            last_probe: None,
            rng: StdRng::from_entropy(),
            stats,
            output: None,
            last_emit: None,
            last_anomaly_check: None,
            last_rate: None,
            config: config.clone(),
            source,
        })
    }

    /// Emit derived records into `queue`
    pub fn with_output(mut self, queue: OutputQueue) -> Self {
        self.output = Some(queue);
        self
    }

    /// Deterministic inclusion draws
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Run until `shutdown` flips to true. A failed or slow cycle is logged
    /// and skipped; the next tick proceeds on schedule.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("ASH sampler disabled");
            return;
        }
        let mut ticker = time::interval(self.config.collection_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            source = self.source.name(),
            interval = ?self.config.collection_interval,
            "ASH sampler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_at(Instant::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(samples = self.buffer.len(), "ASH sampler stopped");
    }

    /// One scheduled cycle: capture, then emit whatever is due
    pub async fn tick_at(&mut self, now: Instant) {
        match self.capture_once_at(now).await {
            Ok(summary) => {
                debug!(
                    sessions = summary.total_sessions,
                    samples = summary.samples_taken,
                    rate = summary.applied_rate,
                    "ASH cycle complete"
                );
                self.emit(OutputRecord::SessionSummary(summary));
            },
            Err(e) => {
                self.stats.incr(Counter::AshCyclesSkipped);
                warn!(error = %e, category = e.category(), "ASH capture failed, skipping cycle");
            },
        }

        for flag in self.check_anomalies_at(now) {
            self.emit(OutputRecord::Anomaly(flag));
        }
        if self
            .last_emit
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.emit_interval)
        {
            self.last_emit = Some(now);
            for aggregate in self.aggregates() {
                self.emit(OutputRecord::WaitAggregate(aggregate));
            }
        }
    }

    /// Refresh features if due, then capture. Probe and capture share one
    /// `capture_timeout` deadline.
    pub async fn capture_once_at(&mut self, now: Instant) -> Result<SnapshotSummary> {
        let deadline = time::Instant::now() + self.config.capture_timeout;
        self.refresh_features_at(now, deadline).await;

        let capture = self.source.capture(&self.profile);
        let rows = time::timeout_at(deadline, capture)
            .await
            .map_err(|_| GuardError::timeout(self.config.capture_timeout))??;
        Ok(self.ingest_at(rows, now, SystemTime::now()))
    }

    async fn refresh_features_at(&mut self, now: Instant, deadline: time::Instant) {
        let due = self
            .last_probe
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.feature_refresh_interval);
        if !due {
            return;
        }
        self.last_probe = Some(now);

        let probe = time::timeout_at(deadline, self.source.probe_features()).await;
        match probe {
            Ok(Ok(features)) => {
                let profile = CaptureProfile::from_features(&features);
                if profile != self.profile {
                    let missing = profile.missing();
                    if missing.is_empty() {
                        info!(version = features.version, "full session capture available");
                    } else {
                        warn!(version = features.version, ?missing, "session capture degraded");
                    }
                    self.profile = profile;
                }
            },
            Ok(Err(e)) => warn!(error = %e, "feature probe failed, keeping previous capture profile"),
            Err(_) => warn!("feature probe timed out, keeping previous capture profile"),
        }
    }

    /// Sample a set of captured rows
    pub fn ingest_at(&mut self, rows: Vec<SessionRow>, now: Instant, wall: SystemTime) -> SnapshotSummary {
        self.stats.incr(Counter::AshCycles);
        self.expire_at(now);

        let client_sessions = rows.iter().filter(|r| r.is_client_backend()).count();
        let target = capture_rate(&self.config.sampling, client_sessions);
        let rate = smooth_rate(&self.config.sampling, self.last_rate, target);
        self.last_rate = Some(rate);

        let mut summary = SnapshotSummary {
            timestamp: wall,
            total_sessions: rows.len(),
            active: 0,
            idle: 0,
            idle_in_transaction: 0,
            waiting: 0,
            blocked: 0,
            long_running: 0,
            maintenance: 0,
            max_blocking_depth: blocking_depth(&rows),
            applied_rate: rate,
            samples_taken: 0,
        };

        for row in &rows {
            let state = row.state();
            match state {
                SessionState::Active => summary.active += 1,
                SessionState::Idle => summary.idle += 1,
                s if s.is_idle_in_transaction() => summary.idle_in_transaction += 1,
                _ => {},
            }
            if row.is_waiting() {
                summary.waiting += 1;
            }
            let category = categorize(row, &self.config);
            match category {
                SessionCategory::Blocked => summary.blocked += 1,
                SessionCategory::LongRunning => summary.long_running += 1,
                SessionCategory::Maintenance => summary.maintenance += 1,
                SessionCategory::Normal => {},
            }

            if state == SessionState::Idle && category == SessionCategory::Normal {
                continue;
            }
            let p = inclusion_probability(rate, row, category, &self.config.sampling);
            if p >= 1.0 || self.rng.gen::<f64>() < p {
                let sample = SessionSample::from_row(row, category, self.config.query_prefix_len, wall);
                self.push_at(sample, now);
                summary.samples_taken += 1;
            }
        }

        self.stats.add(Counter::AshSamples, summary.samples_taken as u64);
        summary
    }

    fn push_at(&mut self, sample: SessionSample, now: Instant) {
        let (entry, evicted) = self.buffer.push_at(sample, now);
        for window in &mut self.windows {
            if let Some(seq) = evicted {
                window.evict_through(seq);
            }
            window.add(&entry);
        }
    }

    fn expire_at(&mut self, now: Instant) {
        let evicted = self.buffer.expire_at(now);
        for window in &mut self.windows {
            if let Some(seq) = evicted {
                window.evict_through(seq);
            }
            window.expire_at(now);
        }
    }

    /// Compare the shortest window against its baseline once per window length
    pub fn check_anomalies_at(&mut self, now: Instant) -> Vec<AnomalyFlag> {
        let Some(shortest) = self.windows.first() else {
            return Vec::new();
        };
        let due = self
            .last_anomaly_check
            .map_or(true, |at| now.saturating_duration_since(at) >= shortest.window());
        if !due {
            return Vec::new();
        }
        let first_check = self.last_anomaly_check.is_none();
        self.last_anomaly_check = Some(now);
        if first_check {
            // The first window is not complete yet.
            return Vec::new();
        }

        let flags = self.detector.evaluate(shortest, SystemTime::now());
        for flag in &flags {
            warn!(
                wait = %flag.wait_event,
                metric = %flag.metric,
                baseline = flag.baseline_value,
                observed = flag.observed_value,
                "wait anomaly"
            );
        }
        self.stats.add(Counter::Anomalies, flags.len() as u64);
        flags
    }

    /// Current aggregate for every window, shortest first
    pub fn aggregates(&self) -> Vec<WindowAggregate> {
        let now = SystemTime::now();
        self.windows.iter().map(|w| w.snapshot(now)).collect()
    }

    /// Buffered samples
    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    /// Aggregation windows, shortest first
    pub fn windows(&self) -> &[WindowAggregator] {
        &self.windows
    }

    /// Capture profile in effect
    pub fn profile(&self) -> CaptureProfile {
        self.profile
    }

    /// Rate applied in the most recent cycle
    pub fn current_rate(&self) -> f64 {
        self.last_rate.unwrap_or(self.config.sampling.max_rate)
    }

    fn emit(&self, record: OutputRecord) {
        if let Some(queue) = &self.output {
            queue.try_emit(record);
        }
    }
}

/// Longest chain of sessions waiting on each other. Walks the wait-for graph
/// with an explicit stack so arbitrarily long chains cannot exhaust the
/// thread stack. Sessions on a cycle contribute the chain up to the cycle.
fn blocking_depth(rows: &[SessionRow]) -> usize {
    let blockers: FxHashMap<i32, &[i32]> = rows
        .iter()
        .filter(|r| !r.blocking_pids.is_empty())
        .map(|r| (r.pid, r.blocking_pids.as_slice()))
        .collect();

    let mut depth: FxHashMap<i32, usize> = FxHashMap::default();
    let mut on_path: FxHashSet<i32> = FxHashSet::default();
    // (pid, index of the next holder to visit)
    let mut stack: Vec<(i32, usize)> = Vec::new();

    for &root in blockers.keys() {
        if depth.contains_key(&root) {
            continue;
        }
        stack.push((root, 0));
        on_path.insert(root);

        while let Some(top) = stack.last_mut() {
            let pid = top.0;
            let holders = blockers.get(&pid).copied().unwrap_or_default();
            if let Some(&holder) = holders.get(top.1) {
                top.1 += 1;
                if blockers.contains_key(&holder) && !depth.contains_key(&holder) && on_path.insert(holder) {
                    stack.push((holder, 0));
                }
                continue;
            }

            let deepest = holders
                .iter()
                .filter_map(|h| depth.get(h).copied())
                .max()
                .unwrap_or(0);
            depth.insert(pid, deepest + 1);
            on_path.remove(&pid);
            stack.pop();
        }
    }
    depth.into_values().max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ash::source::SyntheticSessionSource;
    use crate::ash::FeatureSet;
    use crate::core::AshSamplingConfig;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FailingSource;

    #[async_trait]
    impl SessionSource for FailingSource {
        async fn probe_features(&self) -> Result<FeatureSet> {
            Err(GuardError::probe("no connection"))
        }

        async fn capture(&self, _profile: &CaptureProfile) -> Result<Vec<SessionRow>> {
            Err(GuardError::capture("connection refused"))
        }
    }

    struct HangingSource;

    #[async_trait]
    impl SessionSource for HangingSource {
        async fn probe_features(&self) -> Result<FeatureSet> {
            Ok(FeatureSet::default())
        }

        async fn capture(&self, _profile: &CaptureProfile) -> Result<Vec<SessionRow>> {
            std::future::pending().await
        }
    }

    fn config() -> AshConfig {
        AshConfig {
            sampling: AshSamplingConfig {
                base_rate: 1.0,
                min_rate: 0.1,
                max_rate: 1.0,
                low_session_threshold: 50,
                high_session_threshold: 500,
                ..AshSamplingConfig::default()
            },
            aggregation_windows: vec![Duration::from_secs(60), Duration::from_secs(300)],
            ..AshConfig::default()
        }
    }

    fn active(pid: i32) -> SessionRow {
        SessionRow {
            pid,
            state: Some(SessionState::Active),
            query: "SELECT 1".into(),
            ..SessionRow::default()
        }
    }

    fn sampler(source: Arc<dyn SessionSource>) -> AshSampler {
        AshSampler::new(&config(), source).unwrap().with_seed(11)
    }

    #[test]
    fn test_heavy_load_uses_min_rate_but_keeps_blocked() {
        let mut ash = sampler(Arc::new(SyntheticSessionSource::new(0)));
        let mut rows: Vec<SessionRow> = (0..600).map(active).collect();
        rows.push(SessionRow {
            blocking_pids: vec![0],
            ..active(9999)
        });

        let summary = ash.ingest_at(rows, Instant::now(), SystemTime::now());
        assert_eq!(summary.applied_rate, 0.1);
        assert_eq!(summary.blocked, 1);
        assert!(ash.buffer().iter().any(|s| s.sample.session_id == 9999));
        assert!(summary.samples_taken < 400, "took {}", summary.samples_taken);
    }

    #[test]
    fn test_light_load_samples_everything_active() {
        let mut ash = sampler(Arc::new(SyntheticSessionSource::new(0)));
        let mut rows: Vec<SessionRow> = (0..20).map(active).collect();
        rows.push(SessionRow {
            state: Some(SessionState::Idle),
            ..active(100)
        });

        let summary = ash.ingest_at(rows, Instant::now(), SystemTime::now());
        assert_eq!(summary.applied_rate, 1.0);
        assert_eq!(summary.samples_taken, 20);
        assert_eq!(summary.idle, 1);
        assert_eq!(ash.windows()[0].sample_count(), 20);
    }

    #[test]
    fn test_samples_leave_aggregates_after_retention() {
        let mut cfg = config();
        cfg.retention_duration = Duration::from_secs(120);
        cfg.aggregation_windows = vec![Duration::from_secs(3600)];
        let mut ash = AshSampler::new(&cfg, Arc::new(SyntheticSessionSource::new(0))).unwrap();
        let start = Instant::now();

        ash.ingest_at(vec![active(1)], start, SystemTime::now());
        assert_eq!(ash.windows()[0].wait_stats("CPU").map(|s| s.count), Some(1));

        ash.ingest_at(Vec::new(), start + Duration::from_secs(121), SystemTime::now());
        assert!(ash.windows()[0].wait_stats("CPU").is_none());
        assert!(ash.buffer().is_empty());
    }

    #[test]
    fn test_blocking_depth() {
        let chain = vec![
            SessionRow { pid: 1, ..SessionRow::default() },
            SessionRow { pid: 2, blocking_pids: vec![1], ..SessionRow::default() },
            SessionRow { pid: 3, blocking_pids: vec![2], ..SessionRow::default() },
            SessionRow { pid: 4, blocking_pids: vec![3], ..SessionRow::default() },
        ];
        assert_eq!(blocking_depth(&chain), 3);

        let cycle = vec![
            SessionRow { pid: 1, blocking_pids: vec![2], ..SessionRow::default() },
            SessionRow { pid: 2, blocking_pids: vec![1], ..SessionRow::default() },
        ];
        assert!(blocking_depth(&cycle) <= 2);
    }

    #[test]
    fn test_blocking_depth_of_very_long_chain() {
        let n = 50_000;
        let chain: Vec<SessionRow> = (0..n)
            .map(|pid| SessionRow {
                pid,
                blocking_pids: if pid == 0 { Vec::new() } else { vec![pid - 1] },
                ..SessionRow::default()
            })
            .collect();
        assert_eq!(blocking_depth(&chain), (n - 1) as usize);
    }

    #[test]
    fn test_idle_connections_count_towards_load() {
        let mut ash = sampler(Arc::new(SyntheticSessionSource::new(0)));
        let mut rows: Vec<SessionRow> = (0..560)
            .map(|pid| SessionRow {
                state: Some(SessionState::Idle),
                ..active(pid)
            })
            .collect();
        rows.extend((560..600).map(active));
        rows.push(SessionRow {
            backend_type: Some("autovacuum worker".into()),
            ..active(900)
        });

        let summary = ash.ingest_at(rows, Instant::now(), SystemTime::now());
        assert_eq!(summary.total_sessions, 601);
        assert_eq!(summary.applied_rate, 0.1);
        assert_eq!(ash.current_rate(), 0.1);
    }

    #[test]
    fn test_smoothed_rate_moves_gradually() {
        let mut cfg = config();
        cfg.sampling.rate_smoothing = 0.5;
        let mut ash = AshSampler::new(&cfg, Arc::new(SyntheticSessionSource::new(0))).unwrap();
        assert_eq!(ash.current_rate(), 1.0);

        let now = Instant::now();
        let light: Vec<SessionRow> = (0..10).map(active).collect();
        assert_eq!(ash.ingest_at(light, now, SystemTime::now()).applied_rate, 1.0);

        let heavy = || (0..800).map(active).collect::<Vec<_>>();
        let first = ash.ingest_at(heavy(), now, SystemTime::now()).applied_rate;
        let second = ash.ingest_at(heavy(), now, SystemTime::now()).applied_rate;
        assert!((first - 0.55).abs() < 1e-9, "first heavy cycle {first}");
        assert!(second < first && second >= cfg.sampling.min_rate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_and_capture_share_one_deadline() {
        struct SlowSource;

        #[async_trait]
        impl SessionSource for SlowSource {
            async fn probe_features(&self) -> Result<FeatureSet> {
                time::sleep(Duration::from_millis(600)).await;
                Ok(FeatureSet::default())
            }

            async fn capture(&self, _profile: &CaptureProfile) -> Result<Vec<SessionRow>> {
                time::sleep(Duration::from_millis(600)).await;
                Ok(Vec::new())
            }
        }

        let mut cfg = config();
        cfg.capture_timeout = Duration::from_millis(1000);
        let mut ash = AshSampler::new(&cfg, Arc::new(SlowSource)).unwrap();

        let started = time::Instant::now();
        let err = ash.capture_once_at(Instant::now()).await.unwrap_err();
        assert!(matches!(err, GuardError::Timeout { .. }));
        assert!(started.elapsed() <= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_failed_capture_is_skipped() {
        let stats = Arc::new(GuardStats::new());
        let mut ash = AshSampler::with_stats(&config(), Arc::new(FailingSource), Arc::clone(&stats)).unwrap();

        ash.tick_at(Instant::now()).await;
        ash.tick_at(Instant::now()).await;
        assert_eq!(stats.get(Counter::AshCyclesSkipped), 2);
        assert_eq!(ash.profile(), CaptureProfile::minimal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_capture_times_out() {
        let mut ash = sampler(Arc::new(HangingSource));
        let err = ash.capture_once_at(Instant::now()).await.unwrap_err();
        assert!(matches!(err, GuardError::Timeout { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_emits_summary_and_aggregates() {
        let stats = Arc::new(GuardStats::new());
        let (queue, mut rx) = OutputQueue::bounded(64, Arc::clone(&stats));
        let mut ash = AshSampler::with_stats(
            &config(),
            Arc::new(SyntheticSessionSource::new(30).with_seed(3)),
            Arc::clone(&stats),
        )
        .unwrap()
        .with_output(queue);

        ash.tick_at(Instant::now()).await;
        assert_eq!(ash.profile(), CaptureProfile::full());

        let kinds: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok()).map(|r| r.kind()).collect();
        assert_eq!(kinds, vec!["session_summary", "wait_aggregate", "wait_aggregate"]);
        assert_eq!(stats.get(Counter::AshCycles), 1);
    }
}
