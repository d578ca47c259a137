//! Baseline comparison of wait-event activity.

use super::aggregate::WindowAggregator;
use crate::core::AnomalyConfig;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::SystemTime;

/// Which figure deviated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyMetric {
    /// Samples observed for the wait event in the window
    WaitCount,
    /// Mean query duration of those samples
    WaitDuration,
}

impl fmt::Display for AnomalyMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyMetric::WaitCount => write!(f, "wait_count"),
            AnomalyMetric::WaitDuration => write!(f, "wait_duration"),
        }
    }
}

/// Observed value exceeded its baseline by the configured multiple
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyFlag {
    /// Which statistic departed
    pub metric: AnomalyMetric,
    /// Wait key that departed from its baseline
    pub wait_event: String,
    /// Mean over the baseline windows
    pub baseline_value: f64,
    /// Value in the window just completed
    pub observed_value: f64,
    /// observed / baseline
    pub score: f64,
    /// Length of the evaluated window
    pub window_secs: u64,
    /// When the flag was raised
    pub timestamp: SystemTime,
}

#[derive(Debug, Default)]
struct History {
    counts: VecDeque<f64>,
    durations: VecDeque<f64>,
}

impl History {
    fn push(&mut self, count: f64, duration: f64, keep: usize) {
        self.counts.push_back(count);
        self.durations.push_back(duration);
        while self.counts.len() > keep {
            self.counts.pop_front();
            self.durations.pop_front();
        }
    }

    fn is_quiet(&self) -> bool {
        self.counts.iter().all(|c| *c == 0.0)
    }
}

fn mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Compares each completed window against the mean of the previous ones
#[derive(Debug)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
    history: FxHashMap<String, History>,
}

impl AnomalyDetector {
    /// Detector with empty histories
    pub fn new(config: &AnomalyConfig) -> Self {
        Self {
            config: config.clone(),
            history: FxHashMap::default(),
        }
    }

    /// Evaluate the window's current contents, then fold them into the baseline
    pub fn evaluate(&mut self, window: &WindowAggregator, timestamp: SystemTime) -> Vec<AnomalyFlag> {
        if !self.config.enabled {
            return Vec::new();
        }
        let keep = self.config.baseline_windows;
        let mut flags = Vec::new();

        for (wait, stats) in window.waits() {
            let count = stats.count as f64;
            let duration = stats.mean_duration_ms();
            let history = self.history.entry(wait.to_string()).or_default();

            if stats.count >= self.config.min_samples {
                let checks = [
                    (AnomalyMetric::WaitCount, mean(&history.counts), count),
                    (AnomalyMetric::WaitDuration, mean(&history.durations), duration),
                ];
                for (metric, baseline, observed) in checks {
                    if baseline > 0.0 && observed > baseline * self.config.threshold_multiple {
                        flags.push(AnomalyFlag {
                            metric,
                            wait_event: wait.to_string(),
                            baseline_value: baseline,
                            observed_value: observed,
                            score: observed / baseline,
                            window_secs: window.window().as_secs(),
                            timestamp,
                        });
                    }
                }
            }
            history.push(count, duration, keep);
        }

        // Waits absent from this window contribute zeros; fully quiet ones are forgotten.
        self.history.retain(|wait, history| {
            if window.wait_stats(wait).is_none() {
                history.push(0.0, 0.0, keep);
            }
            !history.is_quiet()
        });
        flags
    }

    /// Wait events with a baseline
    pub fn tracked(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ash::buffer::SampleBuffer;
    use crate::ash::types::{SessionCategory, SessionSample, SessionState};
    use std::time::{Duration, Instant};

    fn lock_sample(duration_ms: u64) -> SessionSample {
        SessionSample {
            sample_time: SystemTime::now(),
            session_id: 1,
            state: SessionState::Active,
            wait_event_type: Some("Lock".into()),
            wait_event: Some("tuple".into()),
            query_prefix: String::new(),
            blocking_session_id: None,
            category: SessionCategory::Normal,
            database: None,
            user: None,
            query_id: None,
            duration_ms: Some(duration_ms),
        }
    }

    fn window_with(samples: usize, duration_ms: u64) -> WindowAggregator {
        let mut buffer = SampleBuffer::new(10_000, Duration::from_secs(3600));
        let mut agg = WindowAggregator::new(Duration::from_secs(60), 100);
        let now = Instant::now();
        for _ in 0..samples {
            agg.add(&buffer.push_at(lock_sample(duration_ms), now).0);
        }
        agg
    }

    fn config() -> AnomalyConfig {
        AnomalyConfig {
            enabled: true,
            threshold_multiple: 3.0,
            baseline_windows: 4,
            min_samples: 5,
        }
    }

    #[test]
    fn test_spike_over_baseline_is_flagged() {
        let mut detector = AnomalyDetector::new(&config());
        for _ in 0..4 {
            assert!(detector.evaluate(&window_with(10, 50), SystemTime::now()).is_empty());
        }

        let flags = detector.evaluate(&window_with(40, 50), SystemTime::now());
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].metric, AnomalyMetric::WaitCount);
        assert_eq!(flags[0].wait_event, "Lock:tuple");
        assert_eq!(flags[0].baseline_value, 10.0);
        assert_eq!(flags[0].score, 4.0);
    }

    #[test]
    fn test_duration_spike_is_flagged() {
        let mut detector = AnomalyDetector::new(&config());
        detector.evaluate(&window_with(10, 100), SystemTime::now());
        let flags = detector.evaluate(&window_with(10, 1000), SystemTime::now());
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].metric, AnomalyMetric::WaitDuration);
    }

    #[test]
    fn test_needs_baseline_and_min_samples() {
        let mut detector = AnomalyDetector::new(&config());
        assert!(detector.evaluate(&window_with(100, 10), SystemTime::now()).is_empty());

        let mut detector = AnomalyDetector::new(&config());
        detector.evaluate(&window_with(1, 10), SystemTime::now());
        assert!(detector.evaluate(&window_with(4, 10), SystemTime::now()).is_empty());
    }

    #[test]
    fn test_quiet_waits_are_forgotten() {
        let mut detector = AnomalyDetector::new(&config());
        detector.evaluate(&window_with(10, 10), SystemTime::now());
        assert_eq!(detector.tracked(), 1);
        for _ in 0..4 {
            detector.evaluate(&window_with(0, 10), SystemTime::now());
        }
        assert_eq!(detector.tracked(), 0);
    }
}
