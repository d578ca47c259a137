//! Load-adaptive capture rate and session categorization.

use super::types::{truncate_chars, SessionCategory, SessionRow, SessionState};
use crate::core::{AshConfig, AshSamplingConfig};

/// Characters of query text inspected for maintenance keywords
const MAINTENANCE_SCAN_CHARS: usize = 100;

const MAINTENANCE_PREFIXES: &[&str] = &[
    "VACUUM",
    "ANALYZE",
    "REINDEX",
    "CREATE INDEX",
    "CREATE UNIQUE INDEX",
    "DROP INDEX",
    "ALTER TABLE",
    "CLUSTER",
    "CHECKPOINT",
];

const ACTIVE_MULTIPLIER: f64 = 2.0;
const WAITING_MULTIPLIER: f64 = 1.5;
const DML_MULTIPLIER: f64 = 2.0;

/// Load factor in [0, 1]: 1 at or below `low`, falling linearly to 0 at `high`
pub fn load_factor(sessions: usize, low: usize, high: usize) -> f64 {
    if sessions <= low {
        1.0
    } else if sessions >= high {
        0.0
    } else {
        let span = (high - low) as f64;
        1.0 - (sessions - low) as f64 / span
    }
}

/// Base capture rate for the current session count
pub fn capture_rate(config: &AshSamplingConfig, sessions: usize) -> f64 {
    let f = load_factor(sessions, config.low_session_threshold, config.high_session_threshold);
    (config.base_rate * f).clamp(config.min_rate, config.max_rate)
}

/// Blend the freshly computed rate into the previous one. The first cycle
/// takes `target` as is; the result stays within `[min_rate, max_rate]`.
pub fn smooth_rate(config: &AshSamplingConfig, previous: Option<f64>, target: f64) -> f64 {
    let alpha = config.rate_smoothing;
    let blended = match previous {
        Some(prev) => prev * (1.0 - alpha) + target * alpha,
        None => target,
    };
    blended.clamp(config.min_rate, config.max_rate)
}

/// Decide the category of a session
pub fn categorize(row: &SessionRow, config: &AshConfig) -> SessionCategory {
    let lock_wait = row.wait_event_type.as_deref() == Some("Lock")
        && row
            .state_duration
            .is_some_and(|d| d >= config.blocked_session_threshold);
    if !row.blocking_pids.is_empty() || lock_wait {
        return SessionCategory::Blocked;
    }
    if row.state() == SessionState::Active
        && row
            .query_duration
            .is_some_and(|d| d > config.slow_query_threshold)
    {
        return SessionCategory::LongRunning;
    }
    if is_maintenance(row) {
        return SessionCategory::Maintenance;
    }
    SessionCategory::Normal
}

fn is_maintenance(row: &SessionRow) -> bool {
    if row
        .backend_type
        .as_deref()
        .is_some_and(|b| b.to_ascii_lowercase().contains("autovacuum"))
    {
        return true;
    }
    let head = truncate_chars(row.query.trim_start(), MAINTENANCE_SCAN_CHARS).to_ascii_uppercase();
    MAINTENANCE_PREFIXES.iter().any(|p| head.starts_with(p))
}

fn is_dml(query: &str) -> bool {
    let head = truncate_chars(query.trim_start(), 8).to_ascii_uppercase();
    ["INSERT", "UPDATE", "DELETE"].iter().any(|k| head.starts_with(k))
}

/// Probability of capturing one session at `rate`
pub fn inclusion_probability(
    rate: f64,
    row: &SessionRow,
    category: SessionCategory,
    config: &AshSamplingConfig,
) -> f64 {
    let always = match category {
        SessionCategory::Blocked => config.always_sample_blocked,
        SessionCategory::LongRunning => config.always_sample_long_running,
        SessionCategory::Maintenance => config.always_sample_maintenance,
        SessionCategory::Normal => false,
    };
    if always {
        return 1.0;
    }

    let mut p = rate;
    if row.is_waiting() {
        p *= WAITING_MULTIPLIER;
    } else if row.state() == SessionState::Active {
        p *= ACTIVE_MULTIPLIER;
    }
    if is_dml(&row.query) {
        p *= DML_MULTIPLIER;
    }
    p.min(1.0)
}
