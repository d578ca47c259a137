//! Pull interface to the monitored database, plus a synthetic generator
//! for demos and tests.

use super::features::{CaptureProfile, FeatureSet};
use super::types::{SessionRow, SessionState};
use crate::core::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use parking_lot::Mutex;
use std::time::Duration;

/// Source of session-activity snapshots
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Report what the server exposes
    async fn probe_features(&self) -> Result<FeatureSet>;

    /// Read the current sessions, requesting only what `profile` allows
    async fn capture(&self, profile: &CaptureProfile) -> Result<Vec<SessionRow>>;

    /// Name for logs
    fn name(&self) -> &str {
        "session-source"
    }
}

const DATABASES: &[&str] = &["orders", "inventory", "analytics"];
const USERS: &[&str] = &["app", "reporting", "batch", "admin"];
const APPLICATIONS: &[&str] = &["api", "worker", "psql", "etl"];

const QUERIES: &[&str] = &[
    "SELECT * FROM orders WHERE customer_id = $1",
    "SELECT count(*) FROM line_items WHERE order_id = $1",
    "UPDATE inventory SET quantity = quantity - $1 WHERE sku = $2",
    "INSERT INTO events (kind, payload) VALUES ($1, $2)",
    "DELETE FROM sessions WHERE expires_at < now()",
    "SELECT o.id, sum(l.amount) FROM orders o JOIN line_items l ON l.order_id = o.id GROUP BY o.id",
    "VACUUM ANALYZE public.events",
    "CREATE INDEX CONCURRENTLY idx_events_kind ON events (kind)",
];

const WAITS: &[(&str, &str)] = &[
    ("IO", "DataFileRead"),
    ("IO", "WALWrite"),
    ("LWLock", "BufferMapping"),
    ("Lock", "transactionid"),
    ("Lock", "relation"),
    ("Client", "ClientRead"),
    ("IPC", "BgWorkerShutdown"),
];

/// Generates plausible session activity with a configurable population
pub struct SyntheticSessionSource {
    sessions: usize,
    version: u32,
    blocking: bool,
    rng: Mutex<StdRng>,
}

impl SyntheticSessionSource {
    /// Source reporting `sessions` backends on a modern server
    pub fn new(sessions: usize) -> Self {
        Self {
            sessions,
            version: 160_002,
            blocking: true,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic output for tests
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Pretend to be an older server version
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Enable or disable lock chains
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    fn features(&self) -> FeatureSet {
        let mut columns: Vec<String> = ["pid", "datname", "usename", "application_name", "state", "query"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        if self.version >= 90_600 {
            columns.extend(["wait_event_type".to_string(), "wait_event".to_string()]);
        }
        if self.version >= 100_000 {
            columns.push("backend_type".to_string());
        }
        if self.version >= 140_000 {
            columns.push("query_id".to_string());
        }
        FeatureSet {
            version: self.version,
            extensions: vec!["plpgsql".to_string()],
            columns,
        }
    }

    fn generate(&self, rng: &mut StdRng) -> Vec<SessionRow> {
        let mut rows = Vec::with_capacity(self.sessions);
        for i in 0..self.sessions {
            let pid = 1000 + i32::try_from(i).unwrap_or(i32::MAX - 1000);
            let state = match rng.gen_range(0..100) {
                0..=44 => SessionState::Active,
                45..=84 => SessionState::Idle,
                _ => SessionState::IdleInTransaction,
            };
            let query_idx = rng.gen_range(0..QUERIES.len());
            let mut row = SessionRow {
                pid,
                database: Some(DATABASES[rng.gen_range(0..DATABASES.len())].to_string()),
                user: Some(USERS[rng.gen_range(0..USERS.len())].to_string()),
                application: Some(APPLICATIONS[rng.gen_range(0..APPLICATIONS.len())].to_string()),
                backend_type: Some("client backend".to_string()),
                state: Some(state),
                query: QUERIES[query_idx].to_string(),
                query_id: Some(i64::try_from(query_idx).unwrap_or_default() + 7_000_000),
                query_duration: Some(Duration::from_millis(rng.gen_range(1..3_000))),
                state_duration: Some(Duration::from_millis(rng.gen_range(1..8_000))),
                ..SessionRow::default()
            };

            if state == SessionState::Active && rng.gen_bool(0.4) {
                let (kind, event) = WAITS[rng.gen_range(0..WAITS.len())];
                row.wait_event_type = Some(kind.to_string());
                row.wait_event = Some(event.to_string());
            } else if state == SessionState::Idle {
                row.wait_event_type = Some("Client".to_string());
                row.wait_event = Some("ClientRead".to_string());
            }

            if self.blocking && i > 0 && row.wait_event_type.as_deref() == Some("Lock") {
                let blocker = pid - rng.gen_range(1..=i32::try_from(i.min(5)).unwrap_or(1));
                row.blocking_pids.push(blocker);
            }
            if rng.gen_bool(0.02) {
                row.backend_type = Some("autovacuum worker".to_string());
                row.query = "autovacuum: VACUUM public.events".to_string();
            }
            rows.push(row);
        }
        rows
    }
}

#[async_trait]
impl SessionSource for SyntheticSessionSource {
    async fn probe_features(&self) -> Result<FeatureSet> {
        Ok(self.features())
    }

    async fn capture(&self, profile: &CaptureProfile) -> Result<Vec<SessionRow>> {
        let mut rows = {
            let mut rng = self.rng.lock();
            self.generate(&mut rng)
        };
        for row in &mut rows {
            profile.apply(row);
        }
        Ok(rows)
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}
