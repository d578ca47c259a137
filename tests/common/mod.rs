//! Common test utilities and fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use dbwarden_lib::ash::{CaptureProfile, FeatureSet, SessionRow, SessionSource, SessionState};
use dbwarden_lib::core::{attrs, GuardError, Result, TelemetryRecord};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Test fixture builder for query records with sensible defaults.
pub struct QueryRecordBuilder {
    database: String,
    query_id: String,
    user: Option<String>,
    duration_ms: i64,
    error: Option<String>,
    plan_hash: Option<String>,
}

impl QueryRecordBuilder {
    pub fn new(database: &str, query_num: usize) -> Self {
        Self {
            database: database.to_string(),
            query_id: format!("query-{query_num:05}"),
            user: None,
            duration_ms: 25,
            error: None,
            plan_hash: None,
        }
    }

    pub fn duration_ms(mut self, ms: i64) -> Self {
        self.duration_ms = ms;
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn with_error(mut self, message: &str) -> Self {
        self.error = Some(message.to_string());
        self
    }

    pub fn plan_hash(mut self, hash: &str) -> Self {
        self.plan_hash = Some(hash.to_string());
        self
    }

    pub fn build(self) -> TelemetryRecord {
        let mut record = TelemetryRecord::new("db.query.duration")
            .with_attr(attrs::RESOURCE_ID, self.database)
            .with_attr(attrs::QUERY_ID, self.query_id)
            .with_attr(attrs::DURATION_MS, self.duration_ms);
        if let Some(user) = self.user {
            record.set_attr(attrs::USER_ID, user);
        }
        if let Some(message) = self.error {
            record.set_attr(attrs::ERROR, true);
            record.set_attr(attrs::ERROR_MESSAGE, message);
        }
        if let Some(hash) = self.plan_hash {
            record.set_attr(attrs::PLAN_HASH, hash);
        }
        record
    }
}

/// Shorthand for a plain query record.
pub fn query(database: &str, query_num: usize, duration_ms: i64) -> TelemetryRecord {
    QueryRecordBuilder::new(database, query_num)
        .duration_ms(duration_ms)
        .build()
}

/// An active session running `query`.
pub fn active_session(pid: i32, query: &str) -> SessionRow {
    SessionRow {
        pid,
        database: Some("orders".to_string()),
        user: Some("app".to_string()),
        state: Some(SessionState::Active),
        query: query.to_string(),
        query_duration: Some(Duration::from_millis(40)),
        state_duration: Some(Duration::from_millis(40)),
        ..SessionRow::default()
    }
}

/// An active session waiting on `kind:event`.
pub fn waiting_session(pid: i32, kind: &str, event: &str) -> SessionRow {
    SessionRow {
        wait_event_type: Some(kind.to_string()),
        wait_event: Some(event.to_string()),
        ..active_session(pid, "SELECT * FROM orders WHERE id = $1")
    }
}

/// Session source replaying a fixed script of capture results.
/// Once the script is exhausted every capture returns no sessions.
pub struct ScriptedSessionSource {
    features: FeatureSet,
    script: Mutex<VecDeque<Result<Vec<SessionRow>>>>,
}

impl ScriptedSessionSource {
    pub fn new(script: Vec<Result<Vec<SessionRow>>>) -> Self {
        Self {
            features: FeatureSet {
                version: 160_002,
                extensions: Vec::new(),
                columns: ["pid", "state", "query", "wait_event_type", "wait_event", "backend_type"]
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
            },
            script: Mutex::new(script.into()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl SessionSource for ScriptedSessionSource {
    async fn probe_features(&self) -> Result<FeatureSet> {
        Ok(self.features.clone())
    }

    async fn capture(&self, profile: &CaptureProfile) -> Result<Vec<SessionRow>> {
        let next = self.script.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()));
        next.map(|mut rows| {
            for row in &mut rows {
                profile.apply(row);
            }
            rows
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A capture failure as a connectivity error would surface.
pub fn connection_lost() -> Result<Vec<SessionRow>> {
    Err(GuardError::capture("connection to server was lost"))
}
