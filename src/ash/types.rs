//! Session rows as read from the database and samples as retained.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

/// Backend state as reported by the session-activity view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Executing a query
    Active,
    /// Waiting for a client command
    Idle,
    /// Inside a transaction, not executing
    IdleInTransaction,
    /// Inside a failed transaction
    IdleInTransactionAborted,
    /// Executing a fast-path function
    FastpathFunctionCall,
    /// State tracking disabled for the backend
    Disabled,
    /// State not reported or not recognised
    Unknown,
}

impl SessionState {
    /// Parse the textual state column
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().as_str() {
            "active" => SessionState::Active,
            "idle" => SessionState::Idle,
            "idle in transaction" => SessionState::IdleInTransaction,
            "idle in transaction (aborted)" => SessionState::IdleInTransactionAborted,
            "fastpath function call" => SessionState::FastpathFunctionCall,
            "disabled" => SessionState::Disabled,
            _ => SessionState::Unknown,
        }
    }

    /// Name as reported by the server
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Idle => "idle",
            SessionState::IdleInTransaction => "idle_in_transaction",
            SessionState::IdleInTransactionAborted => "idle_in_transaction_aborted",
            SessionState::FastpathFunctionCall => "fastpath_function_call",
            SessionState::Disabled => "disabled",
            SessionState::Unknown => "unknown",
        }
    }

    /// Idle in a transaction, aborted or not
    pub fn is_idle_in_transaction(self) -> bool {
        matches!(
            self,
            SessionState::IdleInTransaction | SessionState::IdleInTransactionAborted
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the session-activity query
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionRow {
    /// Backend process id
    pub pid: i32,
    /// Connected database
    pub database: Option<String>,
    pub user: Option<String>,
    /// Client application name
    pub application: Option<String>,
    /// e.g. `client backend`, `autovacuum worker`
    pub backend_type: Option<String>,
    /// Session state, when reported
    pub state: Option<SessionState>,
    /// Wait class, e.g. `Lock` or `IO`
    pub wait_event_type: Option<String>,
    /// Specific wait event within the class
    pub wait_event: Option<String>,
    /// Full query text as reported
    pub query: String,
    /// Server-computed query identifier
    pub query_id: Option<i64>,
    /// Time since the current query started
    pub query_duration: Option<Duration>,
    /// Time since the state last changed
    pub state_duration: Option<Duration>,
    /// Sessions holding locks this one waits on
    pub blocking_pids: Vec<i32>,
}

impl SessionRow {
    /// Reported state, `Unknown` when absent
    pub fn state(&self) -> SessionState {
        self.state.unwrap_or(SessionState::Unknown)
    }

    /// Regular client connection, counted towards load. Rows that do not
    /// report a backend type are assumed to be clients.
    pub fn is_client_backend(&self) -> bool {
        self.backend_type.as_deref().map_or(true, |b| b == "client backend")
    }

    /// True when the session is waiting on something
    pub fn is_waiting(&self) -> bool {
        self.wait_event_type.is_some() && self.state() == SessionState::Active
    }
}

/// Sampling category of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCategory {
    /// Waiting on another session's lock
    Blocked,
    /// Active past the slow-query threshold
    LongRunning,
    /// Vacuum, index builds and other maintenance
    Maintenance,
    /// Everything else; subject to the adaptive rate
    Normal,
}

impl fmt::Display for SessionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionCategory::Blocked => "blocked",
            SessionCategory::LongRunning => "long_running",
            SessionCategory::Maintenance => "maintenance",
            SessionCategory::Normal => "normal",
        };
        f.write_str(s)
    }
}

/// A captured session, immutable once buffered
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSample {
    /// Wall-clock capture time
    pub sample_time: SystemTime,
    /// Backend process id
    pub session_id: i32,
    /// Session state at capture
    pub state: SessionState,
    /// Wait class at capture
    pub wait_event_type: Option<String>,
    /// Wait event at capture
    pub wait_event: Option<String>,
    /// Query text cut to the configured prefix length
    pub query_prefix: String,
    /// First blocking session, if any
    pub blocking_session_id: Option<i32>,
    /// Why the session was eligible
    pub category: SessionCategory,
    /// Connected database
    pub database: Option<String>,
    pub user: Option<String>,
    /// Server-computed query identifier
    pub query_id: Option<i64>,
    /// Time in the current query
    pub duration_ms: Option<u64>,
}

impl SessionSample {
    /// Build a sample from a row, bounding the query text
    pub fn from_row(row: &SessionRow, category: SessionCategory, prefix_len: usize, at: SystemTime) -> Self {
        Self {
            sample_time: at,
            session_id: row.pid,
            state: row.state(),
            wait_event_type: row.wait_event_type.clone(),
            wait_event: row.wait_event.clone(),
            query_prefix: truncate_chars(&row.query, prefix_len).to_string(),
            blocking_session_id: row.blocking_pids.first().copied(),
            category,
            database: row.database.clone(),
            user: row.user.clone(),
            query_id: row.query_id,
            duration_ms: row
                .query_duration
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Aggregation key: `Type:Event`, `CPU` for running sessions, else the state
    pub fn wait_key(&self) -> String {
        match (&self.wait_event_type, &self.wait_event) {
            (Some(kind), Some(event)) => format!("{kind}:{event}"),
            (Some(kind), None) => kind.clone(),
            _ if self.state == SessionState::Active => "CPU".to_string(),
            _ => self.state.as_str().to_string(),
        }
    }
}

/// Longest prefix of `text` with at most `max` characters
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_parsing() {
        assert_eq!(SessionState::parse("active"), SessionState::Active);
        assert_eq!(SessionState::parse("idle in transaction"), SessionState::IdleInTransaction);
        assert_eq!(
            SessionState::parse("idle in transaction (aborted)"),
            SessionState::IdleInTransactionAborted
        );
        assert_eq!(SessionState::parse("something new"), SessionState::Unknown);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("SELECT 1", 100), "SELECT 1");
        assert_eq!(truncate_chars("SELECT 1", 6), "SELECT");
        assert_eq!(truncate_chars("żółw", 2), "żó");
    }

    #[test]
    fn test_wait_key() {
        let row = SessionRow {
            pid: 7,
            state: Some(SessionState::Active),
            wait_event_type: Some("Lock".into()),
            wait_event: Some("relation".into()),
            ..SessionRow::default()
        };
        let sample = SessionSample::from_row(&row, SessionCategory::Normal, 10, SystemTime::now());
        assert_eq!(sample.wait_key(), "Lock:relation");

        let running = SessionRow {
            state: Some(SessionState::Active),
            ..SessionRow::default()
        };
        let sample = SessionSample::from_row(&running, SessionCategory::Normal, 10, SystemTime::now());
        assert_eq!(sample.wait_key(), "CPU");
    }
}
