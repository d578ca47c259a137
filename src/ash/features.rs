//! Server capability detection and the capture profile derived from it.

use serde::Serialize;

/// What the monitored server exposes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeatureSet {
    /// Numeric server version, e.g. 160002
    pub version: u32,
    /// Installed extensions
    pub extensions: Vec<String>,
    /// Columns of the session-activity view
    pub columns: Vec<String>,
}

impl FeatureSet {
    /// True when the session view exposes `name`
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(name))
    }

    /// True when extension `name` is installed
    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(name))
    }
}

/// Which optional fields a capture requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CaptureProfile {
    /// Request `wait_event_type` and `wait_event`
    pub wait_events: bool,
    /// Resolve blocking sessions
    pub blocking_pids: bool,
    /// Request the query identifier
    pub query_id: bool,
    /// Request the backend type
    pub backend_type: bool,
}

impl Default for CaptureProfile {
    fn default() -> Self {
        Self::minimal()
    }
}

impl CaptureProfile {
    /// Columns every supported server has
    pub const fn minimal() -> Self {
        Self {
            wait_events: false,
            blocking_pids: false,
            query_id: false,
            backend_type: false,
        }
    }

    /// Everything
    pub const fn full() -> Self {
        Self {
            wait_events: true,
            blocking_pids: true,
            query_id: true,
            backend_type: true,
        }
    }

    /// Derive the profile from probed features
    pub fn from_features(features: &FeatureSet) -> Self {
        Self {
            wait_events: features.has_column("wait_event_type") && features.has_column("wait_event"),
            blocking_pids: features.version >= 90_600,
            query_id: features.has_column("query_id") || features.has_extension("pg_stat_statements"),
            backend_type: features.has_column("backend_type"),
        }
    }

    /// Select list for the session-activity query under this profile
    pub fn select_list(&self) -> Vec<&'static str> {
        let mut columns = vec![
            "pid",
            "datname",
            "usename",
            "application_name",
            "state",
            "query",
            "now() - query_start AS query_duration",
            "now() - state_change AS state_duration",
        ];
        if self.wait_events {
            columns.extend(["wait_event_type", "wait_event"]);
        }
        if self.blocking_pids {
            columns.push("pg_blocking_pids(pid) AS blocking_pids");
        }
        if self.query_id {
            columns.push("query_id");
        }
        if self.backend_type {
            columns.push("backend_type");
        }
        columns
    }

    /// Fields this profile leaves out
    pub fn missing(&self) -> Vec<&'static str> {
        [
            (self.wait_events, "wait_events"),
            (self.blocking_pids, "blocking_pids"),
            (self.query_id, "query_id"),
            (self.backend_type, "backend_type"),
        ]
        .into_iter()
        .filter(|(present, _)| !present)
        .map(|(_, name)| name)
        .collect()
    }

    /// Clear row fields the profile does not request
    pub fn apply(&self, row: &mut super::types::SessionRow) {
        if !self.wait_events {
            row.wait_event_type = None;
            row.wait_event = None;
        }
        if !self.blocking_pids {
            row.blocking_pids.clear();
        }
        if !self.query_id {
            row.query_id = None;
        }
        if !self.backend_type {
            row.backend_type = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ash::types::SessionRow;

    fn features(version: u32, columns: &[&str]) -> FeatureSet {
        FeatureSet {
            version,
            extensions: Vec::new(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn test_old_server_degrades() {
        let profile = CaptureProfile::from_features(&features(90_500, &["pid", "state", "query", "waiting"]));
        assert_eq!(profile, CaptureProfile::minimal());
        assert!(!profile.select_list().contains(&"wait_event"));
        assert_eq!(profile.missing().len(), 4);
    }

    #[test]
    fn test_modern_server_gets_full_profile() {
        let profile = CaptureProfile::from_features(&features(
            160_002,
            &["pid", "wait_event_type", "wait_event", "query_id", "backend_type"],
        ));
        assert_eq!(profile, CaptureProfile::full());
        assert!(profile.missing().is_empty());
    }

    #[test]
    fn test_apply_clears_unrequested_fields() {
        let mut row = SessionRow {
            wait_event_type: Some("IO".into()),
            blocking_pids: vec![3],
            ..SessionRow::default()
        };
        CaptureProfile::minimal().apply(&mut row);
        assert!(row.wait_event_type.is_none());
        assert!(row.blocking_pids.is_empty());
    }
}
