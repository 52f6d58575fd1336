//! Decision trail for one reconciliation pass

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// One recorded stage
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailEntry {
    pub stage: String,
    pub data: Value,
    pub time: DateTime<Utc>,
    /// Milliseconds since the previous stage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Milliseconds since the first stage, set on the final entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_duration: Option<u64>,
}

/// Ordered stages of a pass with per-stage timings
#[derive(Debug, Clone)]
pub struct DecisionTrail {
    entries: Vec<TrailEntry>,
    started: Instant,
    last: Instant,
}

impl DecisionTrail {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            entries: Vec::new(),
            started: now,
            last: now,
        }
    }

    /// Record a stage. Data that fails to serialize is recorded as null.
    pub fn record(&mut self, stage: impl Into<String>, data: impl Serialize) {
        let now = Instant::now();
        let duration = (!self.entries.is_empty()).then(|| now.duration_since(self.last).as_millis() as u64);
        self.last = now;

        self.entries.push(TrailEntry {
            stage: stage.into(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
            time: Utc::now(),
            duration,
            full_duration: None,
        });
    }

    /// Record the final stage, stamped with the full pass duration
    pub fn finish(&mut self, stage: impl Into<String>, data: impl Serialize) {
        self.record(stage, data);
        let full = self.started.elapsed().as_millis() as u64;
        if let Some(last) = self.entries.last_mut() {
            last.full_duration = Some(full);
        }
    }

    pub fn entries(&self) -> &[TrailEntry] {
        &self.entries
    }

    pub fn stages(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.stage.as_str())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.entries).unwrap_or_else(|e| format!("\"unprintable decision trail: {}\"", e))
    }
}

impl Default for DecisionTrail {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_durations_and_full_duration() {
        let mut trail = DecisionTrail::new();
        trail.record("BEGIN", json!({ "slice": 3 }));
        trail.record("fetch users", json!({ "users": 10 }));
        trail.finish("END", json!({}));

        let entries = trail.entries();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].duration.is_none());
        assert!(entries[1].duration.is_some());
        assert!(entries[1].full_duration.is_none());
        assert!(entries[2].full_duration.is_some());
        assert_eq!(trail.stages().collect::<Vec<_>>(), vec!["BEGIN", "fetch users", "END"]);
    }

    #[test]
    fn test_json_shape() {
        let mut trail = DecisionTrail::new();
        trail.record("BEGIN", json!({ "moduloBase": 48 }));
        trail.finish("END", json!({}));

        let parsed: Value = serde_json::from_str(&trail.to_json()).unwrap();
        assert_eq!(parsed[0]["stage"], "BEGIN");
        assert_eq!(parsed[0]["data"]["moduloBase"], 48);
        assert!(parsed[0].get("duration").is_none());
        assert!(parsed[1].get("fullDuration").is_some());
    }
}
