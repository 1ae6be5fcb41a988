//! Status and lifecycle events written to the JSONL status log.

use crate::types::{CloseoutResult, JobKey, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStarted,
    StatusUpdate,
    CheckpointSaved,
    CheckpointRestored,
    RunClosed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "RUN_STARTED",
            Self::StatusUpdate => "STATUS_UPDATE",
            Self::CheckpointSaved => "CHECKPOINT_SAVED",
            Self::CheckpointRestored => "CHECKPOINT_RESTORED",
            Self::RunClosed => "RUN_CLOSED",
        }
    }
}

/// Payload for RUN_STARTED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub key: JobKey,
    pub tool: String,
    pub executable: String,
    /// Set when the run resumes after a restored checkpoint.
    pub resumed_after_unit: Option<u64>,
}

/// Payload for STATUS_UPDATE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdatePayload {
    pub timestamp: DateTime<Utc>,
    pub percent_complete: f32,
    pub units_processed: u64,
    pub state_label: String,
}

impl StatusUpdatePayload {
    pub fn new(percent_complete: f32, units_processed: u64, state_label: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            percent_complete,
            units_processed,
            state_label: state_label.to_string(),
        }
    }
}

/// Payload for CHECKPOINT_SAVED and CHECKPOINT_RESTORED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub key: JobKey,
    pub path: String,
    pub last_completed_unit: Option<u64>,
}

/// Payload for RUN_CLOSED; also the content of `closeout.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunClosedPayload {
    pub key: JobKey,
    pub tool: String,
    pub closeout: CloseoutResult,
    pub status: RunStatus,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunStarted(RunStartedPayload),
    StatusUpdate(StatusUpdatePayload),
    CheckpointSaved(CheckpointPayload),
    CheckpointRestored(CheckpointPayload),
    RunClosed(RunClosedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunStarted(_) => EventType::RunStarted,
            Self::StatusUpdate(_) => EventType::StatusUpdate,
            Self::CheckpointSaved(_) => EventType::CheckpointSaved,
            Self::CheckpointRestored(_) => EventType::CheckpointRestored,
            Self::RunClosed(_) => EventType::RunClosed,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One line of the status log: `{"event": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord<'a> {
    pub event: EventType,
    pub payload: &'a EventPayload,
}

impl<'a> EventRecord<'a> {
    pub fn new(payload: &'a EventPayload) -> Self {
        Self {
            event: payload.event_type(),
            payload,
        }
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CloseoutCode;

    #[test]
    fn event_type_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&EventType::StatusUpdate).unwrap(),
            "\"STATUS_UPDATE\""
        );
        assert_eq!(EventType::RunClosed.as_str(), "RUN_CLOSED");
    }

    #[test]
    fn record_line_carries_event_name() {
        let payload = EventPayload::StatusUpdate(StatusUpdatePayload::new(42.5, 17, "Processing"));
        let line = EventRecord::new(&payload).to_json_line().unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["event"], "STATUS_UPDATE");
        assert_eq!(value["payload"]["units_processed"], 17);
        assert_eq!(value["payload"]["state_label"], "Processing");
    }

    #[test]
    fn run_closed_payload_round_trips_closeout() {
        let payload = RunClosedPayload {
            key: JobKey::new("Dataset_A", 1001, 2),
            tool: "formularity".to_string(),
            closeout: CloseoutResult::no_data("tool reported nothing to process"),
            status: RunStatus::new(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("NO_DATA"));
        let back: RunClosedPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.closeout.code, CloseoutCode::NoData);
    }
}
