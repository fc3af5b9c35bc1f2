//! Status events broadcast to the UI/control thread.
//!
//! One `TrainingStatusEvent` is sent per training stage transition. The last
//! event of a run is `Completed`, `Cancelled` or `Failed`; a failure carries
//! its human-readable reason in `detail`.

use serde::{Deserialize, Serialize};

/// Emitted whenever a training run changes stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingStatusEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Subprocessor the run targets, formatted `source/sub`.
    pub subprocessor: Option<String>,
    pub status: TrainingStatus,
    /// Optional human-readable detail (progress, run directory, error).
    pub detail: Option<String>,
}

/// Stage of the current (or last) training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingStatus {
    /// No run has been started yet.
    Idle,
    /// Validating the request and creating the run directory.
    Preparing,
    /// Waiting for the sample cache to fill.
    WaitingForData,
    /// External solver running.
    Computing,
    /// Reading solver output and swapping in the new operation.
    Installing,
    /// New operation is live.
    Completed,
    /// Run abandoned on request; previous operation untouched.
    Cancelled,
    /// Run aborted with an error; previous operation untouched.
    Failed,
}

impl TrainingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrainingStatus::Completed | TrainingStatus::Cancelled | TrainingStatus::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_camel_case_and_lowercase_status() {
        let event = TrainingStatusEvent {
            seq: 4,
            subprocessor: Some("100/0".into()),
            status: TrainingStatus::WaitingForData,
            detail: Some("1200/6000 samples".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["subprocessor"], "100/0");
        assert_eq!(json["status"], "waitingfordata");
        assert_eq!(json["detail"], "1200/6000 samples");

        let back: TrainingStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(back, event);
    }

    #[test]
    fn status_rejects_non_lowercase_values() {
        assert!(serde_json::from_str::<TrainingStatus>(r#""Failed""#).is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TrainingStatus::Completed.is_terminal());
        assert!(TrainingStatus::Failed.is_terminal());
        assert!(TrainingStatus::Cancelled.is_terminal());
        assert!(!TrainingStatus::Computing.is_terminal());
        assert!(!TrainingStatus::Idle.is_terminal());
    }
}
