// src/pool/protocol.rs
//! Worker pipe protocol
//!
//! Frames are newline-delimited JSON over the child's stdin/stdout. The
//! child's stdout belongs to this protocol exclusively; worker logs go to
//! stderr. Parent-to-child traffic is task assignment only; everything the
//! child has to say travels back as one of the five [`WorkerFrame`]
//! variants.

use crate::executor::{Task, TaskResult};
use crate::utils::errors::{Result, RunnerError};
use serde::{Deserialize, Serialize};

/// Frames sent broker -> worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ParentFrame {
    /// Assign one task to the worker
    Task { task: Task },
}

/// Frames sent worker -> broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerFrame {
    /// Bootstrap finished; the worker can accept a task
    Started,

    /// Liveness signal, sent on a fixed period while the process runs
    Heartbeat,

    /// Non-task housekeeping finished; the worker is free again
    Idling,

    /// A task finished (successfully or with an exception envelope)
    #[serde(rename_all = "camelCase")]
    Processed {
        task_id: String,
        task_result: TaskResult,
    },

    /// The worker hit a fault it cannot recover from; it should be
    /// recycled once it leaves the busy state
    #[serde(rename_all = "camelCase")]
    CriticalError { message: String },
}

/// Encode a frame as one protocol line (no trailing newline)
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String> {
    serde_json::to_string(frame).map_err(RunnerError::from)
}

/// Decode one protocol line into a frame
pub fn decode_frame<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T> {
    serde_json::from_str(line.trim())
        .map_err(|e| RunnerError::Protocol(format!("bad frame {:?}: {}", line, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskKind;

    #[test]
    fn test_worker_frame_wire_tags() {
        assert_eq!(encode_frame(&WorkerFrame::Started).unwrap(), r#"{"type":"started"}"#);
        assert_eq!(
            encode_frame(&WorkerFrame::Heartbeat).unwrap(),
            r#"{"type":"heartbeat"}"#
        );

        let processed = WorkerFrame::Processed {
            task_id: "t-1".into(),
            task_result: TaskResult::empty(),
        };
        let line = encode_frame(&processed).unwrap();
        assert!(line.contains(r#""type":"processed""#));
        assert!(line.contains(r#""taskId":"t-1""#));
        assert_eq!(decode_frame::<WorkerFrame>(&line).unwrap(), processed);
    }

    #[test]
    fn test_task_frame_round_trip() {
        let frame = ParentFrame::Task {
            task: Task {
                id: "t-9".into(),
                application_id: "app".into(),
                relative_path: String::new(),
                timeout_ms: Some(100),
                cacheable: true,
                arguments: b"[]".to_vec(),
                kind: TaskKind::ActionInvocation {
                    action_type: "SHUTDOWN".into(),
                },
            },
        };
        let line = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame::<ParentFrame>(&line).unwrap(), frame);
    }

    #[test]
    fn test_garbage_line_is_a_protocol_error() {
        let err = decode_frame::<WorkerFrame>("not json").unwrap_err();
        assert!(matches!(err, RunnerError::Protocol(_)));
    }
}
