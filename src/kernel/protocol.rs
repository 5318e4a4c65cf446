//! Kernel wire message types.
//!
//! Length-prefixed JSON protocol for daemon ↔ kernel communication.
//! Messages are framed as: [4-byte BE length][JSON payload]
//!
//! The kernel accepts one code submission at a time and emits a typed
//! stream of output messages until it reports `status: idle`.

use serde::{Deserialize, Serialize};

/// Request sent from daemon to kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelRequest {
    /// Execute code. `id` correlates the submission with its output stream.
    Execute { id: String, code: String },
    /// Graceful shutdown.
    Shutdown,
}

/// Message emitted by the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelMessage {
    /// Kernel is ready to accept submissions (sent once on startup).
    Ready,
    /// A fragment of stdout/stderr text.
    Stream { text: String },
    /// A runtime error with its formatted traceback lines.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    /// Value of the last evaluated expression.
    ExecuteResult { data: DisplayPayload },
    /// Rich display output (plots and friends).
    Display { data: DisplayPayload },
    /// Execution state change. `idle` marks end of a submission's output.
    Status { execution_state: ExecutionState },
}

/// Mime-keyed payload carried by result and display messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisplayPayload {
    /// Plain-text representation, if any.
    #[serde(rename = "text/plain", skip_serializing_if = "Option::is_none")]
    pub text_plain: Option<String>,

    /// Base64-encoded PNG, if any.
    #[serde(rename = "image/png", skip_serializing_if = "Option::is_none")]
    pub image_png: Option<String>,
}

/// Kernel execution states reported via status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

impl KernelMessage {
    /// Whether this message marks the end of a submission's output stream.
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            Self::Status {
                execution_state: ExecutionState::Idle
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_execute_request() {
        let req = KernelRequest::Execute {
            id: "1".to_string(),
            code: "print(42)".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"execute\""));
        assert!(json.contains("\"code\":\"print(42)\""));
    }

    #[test]
    fn deserialize_ready() {
        let msg: KernelMessage = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert!(matches!(msg, KernelMessage::Ready));
    }

    #[test]
    fn deserialize_display_with_image() {
        let json = r#"{"type":"display","data":{"image/png":"iVBORw0K"}}"#;
        let msg: KernelMessage = serde_json::from_str(json).unwrap();
        match msg {
            KernelMessage::Display { data } => {
                assert_eq!(data.image_png.as_deref(), Some("iVBORw0K"));
                assert!(data.text_plain.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn idle_status_is_terminal() {
        let json = r#"{"type":"status","execution_state":"idle"}"#;
        let msg: KernelMessage = serde_json::from_str(json).unwrap();
        assert!(msg.is_idle());

        let busy: KernelMessage =
            serde_json::from_str(r#"{"type":"status","execution_state":"busy"}"#).unwrap();
        assert!(!busy.is_idle());
    }
}
