//! Engine output events and the wire events the stream adapter emits.

use hitl_types::StageOutput;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// Status values carried by the terminal `status` event.
pub mod status {
    pub const USER_FEEDBACK: &str = "user_feedback";
    pub const CODE_REVIEW: &str = "code_review";
    pub const EDITING: &str = "editing";
    pub const FINISHED: &str = "finished";
    pub const ERROR: &str = "error";
}

// ---------------------------------------------------------------------------
// StageEvent / EventSink
// ---------------------------------------------------------------------------

/// Output produced by a stage while it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct StageEvent {
    pub stage: String,
    pub output: StageOutput,
}

/// Where a run sends its stage output. A detached sink discards everything
/// and never reports the consumer as gone.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: Option<mpsc::Sender<StageEvent>>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StageEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// Returns `false` if the receiving side has been dropped.
    pub async fn emit(&self, event: StageEvent) -> bool {
        match &self.tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => true,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }
}

// ---------------------------------------------------------------------------
// WireEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    Start,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Text,
    Error,
}

/// One event on a thread's stream. Every stream is one `handshake`, any number
/// of `token`s, then exactly one `status` (preceded by `error` on failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WireEvent {
    Handshake {
        thread_id: String,
        workflow: String,
        mode: StreamMode,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    Token {
        content: String,
        node: String,
        kind: OutputKind,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    Status {
        status: String,
        #[serde(flatten)]
        payload: Map<String, Value>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    Error {
        error: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl WireEvent {
    pub fn handshake(thread_id: &str, workflow: &str, mode: StreamMode) -> Self {
        WireEvent::Handshake {
            thread_id: thread_id.to_string(),
            workflow: workflow.to_string(),
            mode,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn token(event: StageEvent) -> Self {
        let (content, kind) = match event.output {
            StageOutput::Text(v) => (v, OutputKind::Text),
            StageOutput::Error(v) => (v, OutputKind::Error),
        };
        WireEvent::Token {
            content,
            node: event.stage,
            kind,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn status(status: impl Into<String>, payload: Map<String, Value>) -> Self {
        WireEvent::Status {
            status: status.into(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        WireEvent::Error {
            error: error.into(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// The SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            WireEvent::Handshake { mode, .. } => match mode {
                StreamMode::Start => "start",
                StreamMode::Resume => "resume",
            },
            WireEvent::Token { .. } => "token",
            WireEvent::Status { .. } => "status",
            WireEvent::Error { .. } => "error",
        }
    }

    pub fn status_value(&self) -> Option<&str> {
        match self {
            WireEvent::Status { status, .. } => Some(status),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WireEvent::Status { .. })
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({ "event": "error", "error": e.to_string() })
        })
    }
}
