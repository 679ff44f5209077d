//! Streaming progress events
//!
//! NDJSON events consumed by the caller: `message`, `data` (graph delta),
//! `phase_event`, `node_event`, `relationship_event`, `canvas_update`,
//! `complete`, `error`. Concurrent file tasks serialise their progress
//! through one unbounded channel; consumers see interleaved progress but
//! each file's terminal event arrives exactly once.
//!
//! These messages are user-facing progress narration, not developer logs:
//! skips, fallbacks and failures must be visible in the stream.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::graph::GraphDelta;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Message {
        content: String,
    },
    Data {
        #[serde(skip_serializing_if = "Option::is_none")]
        graph: Option<GraphDelta>,
        #[serde(skip_serializing_if = "Option::is_none")]
        line_number: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        analysis_progress: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_file: Option<String>,
    },
    PhaseEvent {
        phase: f64,
        name: String,
        status: String,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    NodeEvent {
        action: String,
        #[serde(rename = "nodeType")]
        node_type: String,
        #[serde(rename = "nodeName")]
        node_name: String,
    },
    RelationshipEvent {
        action: String,
        #[serde(rename = "relType")]
        rel_type: String,
        source: String,
        target: String,
    },
    CanvasUpdate {
        #[serde(rename = "updateType")]
        update_type: String,
        #[serde(rename = "tableName")]
        table_name: String,
        schema: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        changes: Option<Value>,
    },
    Complete {
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    Error {
        content: String,
        #[serde(rename = "errorType")]
        error_type: String,
        #[serde(rename = "traceId")]
        trace_id: String,
    },
}

impl StreamEvent {
    /// Render as one NDJSON line (newline included)
    pub fn to_ndjson(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                tracing::error!("Failed to serialize stream event: {}", e);
                format!("{{\"type\":\"error\",\"content\":\"event serialization failed\",\"errorType\":\"JsonError\",\"traceId\":\"{}\"}}\n", e)
            }
        }
    }
}

/// Sender half shared by every phase. Sends never block; a dropped
/// receiver just ends the stream.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl EventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: StreamEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Event stream receiver dropped");
        }
    }

    pub fn message(&self, content: impl Into<String>) {
        self.send(StreamEvent::Message { content: content.into() });
    }

    pub fn data(&self, graph: GraphDelta, progress: Option<u8>, current_file: Option<String>) {
        self.send(StreamEvent::Data {
            graph: Some(graph),
            line_number: None,
            analysis_progress: progress,
            current_file,
        });
    }

    pub fn phase(&self, phase: f64, name: &str, status: &str, progress: u8, details: Option<Value>) {
        self.send(StreamEvent::PhaseEvent {
            phase,
            name: name.to_string(),
            status: status.to_string(),
            progress,
            details,
        });
    }

    pub fn error(&self, content: String, error_type: &str, trace_id: &str) {
        self.send(StreamEvent::Error {
            content,
            error_type: error_type.to_string(),
            trace_id: trace_id.to_string(),
        });
    }

    pub fn complete(&self, summary: Option<String>) {
        self.send(StreamEvent::Complete { summary });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_tags() {
        let message = StreamEvent::Message { content: "hi".into() };
        let value: Value = serde_json::from_str(message.to_ndjson().trim()).unwrap();
        assert_eq!(value["type"], "message");

        let phase = StreamEvent::PhaseEvent {
            phase: 3.5,
            name: "Metadata enrichment".into(),
            status: "in_progress".into(),
            progress: 70,
            details: None,
        };
        let value: Value = serde_json::from_str(phase.to_ndjson().trim()).unwrap();
        assert_eq!(value["type"], "phase_event");
        assert_eq!(value["phase"], 3.5);

        let error = StreamEvent::Error {
            content: "boom".into(),
            error_type: "GraphWriteError".into(),
            trace_id: "stream-abc".into(),
        };
        let value: Value = serde_json::from_str(error.to_ndjson().trim()).unwrap();
        assert_eq!(value["errorType"], "GraphWriteError");
        assert_eq!(value["traceId"], "stream-abc");
    }

    #[tokio::test]
    async fn test_sink_delivers_in_order() {
        let (sink, mut rx) = EventSink::new();
        sink.message("one");
        sink.message("two");
        drop(sink);

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Message { content } = event {
                seen.push(content);
            }
        }
        assert_eq!(seen, vec!["one", "two"]);
    }
}
