//! Streaming events
//!
//! Everything a live subscriber can observe on a session's event bus. Frames
//! serialize with a `type` discriminator matching the wire protocol
//! (`agent.start`, `agent.chunk`, ...). Late subscribers do not replay past
//! events; history is served by the conversation store.

use serde::{Deserialize, Serialize};

/// One frame on a session's event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ChatEvent {
    /// A user-authored message was committed to the log.
    #[serde(rename = "message.new")]
    MessageNew {
        message_id: String,
        sender: String,
        content: String,
    },
    /// A persona began generating a reply under a pending message id.
    #[serde(rename = "agent.start")]
    AgentStart { message_id: String, sender: String },
    /// One streamed fragment of a persona reply.
    #[serde(rename = "agent.chunk")]
    AgentChunk {
        message_id: String,
        sender: String,
        content: String,
    },
    /// Terminal success frame. `persisted_message_id` is absent when the
    /// turn was cancelled and nothing was committed.
    #[serde(rename = "agent.end")]
    AgentEnd {
        message_id: String,
        sender: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        persisted_message_id: Option<String>,
    },
    /// Terminal failure frame for one persona; the turn continues.
    #[serde(rename = "agent.error")]
    AgentError {
        message_id: String,
        sender: String,
        reason: String,
    },
    /// A failure not attributable to a single persona.
    #[serde(rename = "system.error")]
    SystemError { reason: String },
}

impl ChatEvent {
    /// The pending message id this frame belongs to, if any.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            ChatEvent::MessageNew { message_id, .. }
            | ChatEvent::AgentStart { message_id, .. }
            | ChatEvent::AgentChunk { message_id, .. }
            | ChatEvent::AgentEnd { message_id, .. }
            | ChatEvent::AgentError { message_id, .. } => Some(message_id),
            ChatEvent::SystemError { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tags() {
        let start = ChatEvent::AgentStart {
            message_id: "m1".into(),
            sender: "alice".into(),
        };
        let json = serde_json::to_string(&start).unwrap();
        assert!(json.contains(r#""type":"agent.start""#));

        let end = ChatEvent::AgentEnd {
            message_id: "m1".into(),
            sender: "alice".into(),
            content: "hi".into(),
            persisted_message_id: None,
        };
        let json = serde_json::to_string(&end).unwrap();
        assert!(json.contains(r#""type":"agent.end""#));
        // Cancelled turns omit the persisted id entirely.
        assert!(!json.contains("persisted_message_id"));
    }

    #[test]
    fn test_round_trip() {
        let ev = ChatEvent::AgentChunk {
            message_id: "m2".into(),
            sender: "bob".into(),
            content: "chunk".into(),
        };
        let back: ChatEvent = serde_json::from_str(&serde_json::to_string(&ev).unwrap()).unwrap();
        assert_eq!(back, ev);
    }
}
