//! Wire protocol between the engine and a delegation peer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Tools whose work is done by the peer that holds the live document.
pub const DELEGATED_TOOLS: &[&str] = &[
    "list_cells",
    "read_cell",
    "insert_cell",
    "delete_cell",
    "move_cell",
    "overwrite_cell",
    "overwrite_cell_source",
];

/// Whether `name` is forwarded to the peer instead of handled locally.
#[must_use]
pub fn is_delegated(name: &str) -> bool {
    DELEGATED_TOOLS.contains(&name)
}

/// Message exchanged with a delegation peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Ask the peer to run a tool.
    ToolRequest {
        id: Uuid,
        name: String,
        #[serde(default)]
        args: Value,
    },
    /// The peer's answer to an earlier request.
    ToolResponse {
        id: Uuid,
        #[serde(default)]
        result: Value,
    },
}

impl PeerMessage {
    /// Correlation id carried by the message.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        match self {
            Self::ToolRequest { id, .. } | Self::ToolResponse { id, .. } => *id,
        }
    }

    /// Parse one frame received from the peer.
    ///
    /// # Errors
    /// Returns the JSON error for anything that is not a known message.
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_uses_tagged_shape() {
        let id = Uuid::new_v4();
        let msg = PeerMessage::ToolRequest {
            id,
            name: "read_cell".into(),
            args: json!({"cell_index": 2}),
        };

        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "tool_request",
                "id": id.to_string(),
                "name": "read_cell",
                "args": {"cell_index": 2},
            })
        );
    }

    #[test]
    fn response_parses_from_peer_frame() {
        let id = Uuid::new_v4();
        let frame = format!(r#"{{"type":"tool_response","id":"{id}","result":{{"success":true}}}}"#);

        let msg = PeerMessage::parse(&frame).unwrap();

        assert_eq!(msg.id(), id);
        assert_eq!(
            msg,
            PeerMessage::ToolResponse {
                id,
                result: json!({"success": true})
            }
        );
    }

    #[test]
    fn unknown_frames_are_rejected() {
        assert!(PeerMessage::parse(r#"{"type":"ping"}"#).is_err());
        assert!(PeerMessage::parse("not json").is_err());
    }

    #[test]
    fn delegated_set_is_closed() {
        assert!(is_delegated("insert_cell"));
        assert!(!is_delegated("execute_cell"));
    }
}
