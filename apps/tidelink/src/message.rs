use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// Application payload carried over the data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub sender: String,
    #[serde(alias = "timestamp")]
    pub timestamp_millis: i64,
    #[serde(alias = "type")]
    pub direction: Direction,
}

impl ChatMessage {
    pub fn outgoing(sender: &str, content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            sender: sender.to_string(),
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
            direction: Direction::Sent,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a frame from the peer; direction is always reported as received.
    pub fn decode_inbound(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let mut message: ChatMessage = serde_json::from_slice(bytes)?;
        message.direction = Direction::Received;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_direction_is_rewritten() {
        let sent = ChatMessage::outgoing("alice", "hi");
        let bytes = sent.encode().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"timestampMillis\""));
        assert!(text.contains("\"direction\":\"sent\""));

        let received = ChatMessage::decode_inbound(&bytes).unwrap();
        assert_eq!(received.id, sent.id);
        assert_eq!(received.sender, "alice");
        assert_eq!(received.direction, Direction::Received);
    }

    #[test]
    fn accepts_legacy_field_names() {
        let raw = br#"{"id":"1","content":"yo","sender":"b","timestamp":5,"type":"sent"}"#;
        let message = ChatMessage::decode_inbound(raw).unwrap();
        assert_eq!(message.timestamp_millis, 5);
        assert_eq!(message.direction, Direction::Received);
    }

    #[test]
    fn outgoing_ids_are_unique() {
        let a = ChatMessage::outgoing("a", "x");
        let b = ChatMessage::outgoing("a", "x");
        assert_ne!(a.id, b.id);
    }
}
