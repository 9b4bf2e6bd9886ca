//! Messages exchanged between agents over the bus.

use crate::error::KernelError;
use hydrotwin_env::AgentId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Schema-free message payload.
///
/// Publishers and subscribers agree on the shape of each topic out of band;
/// use [`Message::decode`] for a typed view.
pub type Payload = serde_json::Value;

/// Reserved topic names.
pub mod topics {
    /// Subscribing to this topic receives every message on the bus.
    pub const WILDCARD: &str = "#";

    /// Restart requests, payload `{"agent_id": "<id>"}`.
    pub const LIFECYCLE_RESTART: &str = "cmd.lifecycle.restart";

    /// Periodic performance snapshots published by the Monitoring agent.
    pub const PERFORMANCE: &str = "system.performance";
}

/// An immutable record routed by topic.
///
/// Created by the publishing agent, owned by the bus until delivered, then
/// handed to each subscriber by shared reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Routing key (never empty)
    topic: String,

    /// Identity of the publishing agent
    sender: AgentId,

    /// Opaque payload
    payload: Payload,

    /// Simulated time (seconds) at which the message was published
    timestamp: f64,
}

impl Message {
    /// Creates a new message.
    ///
    /// # Errors
    /// `KernelError::EmptyTopic` if `topic` is empty.
    pub fn new(
        topic: impl Into<String>,
        sender: impl Into<AgentId>,
        payload: Payload,
        timestamp: f64,
    ) -> Result<Self, KernelError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(KernelError::EmptyTopic);
        }

        Ok(Self {
            topic,
            sender: sender.into(),
            payload,
            timestamp,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn sender(&self) -> &AgentId {
        &self.sender
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Looks up a key in a mapping payload.
    ///
    /// Returns `None` for missing keys and for non-mapping payloads.
    pub fn field(&self, key: &str) -> Option<&Payload> {
        self.payload.get(key)
    }

    /// Looks up a string-valued key in a mapping payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Payload::as_str)
    }

    /// Deserializes the payload into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[t={:.3}] {} -> {}: {}",
            self.timestamp, self.sender, self.topic, self.payload
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_rejects_empty_topic() {
        let result = Message::new("", "pump-1", json!({}), 0.0);
        assert_eq!(result.unwrap_err(), KernelError::EmptyTopic);
    }

    #[test]
    fn test_message_accessors() {
        let msg = Message::new("state.pump-1", "pump-1", json!({"flow": 0.4}), 2.0).unwrap();

        assert_eq!(msg.topic(), "state.pump-1");
        assert_eq!(msg.sender(), "pump-1");
        assert_eq!(msg.timestamp(), 2.0);
        assert_eq!(msg.field("flow"), Some(&json!(0.4)));
        assert_eq!(msg.field("missing"), None);
    }

    #[test]
    fn test_field_on_scalar_payload() {
        let msg = Message::new("level", "tank", json!(3.5), 0.0).unwrap();
        assert_eq!(msg.field("agent_id"), None);
        assert_eq!(msg.str_field("agent_id"), None);
    }

    #[test]
    fn test_decode_typed_view() {
        #[derive(Deserialize)]
        struct Restart {
            agent_id: String,
        }

        let msg = Message::new(
            topics::LIFECYCLE_RESTART,
            "operator",
            json!({"agent_id": "gate-3"}),
            1.0,
        )
        .unwrap();

        let cmd: Restart = msg.decode().unwrap();
        assert_eq!(cmd.agent_id, "gate-3");
    }

    #[test]
    fn test_display() {
        let msg = Message::new("cmd", "ops", json!("stop"), 1.5).unwrap();
        assert_eq!(msg.to_string(), "[t=1.500] ops -> cmd: \"stop\"");
    }
}
