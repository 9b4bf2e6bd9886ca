//! Common types for the HydroTwin environment abstraction.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;

/// Unique identifier for an agent registered with a kernel.
///
/// Ids are chosen by the bootstrapper (e.g. `"pump-1"`, `"tank.upper"`) and
/// must be unique within one kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Creates an AgentId from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the id is the empty string.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&AgentId> for AgentId {
    fn from(id: &AgentId) -> Self {
        id.clone()
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for AgentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for AgentId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for AgentId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_agent_id_display() {
        let id = AgentId::new("pump-1");
        assert_eq!(id.to_string(), "pump-1");
        assert_eq!(id, "pump-1");
    }

    #[test]
    fn test_agent_id_borrow_lookup() {
        let mut map = HashMap::new();
        map.insert(AgentId::from("gate"), 3);
        assert_eq!(map.get("gate"), Some(&3));
    }

    #[test]
    fn test_agent_id_serializes_as_string() {
        let id = AgentId::from("tank");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"tank\"");

        let back: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
