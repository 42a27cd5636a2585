//! Identifiers for traced actions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Action identifier - links a promise, its waiters and the computation that
/// resolves it in traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(Uuid);

impl ActionId {
    /// Create a new random ActionId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Short form for log lines
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "act_{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_id_unique() {
        assert_ne!(ActionId::new(), ActionId::new());
    }

    #[test]
    fn test_action_id_display() {
        let id = ActionId::from_bytes([0u8; 16]);
        assert_eq!(id.to_string(), "act_00000000-0000-0000-0000-000000000000");
        assert_eq!(id.short(), "00000000");
    }
}
