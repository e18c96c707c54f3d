use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for ephemeral objects inside the control plane
/// (battles, events, trace correlation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(Uuid);

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Default generates a random UUID v4 (intentional design). Each default
/// TraceId is unique, suitable for battle ids and correlation tokens.
/// For deterministic IDs, use `TraceId::from_name()` instead.
impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let namespace = Uuid::NAMESPACE_DNS;
        Self(Uuid::new_v5(&namespace, name.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_is_deterministic() {
        assert_eq!(TraceId::from_name("ab-g1-x"), TraceId::from_name("ab-g1-x"));
        assert_ne!(TraceId::from_name("ab-g1-x"), TraceId::from_name("ab-g1-y"));
    }
}
