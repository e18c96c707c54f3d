//! Learning events: the signal that flows from production detection
//! misses into the evolution loop.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A detection failure (or low-confidence detection) observed by an
/// external sensor. `first_seen_unix`/`last_seen_unix` are seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningEvent {
    pub event_id: String,
    /// Attack signature or technique fingerprint the sensors saw.
    pub signature: String,
    pub env: String,
    #[serde(default)]
    pub features: BTreeMap<String, String>,
    /// Severity in [0, 1].
    pub severity: f64,
    pub first_seen_unix: i64,
    pub last_seen_unix: i64,
}

impl LearningEvent {
    #[must_use]
    pub fn topic(&self) -> EventTopic {
        EventTopic::classify(&self.event_id)
    }
}

/// Routing topic. Derived from the event id rather than carried on the
/// wire so producers cannot misroute by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTopic {
    Learning,
    Promotion,
    Federation,
}

impl EventTopic {
    #[must_use]
    pub fn classify(event_id: &str) -> Self {
        if event_id.contains("promotion") {
            Self::Promotion
        } else if event_id.contains("federation") {
            Self::Federation
        } else {
            Self::Learning
        }
    }

    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Learning => "learning",
            Self::Promotion => "promotion",
            Self::Federation => "federation",
        }
    }
}

/// Outcome of one autonomous evolution cycle, recorded per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleResult {
    Success,
    Error,
    CircuitBreaker,
    BudgetLimit,
}

impl CycleResult {
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::CircuitBreaker => "circuit_breaker",
            Self::BudgetLimit => "budget_limit",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_classification() {
        assert_eq!(EventTopic::classify("miss-001"), EventTopic::Learning);
        assert_eq!(
            EventTopic::classify("promotion-ab-g1-x"),
            EventTopic::Promotion
        );
        assert_eq!(
            EventTopic::classify("federation-share-7"),
            EventTopic::Federation
        );
    }

    #[test]
    fn test_event_json_round_trip() {
        let event = LearningEvent {
            event_id: "miss-42".into(),
            signature: "T1496.cryptomining".into(),
            env: "prod".into(),
            features: BTreeMap::from([("proc".to_string(), "xmrig".to_string())]),
            severity: 0.8,
            first_seen_unix: 1_700_000_000,
            last_seen_unix: 1_700_000_060,
        };
        let line = serde_json::to_string(&event).unwrap();
        let back: LearningEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(event, back);
    }
}
