//! Shared fixtures for unit and integration tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;

use aswarm_shared::{
    AtomicMetrics, AttackResult, CombatArena, DetectionResult, LearningEvent, SwarmResult, TraceId,
};

use crate::config::EvolutionConfig;
use crate::db::{init_db, SqliteStore};
use crate::SwarmState;

/// Fully deterministic arena: every attack is detected at the given
/// confidence, benign samples always score `benign_confidence`.
pub struct DeterministicArena {
    pub attack_confidence: f64,
    pub attack_latency_ms: f64,
    pub benign_confidence: f64,
}

impl Default for DeterministicArena {
    fn default() -> Self {
        Self {
            attack_confidence: 0.95,
            attack_latency_ms: 120.0,
            benign_confidence: 0.1,
        }
    }
}

#[async_trait]
impl CombatArena for DeterministicArena {
    async fn launch_red_attack(&self, pattern: &str, battle_id: &str) -> SwarmResult<AttackResult> {
        Ok(AttackResult {
            attack_id: battle_id.to_string(),
            pattern: pattern.to_string(),
            success: true,
            techniques: vec![pattern.to_string()],
            duration_ms: 30,
            blast_radius_ips: 2,
        })
    }

    async fn monitor_blue_detection(
        &self,
        _battle_id: &str,
        _antibody_id: &str,
        _timeout: Duration,
    ) -> SwarmResult<DetectionResult> {
        Ok(DetectionResult {
            detected: true,
            latency_ms: self.attack_latency_ms,
            confidence: self.attack_confidence,
            ring_level: 1,
            false_alarm: false,
        })
    }

    async fn generate_benign_sample(&self, _antibody_id: &str) -> SwarmResult<DetectionResult> {
        Ok(DetectionResult {
            detected: false,
            latency_ms: 2.0,
            confidence: self.benign_confidence,
            ring_level: 0,
            false_alarm: false,
        })
    }
}

pub async fn memory_store() -> Arc<SqliteStore> {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    init_db(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool))
}

/// Build a full state wired to the deterministic arena, an in-memory
/// store, and a throwaway WAL directory. Returns the concrete metrics
/// handle alongside the state so tests can assert on counters.
pub async fn create_test_state() -> (Arc<SwarmState>, Arc<AtomicMetrics>) {
    create_test_state_with(DeterministicArena::default()).await
}

pub async fn create_test_state_with(
    arena: DeterministicArena,
) -> (Arc<SwarmState>, Arc<AtomicMetrics>) {
    let mut config = EvolutionConfig::for_tests();
    config.wal_dir = std::env::temp_dir().join(format!("aswarm-wal-{}", TraceId::new()));
    let store = memory_store().await;
    let metrics = AtomicMetrics::new();
    let state = crate::build_state(
        config,
        Arc::new(arena),
        Some(store),
        None,
        metrics.clone(),
        7,
    )
    .unwrap();
    (state, metrics)
}

/// A learning event in the shape external sensors emit.
#[must_use]
pub fn learning_event(index: usize, signature: &str, severity: f64) -> LearningEvent {
    let now = chrono::Utc::now().timestamp();
    LearningEvent {
        event_id: format!("miss-{:05}", index),
        signature: signature.to_string(),
        env: "prod".into(),
        features: BTreeMap::from([
            ("egress".to_string(), "1".to_string()),
            ("burst".to_string(), "0".to_string()),
        ]),
        severity,
        first_seen_unix: now,
        last_seen_unix: now,
    }
}
