//! Contracts to the external Red/Blue combat collaborators.
//!
//! The evolution core never talks to sensors or attack infrastructure
//! directly; it drives whatever `CombatArena` implementation it is
//! handed. Tests install deterministic arenas.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SwarmResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackResult {
    pub attack_id: String,
    pub pattern: String,
    pub success: bool,
    pub techniques: Vec<String>,
    pub duration_ms: u64,
    pub blast_radius_ips: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub detected: bool,
    /// Detector-reported latency. Preserved as-is; wall clock is
    /// measured separately by the evaluator.
    pub latency_ms: f64,
    pub confidence: f64,
    pub ring_level: u8,
    /// Operator-flagged false alarm on an otherwise positive detection.
    pub false_alarm: bool,
}

#[async_trait]
pub trait CombatArena: Send + Sync {
    /// Launch a red-team attack exercising `pattern` under `battle_id`.
    async fn launch_red_attack(&self, pattern: &str, battle_id: &str)
        -> SwarmResult<AttackResult>;

    /// Watch the blue side for a detection of the given battle, bounded
    /// by `timeout`.
    async fn monitor_blue_detection(
        &self,
        battle_id: &str,
        antibody_id: &str,
        timeout: Duration,
    ) -> SwarmResult<DetectionResult>;

    /// Produce one benign sample scored against the antibody. A
    /// detection here is a false positive.
    async fn generate_benign_sample(&self, antibody_id: &str) -> SwarmResult<DetectionResult>;
}
