//! Synthetic combat arena.
//!
//! Stands in for the external red/blue range when none is wired in:
//! attacks always launch, the blue side detects with a configurable
//! probability, and benign samples score low confidence. Deployments
//! with a real range implement `CombatArena` against their own
//! infrastructure; the evolution core does not care which it gets.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::prelude::*;
use rand::rngs::StdRng;

use aswarm_shared::{AttackResult, CombatArena, DetectionResult, SwarmResult};

pub struct SyntheticArena {
    detection_probability: f64,
    benign_false_positive_probability: f64,
    rng: Mutex<StdRng>,
}

impl SyntheticArena {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            detection_probability: 0.95,
            benign_false_positive_probability: 0.0,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    #[must_use]
    pub fn with_rates(mut self, detection: f64, benign_false_positive: f64) -> Self {
        self.detection_probability = detection.clamp(0.0, 1.0);
        self.benign_false_positive_probability = benign_false_positive.clamp(0.0, 1.0);
        self
    }
}

#[async_trait]
impl CombatArena for SyntheticArena {
    async fn launch_red_attack(&self, pattern: &str, battle_id: &str) -> SwarmResult<AttackResult> {
        let (duration_ms, blast_radius_ips) = {
            let mut rng = self.rng.lock().expect("arena RNG poisoned");
            (rng.gen_range(20..80), rng.gen_range(1..4))
        };
        Ok(AttackResult {
            attack_id: battle_id.to_string(),
            pattern: pattern.to_string(),
            success: true,
            techniques: vec![pattern.to_string()],
            duration_ms,
            blast_radius_ips,
        })
    }

    async fn monitor_blue_detection(
        &self,
        _battle_id: &str,
        _antibody_id: &str,
        _timeout: Duration,
    ) -> SwarmResult<DetectionResult> {
        let mut rng = self.rng.lock().expect("arena RNG poisoned");
        let detected = rng.gen_bool(self.detection_probability);
        Ok(DetectionResult {
            detected,
            latency_ms: rng.gen_range(50.0..200.0),
            confidence: if detected {
                rng.gen_range(0.85..0.99)
            } else {
                rng.gen_range(0.1..0.4)
            },
            ring_level: rng.gen_range(1..3),
            false_alarm: false,
        })
    }

    async fn generate_benign_sample(&self, _antibody_id: &str) -> SwarmResult<DetectionResult> {
        let mut rng = self.rng.lock().expect("arena RNG poisoned");
        let false_positive = rng.gen_bool(self.benign_false_positive_probability);
        Ok(DetectionResult {
            detected: false_positive,
            latency_ms: rng.gen_range(1.0..10.0),
            confidence: if false_positive {
                rng.gen_range(0.8..0.95)
            } else {
                rng.gen_range(0.02..0.2)
            },
            ring_level: 0,
            false_alarm: false_positive,
        })
    }
}
