//! Combat-driven fitness evaluation.
//!
//! An evaluation fans N trials out over a bounded worker pool, streams
//! the outcomes back, and condenses them into a `FitnessSummary` with
//! exact Wilson bounds and an ROC operating point at the target FPR.
//! Detector-reported latency is preserved verbatim; wall clock is
//! recorded separately as an observation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use aswarm_shared::{
    CombatArena, FitnessSummary, MetricsSink, SwarmError, SwarmResult, TraceId,
};

use crate::stats::{p95, roc_at_fpr, wilson_bounds, Z_95};

/// Resource-protection bounds on one evaluation.
pub const MIN_SAMPLES: usize = 30;
pub const MAX_SAMPLES: usize = 1000;
/// Worker-pool ceiling.
pub const MAX_WORKERS: usize = 20;
/// Outer deadline for a whole evaluation.
pub const EVALUATION_TIMEOUT: Duration = Duration::from_secs(600);
/// Per-trial deadline.
pub const TRIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Blue-side detection monitor window.
pub const DETECTION_TIMEOUT: Duration = Duration::from_secs(5);

const BATTLE_HISTORY_CAP: usize = 50_000;
const STABILITY_WINDOW: usize = 100;

#[derive(Debug, Clone)]
pub struct BattleRecord {
    pub antibody_id: String,
    pub environment: String,
    pub detected: bool,
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
enum Trial {
    Attack,
    Benign,
}

#[derive(Debug, Clone)]
struct TrialOutcome {
    is_attack: bool,
    detected: bool,
    latency_ms: f64,
    confidence: f64,
    ring_level: u8,
    false_alarm: bool,
}

pub struct FitnessEvaluator {
    arena: Arc<dyn CombatArena>,
    /// Ring of recent battles; O(1) writes under the mutex.
    history: Mutex<VecDeque<BattleRecord>>,
    metrics: Arc<dyn MetricsSink>,
    target_fpr: f64,
}

impl FitnessEvaluator {
    pub fn new(
        arena: Arc<dyn CombatArena>,
        metrics: Arc<dyn MetricsSink>,
        target_fpr: f64,
    ) -> Self {
        Self {
            arena,
            history: Mutex::new(VecDeque::with_capacity(1024)),
            metrics,
            target_fpr,
        }
    }

    /// Run `attack_samples` red/blue trials plus `benign_samples` benign
    /// probes for one antibody and summarize the result.
    ///
    /// `pattern` is the attack signature the red side should exercise
    /// (typically the triggering learning-event signature).
    pub async fn evaluate(
        &self,
        antibody_id: &str,
        pattern: &str,
        attack_samples: usize,
        benign_samples: usize,
        environment: &str,
    ) -> SwarmResult<FitnessSummary> {
        let total = attack_samples + benign_samples;
        if total < MIN_SAMPLES {
            return Err(SwarmError::InsufficientSamples {
                requested: total,
                minimum: MIN_SAMPLES,
            });
        }
        if total > MAX_SAMPLES {
            return Err(SwarmError::ExcessiveSamples {
                requested: total,
                maximum: MAX_SAMPLES,
            });
        }

        timeout(
            EVALUATION_TIMEOUT,
            self.run_trials(antibody_id, pattern, attack_samples, benign_samples, environment),
        )
        .await
        .map_err(|_| {
            SwarmError::TrialTimeout(format!(
                "evaluation of {} exceeded {}s",
                antibody_id,
                EVALUATION_TIMEOUT.as_secs()
            ))
        })?
    }

    async fn run_trials(
        &self,
        antibody_id: &str,
        pattern: &str,
        attack_samples: usize,
        benign_samples: usize,
        environment: &str,
    ) -> SwarmResult<FitnessSummary> {
        let total = attack_samples + benign_samples;
        let workers = std::cmp::min(MAX_WORKERS, total);

        let (task_tx, task_rx) = mpsc::channel::<Trial>(workers.max(1));
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<SwarmResult<TrialOutcome>>(total);

        for _ in 0..workers {
            let arena = self.arena.clone();
            let tasks = task_rx.clone();
            let results = result_tx.clone();
            let metrics = self.metrics.clone();
            let antibody_id = antibody_id.to_string();
            let pattern = pattern.to_string();
            tokio::spawn(async move {
                loop {
                    let task = { tasks.lock().await.recv().await };
                    let Some(task) = task else { break };
                    let started = Instant::now();
                    let outcome = timeout(
                        TRIAL_TIMEOUT,
                        run_trial(arena.as_ref(), task, &antibody_id, &pattern),
                    )
                    .await
                    .map_err(|_| {
                        SwarmError::TrialTimeout(format!(
                            "trial exceeded {}s",
                            TRIAL_TIMEOUT.as_secs()
                        ))
                    })
                    .and_then(|r| r);
                    // Wall clock is an observation, never a substitute
                    // for the detector-reported latency.
                    metrics.observe(
                        "trial_wall_clock_seconds",
                        started.elapsed().as_secs_f64(),
                        &[],
                    );
                    if results.send(outcome).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        // Feed from a separate task so a full task channel can never
        // deadlock against the result drain below.
        let feeder = tokio::spawn(async move {
            for _ in 0..attack_samples {
                if task_tx.send(Trial::Attack).await.is_err() {
                    return;
                }
            }
            for _ in 0..benign_samples {
                if task_tx.send(Trial::Benign).await.is_err() {
                    return;
                }
            }
        });

        // Streaming accumulation.
        let mut true_positives = 0u64;
        let mut false_positives = 0u64;
        let mut attack_latencies: Vec<f64> = Vec::with_capacity(attack_samples);
        let mut attack_rings: Vec<f64> = Vec::with_capacity(attack_samples);
        let mut scored: Vec<(f64, bool)> = Vec::with_capacity(total);
        let mut first_error: Option<SwarmError> = None;
        let mut received = 0usize;

        while let Some(outcome) = result_rx.recv().await {
            received += 1;
            match outcome {
                Ok(outcome) => {
                    if outcome.is_attack {
                        if outcome.detected {
                            true_positives += 1;
                        }
                        if outcome.detected && outcome.false_alarm {
                            false_positives += 1;
                        }
                        attack_latencies.push(outcome.latency_ms);
                        attack_rings.push(f64::from(outcome.ring_level));
                    } else if outcome.detected {
                        false_positives += 1;
                    }
                    scored.push((outcome.confidence, outcome.is_attack));
                    self.record_battle(BattleRecord {
                        antibody_id: antibody_id.to_string(),
                        environment: environment.to_string(),
                        detected: outcome.detected,
                        latency_ms: outcome.latency_ms,
                        timestamp: Utc::now(),
                    });
                }
                Err(e) => {
                    debug!(antibody_id, error = %e, "Trial failed");
                    self.metrics
                        .incr("trial_failures_total", &[("kind", e.kind())]);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        feeder.abort();

        // The first failing trial's error aborts the evaluation, after
        // the remainder has been drained and counted.
        if let Some(e) = first_error {
            return Err(e);
        }
        if received < total {
            return Err(SwarmError::WorkerChannelClosed(format!(
                "received {} of {} trial results",
                received, total
            )));
        }

        let detection_rate = if attack_samples == 0 {
            0.0
        } else {
            true_positives as f64 / attack_samples as f64
        };
        let (confidence_lower, confidence_upper) =
            wilson_bounds(true_positives, attack_samples as u64, Z_95);

        let avg_latency_ms = if attack_latencies.is_empty() {
            0.0
        } else {
            attack_latencies.iter().sum::<f64>() / attack_latencies.len() as f64
        };
        let p95_latency_ms = p95(&attack_latencies);

        let roc = if benign_samples > 0 {
            roc_at_fpr(&scored, self.target_fpr)
        } else {
            None
        };

        let avg_blast_radius = if attack_rings.is_empty() {
            0.0
        } else {
            attack_rings.iter().sum::<f64>() / attack_rings.len() as f64
        };

        let (precision, recall) = if benign_samples > 0 {
            let denom = true_positives + false_positives;
            let precision = if denom == 0 {
                1.0
            } else {
                true_positives as f64 / denom as f64
            };
            (Some(precision), Some(detection_rate))
        } else {
            (None, None)
        };

        Ok(FitnessSummary {
            detection_rate,
            avg_latency_ms,
            p95_latency_ms,
            roc,
            confidence_lower,
            confidence_upper,
            stability_score: self.calculate_environment_stability(antibody_id),
            sample_size: total,
            avg_blast_radius,
            containment_cost: ((avg_blast_radius - 1.0) / 4.0).clamp(0.0, 1.0),
            precision,
            recall,
            f1: None,
            safety_violations: None,
        })
    }

    fn record_battle(&self, record: BattleRecord) {
        let mut history = self.history.lock().expect("battle history poisoned");
        if history.len() == BATTLE_HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(record);
    }

    pub fn battle_history_len(&self) -> usize {
        self.history.lock().expect("battle history poisoned").len()
    }

    /// Cross-environment stability over the most recent battles for one
    /// antibody: neutral 0.5 below 10 battles, 0.8 for a single
    /// environment, otherwise `exp(-4 * variance)` of per-environment
    /// detection-rate means.
    pub fn calculate_environment_stability(&self, antibody_id: &str) -> f64 {
        let history = self.history.lock().expect("battle history poisoned");
        let recent: Vec<&BattleRecord> = history
            .iter()
            .rev()
            .filter(|b| b.antibody_id == antibody_id)
            .take(STABILITY_WINDOW)
            .collect();
        if recent.len() < 10 {
            return 0.5;
        }

        let mut per_env: HashMap<&str, (u64, u64)> = HashMap::new();
        for battle in &recent {
            let entry = per_env.entry(battle.environment.as_str()).or_insert((0, 0));
            entry.1 += 1;
            if battle.detected {
                entry.0 += 1;
            }
        }
        if per_env.len() == 1 {
            return 0.8;
        }

        let means: Vec<f64> = per_env
            .values()
            .map(|(detected, total)| *detected as f64 / *total as f64)
            .collect();
        let mean = means.iter().sum::<f64>() / means.len() as f64;
        let variance =
            means.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / means.len() as f64;
        (-4.0 * variance).exp().clamp(0.0, 1.0)
    }
}

async fn run_trial(
    arena: &dyn CombatArena,
    trial: Trial,
    antibody_id: &str,
    pattern: &str,
) -> SwarmResult<TrialOutcome> {
    match trial {
        Trial::Attack => {
            let battle_id = TraceId::new().to_string();
            let attack = arena.launch_red_attack(pattern, &battle_id).await?;
            if !attack.success {
                warn!(battle_id, pattern, "Red attack reported failure");
            }
            let detection = arena
                .monitor_blue_detection(&battle_id, antibody_id, DETECTION_TIMEOUT)
                .await?;
            Ok(TrialOutcome {
                is_attack: true,
                detected: detection.detected,
                latency_ms: detection.latency_ms,
                confidence: detection.confidence,
                ring_level: detection.ring_level,
                false_alarm: detection.false_alarm,
            })
        }
        Trial::Benign => {
            let detection = arena.generate_benign_sample(antibody_id).await?;
            Ok(TrialOutcome {
                is_attack: false,
                detected: detection.detected,
                latency_ms: detection.latency_ms,
                confidence: detection.confidence,
                ring_level: detection.ring_level,
                false_alarm: detection.false_alarm,
            })
        }
    }
}
