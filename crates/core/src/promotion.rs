//! Safety-gated promotion pipeline.
//!
//! Phase transitions are monotone (pending → shadow → staged → canary →
//! active) with the single exception of retirement on sustained quality
//! loss or TTL expiry. Autonomous promotions pass five ordered gates;
//! the first failing gate aborts the attempt and is counted exactly
//! once. The canary → active hop is owned by the external orchestrator
//! and only reachable through `force_phase`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use aswarm_shared::{
    AntibodyPhase, ConditionRecord, ConditionStatus, DeploymentState, FitnessSummary, MetricsSink,
    SwarmError, SwarmResult,
};

use crate::config::EvolutionConfig;
use crate::population::PopulationManager;

/// Stability floor for the staged → canary hop.
const MIN_STABILITY_FOR_CANARY: f64 = 0.8;
/// Wilson lower bound under which an active antibody retires.
const RETIRE_WILSON_FLOOR: f64 = 0.70;
/// SLO floor on the Wilson lower bound for shadow → staged.
const SLO_MIN_TPR_LB: f64 = 0.90;

#[derive(Debug, Clone)]
pub struct PromotionGates {
    pub cooldown_hours: i64,
    pub min_wilson_bound: f64,
    pub max_canary_pct: f64,
    pub safety_violation_limit: u32,
    pub max_fpr_ub: f64,
    /// Overall-fitness floor for scheduling a federation broadcast.
    pub fitness_promote_threshold: f64,
}

impl PromotionGates {
    #[must_use]
    pub fn from_config(config: &EvolutionConfig) -> Self {
        Self {
            cooldown_hours: config.promote_cooldown_hours,
            min_wilson_bound: config.promote_min_wilson_bound,
            max_canary_pct: config.promote_max_canary_pct,
            safety_violation_limit: config.safety_violation_limit,
            max_fpr_ub: config.eval_target_fpr,
            fitness_promote_threshold: config.fitness_promote_threshold,
        }
    }
}

/// What one reconcile pass did for one antibody.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub from: AntibodyPhase,
    pub to: AntibodyPhase,
    pub transitioned: bool,
    pub abort_reason: Option<&'static str>,
    /// True on the transition into Active with sufficient fitness; the
    /// caller schedules the federation broadcast.
    pub federation_broadcast: bool,
    pub conditions: Vec<ConditionRecord>,
}

pub struct PromotionController {
    states: RwLock<HashMap<String, DeploymentState>>,
    gates: PromotionGates,
    population: Arc<PopulationManager>,
    metrics: Arc<dyn MetricsSink>,
}

impl PromotionController {
    pub fn new(
        gates: PromotionGates,
        population: Arc<PopulationManager>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            gates,
            population,
            metrics,
        }
    }

    /// Clear the per-antibody idempotency markers. The loop driver calls
    /// this once at the top of every reconcile pass; within a pass a
    /// repeated reconcile of the same antibody is a no-op.
    pub async fn reset_reconcile_markers(&self) {
        let mut states = self.states.write().await;
        for state in states.values_mut() {
            state.current_reconcile_phase = None;
        }
    }

    pub async fn deployment_state(&self, antibody_id: &str) -> Option<DeploymentState> {
        self.states.read().await.get(antibody_id).cloned()
    }

    /// Test and orchestration support: install a known deployment state.
    pub async fn override_state(&self, antibody_id: &str, state: DeploymentState) {
        self.population
            .update_phase(antibody_id, state.phase)
            .await;
        self.states
            .write()
            .await
            .insert(antibody_id.to_string(), state);
    }

    pub async fn record_safety_violation(&self, antibody_id: &str) {
        let mut states = self.states.write().await;
        let state = states.entry(antibody_id.to_string()).or_default();
        state.safety_violations += 1;
        warn!(
            antibody_id,
            violations = state.safety_violations,
            "Safety violation recorded"
        );
    }

    pub async fn reconcile(&self, antibody_id: &str) -> SwarmResult<ReconcileOutcome> {
        self.reconcile_at(antibody_id, Utc::now()).await
    }

    /// One autonomous reconcile step for one antibody at instant `now`.
    pub async fn reconcile_at(
        &self,
        antibody_id: &str,
        now: DateTime<Utc>,
    ) -> SwarmResult<ReconcileOutcome> {
        let variant = self
            .population
            .variant(antibody_id)
            .await
            .ok_or_else(|| {
                SwarmError::InvalidSpec(format!("unknown antibody '{}'", antibody_id))
            })?;
        let fitness = self.population.fitness_of(antibody_id).await;

        let mut states = self.states.write().await;
        let state = states.entry(antibody_id.to_string()).or_default();
        let from = state.phase;

        // TTL expiry retires from any phase, gates notwithstanding.
        let ttl = Duration::hours(i64::from(variant.spec.controls.ttl_hours));
        if from != AntibodyPhase::Retired && now - variant.created_at >= ttl {
            return Ok(self
                .apply_transition(antibody_id, state, from, AntibodyPhase::Retired, now, &fitness)
                .await);
        }

        let candidate = match from {
            AntibodyPhase::Pending => Some(AntibodyPhase::Shadow),
            AntibodyPhase::Shadow => {
                let eligible = state.promotion_eligible.map_or(false, |t| now >= t);
                let slo = fitness
                    .as_ref()
                    .map_or(false, |f| f.meets_promotion_slo(SLO_MIN_TPR_LB, self.gates.max_fpr_ub));
                (eligible && slo).then_some(AntibodyPhase::Staged)
            }
            AntibodyPhase::Staged => {
                let stable = fitness
                    .as_ref()
                    .map_or(false, |f| f.stability_score >= MIN_STABILITY_FOR_CANARY);
                (variant.spec.controls.auto_promote && stable).then_some(AntibodyPhase::Canary)
            }
            // canary → active belongs to the orchestrator.
            AntibodyPhase::Canary => None,
            AntibodyPhase::Active => {
                let lost_confidence = fitness
                    .as_ref()
                    .map_or(false, |f| f.confidence_lower < RETIRE_WILSON_FLOOR);
                lost_confidence.then_some(AntibodyPhase::Retired)
            }
            AntibodyPhase::Retired => None,
        };

        let Some(to) = candidate else {
            return Ok(ReconcileOutcome {
                from,
                to: from,
                transitioned: false,
                abort_reason: None,
                federation_broadcast: false,
                conditions: build_conditions(&fitness, self.gates.max_fpr_ub, now),
            });
        };

        // Retirement is a safety valve, not a promotion: no gates.
        if to == AntibodyPhase::Retired {
            return Ok(self
                .apply_transition(antibody_id, state, from, to, now, &fitness)
                .await);
        }

        if let Some(reason) = self.first_failing_gate(state, from, to, &fitness, now).await {
            self.metrics
                .incr("promotion_aborts_total", &[("reason", reason)]);
            info!(antibody_id, from = %from, to = %to, reason, "Promotion blocked");
            return Ok(ReconcileOutcome {
                from,
                to: from,
                transitioned: false,
                abort_reason: Some(reason),
                federation_broadcast: false,
                conditions: build_conditions(&fitness, self.gates.max_fpr_ub, now),
            });
        }

        Ok(self
            .apply_transition(antibody_id, state, from, to, now, &fitness)
            .await)
    }

    /// External transition hook (orchestrator-owned hops such as
    /// canary → active). Gates are bypassed; bookkeeping is not.
    pub async fn force_phase(
        &self,
        antibody_id: &str,
        to: AntibodyPhase,
    ) -> SwarmResult<ReconcileOutcome> {
        let now = Utc::now();
        let fitness = self.population.fitness_of(antibody_id).await;
        let mut states = self.states.write().await;
        let state = states.entry(antibody_id.to_string()).or_default();
        let from = state.phase;
        Ok(self
            .apply_transition(antibody_id, state, from, to, now, &fitness)
            .await)
    }

    // ── Gate evaluation (ordered; first failure wins) ──

    async fn first_failing_gate(
        &self,
        state: &DeploymentState,
        from: AntibodyPhase,
        to: AntibodyPhase,
        fitness: &Option<FitnessSummary>,
        now: DateTime<Utc>,
    ) -> Option<&'static str> {
        // The pending → shadow hop is pipeline entry, not a promotion;
        // only idempotency applies.
        let entry_hop = from == AntibodyPhase::Pending;

        if !entry_hop {
            if let Some(last) = state.last_promotion_time {
                if now - last < Duration::hours(self.gates.cooldown_hours) {
                    return Some("cooldown");
                }
            }

            let wilson_lower = fitness.as_ref().map_or(0.0, |f| f.confidence_lower);
            if wilson_lower < self.gates.min_wilson_bound {
                return Some("confidence");
            }

            if to == AntibodyPhase::Canary {
                let counts = self.population.phase_counts().await;
                let total = self.population.total_antibodies().await;
                let canaries = counts.get(&AntibodyPhase::Canary).copied().unwrap_or(0);
                if total > 0
                    && (canaries + 1) as f64 / total as f64 > self.gates.max_canary_pct / 100.0
                {
                    return Some("canary_cap");
                }
            }

            if state.safety_violations > self.gates.safety_violation_limit {
                return Some("safety_violations");
            }
        }

        if state.current_reconcile_phase == Some(from) {
            return Some("idempotency");
        }
        None
    }

    async fn apply_transition(
        &self,
        antibody_id: &str,
        state: &mut DeploymentState,
        from: AntibodyPhase,
        to: AntibodyPhase,
        now: DateTime<Utc>,
        fitness: &Option<FitnessSummary>,
    ) -> ReconcileOutcome {
        state.phase = to;
        state.current_reconcile_phase = Some(to);
        state.last_promotion_time = Some(now);
        if to == AntibodyPhase::Shadow && state.shadow_start.is_none() {
            state.shadow_start = Some(now);
            if let Some(variant) = self.population.variant(antibody_id).await {
                state.promotion_eligible = Some(
                    now + Duration::hours(i64::from(variant.spec.controls.shadow_hours)),
                );
            }
        }

        self.population.update_phase(antibody_id, to).await;
        self.metrics
            .incr("promotion_attempts_total", &[("phase", &to.to_string())]);
        info!(antibody_id, from = %from, to = %to, "Phase transition");

        // Only the hop into Active schedules federation, and only when
        // the antibody carries enough fitness to be worth sharing.
        let federation_broadcast = to == AntibodyPhase::Active
            && from != AntibodyPhase::Active
            && fitness
                .as_ref()
                .map_or(false, |f| f.overall_fitness() >= self.gates.fitness_promote_threshold);

        ReconcileOutcome {
            from,
            to,
            transitioned: from != to,
            abort_reason: None,
            federation_broadcast,
            conditions: build_conditions(fitness, self.gates.max_fpr_ub, now),
        }
    }
}

fn build_conditions(
    fitness: &Option<FitnessSummary>,
    max_fpr_ub: f64,
    now: DateTime<Utc>,
) -> Vec<ConditionRecord> {
    let ready = fitness.is_some();
    let validated = fitness.as_ref().map_or(false, |f| f.sample_size >= 200);
    let promoted = fitness
        .as_ref()
        .map_or(false, |f| f.meets_promotion_slo(SLO_MIN_TPR_LB, max_fpr_ub));

    let record = |condition_type: &str, ok: bool, reason: &str, message: String| ConditionRecord {
        condition_type: condition_type.to_string(),
        status: if ok {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        },
        reason: reason.to_string(),
        message,
        last_transition: now,
    };

    vec![
        record(
            "Ready",
            ready,
            if ready { "Evaluated" } else { "AwaitingEvaluation" },
            if ready {
                "fitness summary available".to_string()
            } else {
                "no combat results yet".to_string()
            },
        ),
        record(
            "Validated",
            validated,
            if validated { "SampleSizeMet" } else { "SampleSizeTooSmall" },
            format!(
                "sample_size={}",
                fitness.as_ref().map_or(0, |f| f.sample_size)
            ),
        ),
        record(
            "Promoted",
            promoted,
            if promoted { "SloMet" } else { "SloNotMet" },
            format!(
                "wilson_lower={:.3}",
                fitness.as_ref().map_or(0.0, |f| f.confidence_lower)
            ),
        ),
    ]
}
