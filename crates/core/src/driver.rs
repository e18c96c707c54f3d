//! Autonomous evolution loop.
//!
//! A ticker drives one cycle at a time: drain learning events, turn
//! them into combat evaluations, reconcile promotions, propose the next
//! cohort, and hand federation-topic events to the broadcast client.
//! The circuit breaker and resource budget are soft pauses recorded as
//! cycle results, never errors. Cadence adapts to population diversity.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use aswarm_shared::antibody::{AntibodySpec, Controls, DetectorSpec, Scope};
use aswarm_shared::{CycleResult, LearningEvent, SwarmResult};

use crate::config::EvolutionConfig;
use crate::SwarmState;

/// Cohort size for each evolution round.
pub const COHORT_SIZE: usize = 50;
/// Parents drawn per round.
pub const PARENTS_PER_ROUND: usize = 5;
/// Event batch per cycle.
pub const EVENT_BATCH_SIZE: usize = 100;
/// Upper bound on the consume window.
pub const CONSUME_WINDOW: Duration = Duration::from_secs(60);
/// Diversity thresholds for adaptive cadence.
const DIVERSITY_BACKOFF_BELOW: f64 = 0.2;
const DIVERSITY_RESET_ABOVE: f64 = 0.5;

/// Spawn the evolution loop background task.
pub fn spawn_evolution_loop(state: Arc<SwarmState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let base_interval = Duration::from_secs(state.config.tick_interval_secs);
        let mut current_interval = base_interval;
        let mut ticker = tokio::time::interval(current_interval);
        info!(interval_secs = base_interval.as_secs(), "Evolution loop started");

        loop {
            tokio::select! {
                () = state.shutdown.notified() => {
                    info!("Evolution loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let result = run_cycle(&state).await;
                    debug!(result = result.as_label(), "Evolution cycle finished");

                    // Adaptive cadence: a collapsing gene pool slows the
                    // loop down; a healthy one runs at base cadence.
                    let diversity = state.population.get_diversity_index().await;
                    let desired = if diversity < DIVERSITY_BACKOFF_BELOW {
                        current_interval * 2
                    } else if diversity > DIVERSITY_RESET_ABOVE {
                        base_interval
                    } else {
                        current_interval
                    };
                    if desired != current_interval {
                        info!(
                            diversity,
                            from_secs = current_interval.as_secs(),
                            to_secs = desired.as_secs(),
                            "Adapting evolution cadence"
                        );
                        current_interval = desired;
                        ticker = tokio::time::interval(current_interval);
                        ticker.reset();
                    }
                }
            }
        }
    })
}

/// One full evolution cycle. Public so scenario tests can drive ticks
/// without the timer.
pub async fn run_cycle(state: &SwarmState) -> CycleResult {
    let started = Instant::now();
    let result = match cycle_inner(state).await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Evolution cycle failed");
            CycleResult::Error
        }
    };
    state.metrics.incr(
        "evolution_cycles_total",
        &[("result", result.as_label())],
    );
    state
        .metrics
        .observe("evolution_cycle_seconds", started.elapsed().as_secs_f64(), &[]);
    result
}

async fn cycle_inner(state: &SwarmState) -> SwarmResult<CycleResult> {
    // Soft pause: ingestion continues, no new evolution work starts.
    if state.circuit_breaker.load(Ordering::Relaxed) {
        debug!("Circuit breaker engaged, skipping cycle");
        return Ok(CycleResult::CircuitBreaker);
    }

    if let Some(reason) = over_budget(&state.config) {
        state
            .metrics
            .incr("evolution_skipped", &[("reason", reason)]);
        warn!(reason, "Resource budget exceeded, skipping cycle");
        return Ok(CycleResult::BudgetLimit);
    }

    let window = CONSUME_WINDOW.min(Duration::from_secs(state.config.tick_interval_secs));
    let batch = state.bus.consume(EVENT_BATCH_SIZE, window).await;
    state.bus.queue_age_seconds();

    // Federation topic first; broadcasts are independent of evolution.
    for event in &batch.federation {
        process_federation_event(state, event).await;
    }

    if batch.learning.len() < state.config.evolve_min_events {
        debug!(
            events = batch.learning.len(),
            minimum = state.config.evolve_min_events,
            "Not enough learning signal to evolve this cycle"
        );
        return Ok(CycleResult::Success);
    }

    // Bootstrap: with an empty population, the strongest miss becomes
    // the founder antibody.
    if state.population.total_antibodies().await == 0 {
        if let Some(seed) = founder_from_events(&batch.learning) {
            let variant = state.population.seed_variant(seed, "autonomous-loop").await?;
            info!(antibody_id = %variant.id, "Seeded founder antibody from learning events");
        }
    }

    let (pattern, environment) = dominant_signal(&batch.learning);

    // Convert the batch into synthetic combat results for every
    // non-retired antibody.
    let mut candidates = Vec::new();
    for phase in [
        aswarm_shared::AntibodyPhase::Pending,
        aswarm_shared::AntibodyPhase::Shadow,
        aswarm_shared::AntibodyPhase::Staged,
        aswarm_shared::AntibodyPhase::Canary,
        aswarm_shared::AntibodyPhase::Active,
    ] {
        candidates.extend(state.population.ids_in_phase(phase).await);
    }

    // Equal benign volume keeps the combined sample size past the
    // promotion SLO floor once enough misses arrive.
    let attack_samples = batch.learning.len().clamp(30, 200);
    let benign_samples = attack_samples;

    let mut results = HashMap::new();
    for antibody_id in &candidates {
        match state
            .evaluator
            .evaluate(antibody_id, &pattern, attack_samples, benign_samples, &environment)
            .await
        {
            Ok(summary) => {
                results.insert(antibody_id.clone(), summary);
            }
            Err(e) => {
                warn!(antibody_id = %antibody_id, error = %e, "Evaluation failed");
            }
        }
    }
    state.population.ingest_results(results).await;

    // Promotion pass.
    state.promotion.reset_reconcile_markers().await;
    for antibody_id in &candidates {
        match state.promotion.reconcile(antibody_id).await {
            Ok(outcome) if outcome.federation_broadcast => {
                schedule_federation_share(state, antibody_id);
            }
            Ok(_) => {}
            Err(e) => warn!(antibody_id = %antibody_id, error = %e, "Reconcile failed"),
        }
    }

    // Next cohort.
    let parents = state.population.select_next_parents(PARENTS_PER_ROUND).await;
    if parents.is_empty() {
        debug!("No scored parents yet, skipping cohort proposal");
        return Ok(CycleResult::Success);
    }
    let cohort = state
        .population
        .propose_cohort(&parents, COHORT_SIZE, &environment)
        .await?;
    info!(
        cohort = cohort.len(),
        parents = parents.len(),
        "Proposed next cohort"
    );
    Ok(CycleResult::Success)
}

/// Queue a federation share for an antibody that just went active. The
/// federation worker picks it up from the bus on a later cycle.
fn schedule_federation_share(state: &SwarmState, antibody_id: &str) {
    let now = chrono::Utc::now().timestamp();
    let event = LearningEvent {
        event_id: format!("federation-share-{}-{}", antibody_id, now),
        signature: antibody_id.to_string(),
        env: state.config.cluster_id.clone(),
        features: BTreeMap::new(),
        severity: 0.0,
        first_seen_unix: now,
        last_seen_unix: now,
    };
    if let Err(e) = state.bus.emit(event) {
        warn!(antibody_id, error = %e, "Failed to queue federation share");
    }
}

async fn process_federation_event(state: &SwarmState, event: &LearningEvent) {
    let Some(client) = &state.federation else {
        debug!("No federation client configured, dropping share event");
        return;
    };
    let antibody_id = &event.signature;
    let Some(variant) = state.population.variant(antibody_id).await else {
        warn!(antibody_id, "Federation event for unknown antibody");
        return;
    };
    let Some(fitness) = state.population.fitness_of(antibody_id).await else {
        warn!(antibody_id, "Federation event for unscored antibody");
        return;
    };
    let coverage = coverage_items(&variant.spec);
    let report = client
        .broadcast_coverage(&variant, &fitness, &coverage)
        .await;
    if report.failures() > 0 {
        warn!(
            antibody_id,
            failures = report.failures(),
            "Federation broadcast partially failed"
        );
    }
}

/// Items the coverage sketch counts: the rule surface of the detector.
fn coverage_items(spec: &AntibodySpec) -> Vec<String> {
    match &spec.detector {
        DetectorSpec::Rule { pattern, features, .. } => {
            let mut items = vec![pattern.clone()];
            items.extend(features.iter().map(|(k, v)| format!("{}={}", k, v)));
            items
        }
        DetectorSpec::Model { training_ref, features } => {
            let mut items = vec![training_ref.clone()];
            items.extend(features.keys().cloned());
            items
        }
        DetectorSpec::Hybrid { weights } => weights.keys().cloned().collect(),
    }
}

/// Highest-severity signature and its environment drive the cycle's
/// combat trials.
fn dominant_signal(events: &[LearningEvent]) -> (String, String) {
    let dominant = events.iter().max_by(|a, b| {
        a.severity
            .partial_cmp(&b.severity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    match dominant {
        Some(event) => (event.signature.clone(), event.env.clone()),
        None => ("benign".to_string(), "default".to_string()),
    }
}

fn founder_from_events(events: &[LearningEvent]) -> Option<AntibodySpec> {
    let dominant = events.iter().max_by(|a, b| {
        a.severity
            .partial_cmp(&b.severity)
            .unwrap_or(std::cmp::Ordering::Equal)
    })?;
    let mut spec = AntibodySpec {
        detector: DetectorSpec::Rule {
            pattern: dominant.signature.clone(),
            engine: "falco".into(),
            features: dominant.features.clone(),
        },
        scope: Scope {
            environments: BTreeSet::from([dominant.env.clone()]),
            namespaces: None,
            labels: None,
            confidence_threshold: 0.7,
        },
        lineage: None,
        controls: Controls::default(),
    };
    spec.sanitize();
    spec.validate().ok()?;
    Some(spec)
}

/// Resource budget hints. Disabled unless configured; on non-Linux
/// hosts the probes read as in-budget.
fn over_budget(config: &EvolutionConfig) -> Option<&'static str> {
    if let Some(max_rss_mb) = config.max_rss_mb {
        if let Some(rss_mb) = current_rss_mb() {
            if rss_mb > max_rss_mb {
                return Some("budget");
            }
        }
    }
    if let Some(max_load) = config.max_load_avg {
        if let Some(load) = current_load_avg() {
            if load > max_load {
                return Some("budget");
            }
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn current_rss_mb() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096 / (1024 * 1024))
}

#[cfg(not(target_os = "linux"))]
fn current_rss_mb() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn current_load_avg() -> Option<f64> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    loadavg.split_whitespace().next()?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn current_load_avg() -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, signature: &str, severity: f64) -> LearningEvent {
        LearningEvent {
            event_id: id.to_string(),
            signature: signature.to_string(),
            env: "prod".into(),
            features: BTreeMap::from([("egress".to_string(), "1".to_string())]),
            severity,
            first_seen_unix: 1_700_000_000,
            last_seen_unix: 1_700_000_000,
        }
    }

    #[test]
    fn test_dominant_signal_picks_highest_severity() {
        let events = vec![
            event("a", "T1059.shell", 0.4),
            event("b", "T1496.mining", 0.9),
            event("c", "T1021.lateral", 0.6),
        ];
        let (pattern, env) = dominant_signal(&events);
        assert_eq!(pattern, "T1496.mining");
        assert_eq!(env, "prod");
    }

    #[test]
    fn test_founder_spec_validates() {
        let events = vec![event("a", "T1496.mining", 0.8)];
        let spec = founder_from_events(&events).unwrap();
        spec.validate().unwrap();
        assert!(spec.scope.environments.contains("prod"));
    }

    #[test]
    fn test_founder_requires_events() {
        assert!(founder_from_events(&[]).is_none());
    }

    #[test]
    fn test_coverage_items_cover_rule_surface() {
        let spec = founder_from_events(&[event("a", "T1496.mining", 0.8)]).unwrap();
        let items = coverage_items(&spec);
        assert!(items.contains(&"T1496.mining".to_string()));
        assert!(items.contains(&"egress=1".to_string()));
    }

    #[test]
    fn test_budget_disabled_by_default() {
        let config = EvolutionConfig::for_tests();
        assert!(over_budget(&config).is_none());
    }
}
