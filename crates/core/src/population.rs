//! Population management: pools, tournament selection, cohort proposal.
//!
//! One RW-lock guards all pool state; the RNG sits behind its own mutex
//! so selection never contends with readers of the pools. Cohorts are
//! proposed under the write lock to keep id assignment and storage
//! atomic.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use aswarm_shared::antibody::{variant_id, Lineage};
use aswarm_shared::{
    AntibodyPhase, AntibodySpec, AntibodyVariant, FitnessSummary, MetricsSink, SwarmError,
    SwarmResult,
};

use crate::db::{SwarmDataStore, POPULATION_STORE_ID};
use crate::mutation::MutationEngine;

const BEST_FITNESS_HISTORY_LEN: usize = 50;
const SNAPSHOT_KEY: &str = "population:snapshot";

// ============================================================
// Parameters
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationParams {
    /// Parent pool capacity (the shadow breeding pool).
    pub shadow_pool_size: usize,
    pub elite_size: usize,
    pub crossover_rate: f64,
    pub mutation_rate: f64,
    /// Diversity pressure during tournament selection.
    pub diversity_lambda: f64,
}

impl Default for PopulationParams {
    fn default() -> Self {
        Self {
            shadow_pool_size: 25,
            elite_size: 10,
            crossover_rate: 0.3,
            mutation_rate: 0.1,
            diversity_lambda: 0.3,
        }
    }
}

impl PopulationParams {
    pub fn validate(&self) -> SwarmResult<()> {
        if self.shadow_pool_size == 0 {
            return Err(SwarmError::InvalidSpec(
                "shadow_pool_size must be positive".into(),
            ));
        }
        if self.elite_size > self.shadow_pool_size {
            return Err(SwarmError::InvalidSpec(format!(
                "elite_size {} exceeds shadow_pool_size {}",
                self.elite_size, self.shadow_pool_size
            )));
        }
        for (name, rate) in [
            ("crossover_rate", self.crossover_rate),
            ("mutation_rate", self.mutation_rate),
            ("diversity_lambda", self.diversity_lambda),
        ] {
            if !(0.0..=1.0).contains(&rate) || !rate.is_finite() {
                return Err(SwarmError::InvalidSpec(format!(
                    "{} must be in [0, 1], got {}",
                    name, rate
                )));
            }
        }
        Ok(())
    }
}

// ============================================================
// Snapshot view
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationSnapshot {
    pub generation: u64,
    pub parent_pool: Vec<String>,
    pub archive: Vec<String>,
    pub active_pools: BTreeMap<String, Vec<String>>,
    pub diversity_index: f64,
    pub best_fitness_history: Vec<f64>,
    pub best_by_generation: BTreeMap<u64, f64>,
    pub spec_hashes: BTreeMap<String, String>,
    pub params: PopulationParams,
    pub last_updated: DateTime<Utc>,
}

// ============================================================
// Manager
// ============================================================

struct PopulationInner {
    generation: u64,
    variants: HashMap<String, AntibodyVariant>,
    fitness: HashMap<String, FitnessSummary>,
    overall: HashMap<String, f64>,
    parent_pool: Vec<String>,
    archive: Vec<String>,
    phases: HashMap<String, AntibodyPhase>,
    best_fitness_history: VecDeque<f64>,
    best_by_generation: BTreeMap<u64, f64>,
    diversity_index: f64,
    params: PopulationParams,
    last_updated: DateTime<Utc>,
}

pub struct PopulationManager {
    inner: RwLock<PopulationInner>,
    // Distinct from the pool lock so selection randomness never blocks
    // snapshot readers.
    rng: Mutex<StdRng>,
    engine: Arc<MutationEngine>,
    metrics: Arc<dyn MetricsSink>,
    store: Option<Arc<dyn SwarmDataStore>>,
}

impl PopulationManager {
    pub fn new(
        engine: Arc<MutationEngine>,
        params: PopulationParams,
        seed: u64,
        metrics: Arc<dyn MetricsSink>,
        store: Option<Arc<dyn SwarmDataStore>>,
    ) -> SwarmResult<Self> {
        params.validate()?;
        Ok(Self {
            inner: RwLock::new(PopulationInner {
                generation: 0,
                variants: HashMap::new(),
                fitness: HashMap::new(),
                overall: HashMap::new(),
                parent_pool: Vec::new(),
                archive: Vec::new(),
                phases: HashMap::new(),
                best_fitness_history: VecDeque::with_capacity(BEST_FITNESS_HISTORY_LEN),
                best_by_generation: BTreeMap::new(),
                diversity_index: 1.0,
                params,
                last_updated: Utc::now(),
            }),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            engine,
            metrics,
            store,
        })
    }

    /// Admit a hand-authored founder spec into the breeding pool.
    pub async fn seed_variant(
        &self,
        mut spec: AntibodySpec,
        proposed_by: &str,
    ) -> SwarmResult<AntibodyVariant> {
        spec.sanitize();
        spec.validate()?;
        let mut inner = self.inner.write().await;
        let index = inner.variants.len();
        let id = variant_id("seed", inner.generation, index, &[]);
        let variant = AntibodyVariant {
            id: id.clone(),
            spec_hash: spec.spec_hash(),
            parent_ids: Vec::new(),
            generation: inner.generation,
            diversity_signature: spec.diversity_signature(),
            spec,
            proposed_by: proposed_by.to_string(),
            created_at: Utc::now(),
        };
        inner.variants.insert(id.clone(), variant.clone());
        inner.parent_pool.push(id.clone());
        inner.phases.insert(id, AntibodyPhase::Pending);
        Ok(variant)
    }

    /// Propose a cohort of children from the given parents. Crossover is
    /// attempted at `crossover_rate` when two distinct parents exist,
    /// mutation otherwise; children failing an operator are skipped and
    /// the cohort continues.
    pub async fn propose_cohort(
        &self,
        parents: &[String],
        size: usize,
        environment: &str,
    ) -> SwarmResult<Vec<AntibodyVariant>> {
        if parents.is_empty() {
            return Err(SwarmError::InvalidSpec(
                "cohort proposal requires at least one parent".into(),
            ));
        }

        let mut inner = self.inner.write().await;
        let child_generation = inner.generation + 1;
        let crossover_rate = inner.params.crossover_rate;

        let parent_specs: HashMap<String, AntibodySpec> = parents
            .iter()
            .filter_map(|id| inner.variants.get(id).map(|v| (id.clone(), v.spec.clone())))
            .collect();
        if parent_specs.is_empty() {
            return Err(SwarmError::InvalidSpec(
                "none of the requested parents are known".into(),
            ));
        }
        let known_parents: Vec<String> = parent_specs.keys().cloned().collect();

        let mut cohort = Vec::with_capacity(size);
        for slot in 0..size {
            let distinct = known_parents.len() >= 2;
            let (want_crossover, picked): (bool, Vec<String>) = {
                let mut rng = self.rng.lock().expect("population RNG poisoned");
                let want = distinct && rng.gen_bool(crossover_rate);
                let picked = if want {
                    let mut shuffled = known_parents.clone();
                    shuffled.shuffle(&mut *rng);
                    shuffled.truncate(2);
                    shuffled
                } else {
                    vec![known_parents[rng.gen_range(0..known_parents.len())].clone()]
                };
                (want, picked)
            };

            let produced = if want_crossover {
                let refs: Vec<&AntibodySpec> =
                    picked.iter().map(|id| &parent_specs[id]).collect();
                match self.engine.crossover(&refs) {
                    Ok(out) => Ok(out),
                    // Insufficient/unsupported crossover falls back to
                    // mutating the first pick.
                    Err(SwarmError::UnsupportedVariant(_)) | Err(SwarmError::InvalidSpec(_)) => {
                        self.engine.mutate(&parent_specs[&picked[0]])
                    }
                    Err(e) => Err(e),
                }
            } else {
                self.engine.mutate(&parent_specs[&picked[0]])
            };

            let (mut child_spec, diff) = match produced {
                Ok(out) => out,
                Err(e) => {
                    debug!(slot, error = %e, "Skipping child that failed mutation");
                    self.metrics
                        .incr("mutation_skipped_total", &[("reason", e.kind())]);
                    continue;
                }
            };

            if !child_spec.scope.environments.contains(environment) {
                child_spec.scope.environments.insert(environment.to_string());
            }
            child_spec.lineage = Some(Lineage {
                parent_id: Some(picked[0].clone()),
                generation: child_generation,
                mutation_kind: Some(diff.operator.clone()),
                created_by: "population-manager".into(),
                created_at: Utc::now(),
            });

            let id = variant_id(&diff.operator, child_generation, slot, &picked);
            let variant = AntibodyVariant {
                id: id.clone(),
                spec_hash: child_spec.spec_hash(),
                parent_ids: picked,
                generation: child_generation,
                diversity_signature: child_spec.diversity_signature(),
                spec: child_spec,
                proposed_by: format!("evolution:{}", diff.operator),
                created_at: Utc::now(),
            };
            inner.variants.insert(id.clone(), variant.clone());
            inner.phases.insert(id, AntibodyPhase::Pending);
            cohort.push(variant);
        }

        inner.last_updated = Utc::now();
        Ok(cohort)
    }

    /// Store fitness for known variants, refresh the breeding pools, and
    /// advance the generation counter exactly once.
    pub async fn ingest_results(&self, results: HashMap<String, FitnessSummary>) {
        let mut inner = self.inner.write().await;
        for (id, summary) in results {
            if !inner.variants.contains_key(&id) {
                warn!(antibody_id = %id, "Ignoring fitness for unknown variant");
                continue;
            }
            let overall = summary.overall_fitness();
            inner.overall.insert(id.clone(), overall);
            inner.fitness.insert(id, summary);
        }

        refresh_pools(&mut inner);
        let pool = inner.parent_pool.clone();
        let diversity = diversity_of(&inner, &pool);
        inner.diversity_index = diversity;
        inner.generation += 1;

        let best = inner
            .overall
            .values()
            .fold(0.0_f64, |acc, v| acc.max(*v));
        if inner.best_fitness_history.len() == BEST_FITNESS_HISTORY_LEN {
            inner.best_fitness_history.pop_front();
        }
        inner.best_fitness_history.push_back(best);
        let generation = inner.generation;
        inner.best_by_generation.insert(generation, best);
        inner.last_updated = Utc::now();

        self.metrics
            .set_gauge("population_diversity_index", inner.diversity_index, &[]);
        self.metrics
            .set_gauge("population_generation", inner.generation as f64, &[]);

        let snapshot = snapshot_of(&inner);
        drop(inner);
        self.persist_snapshot(&snapshot).await;
    }

    /// Tournament selection with a diversity penalty against the already
    /// selected set. Unique picks; gives back what it found once the 3k
    /// retry budget runs out.
    pub async fn select_next_parents(&self, k: usize) -> Vec<String> {
        let inner = self.inner.read().await;
        let pool = &inner.parent_pool;
        if pool.is_empty() || k == 0 {
            return Vec::new();
        }
        let tournament_size = std::cmp::min(5, pool.len());
        let lambda = inner.params.diversity_lambda;

        let mut selected: Vec<String> = Vec::with_capacity(k);
        let mut attempts = 0usize;
        let budget = 3 * k;

        while selected.len() < k && attempts < budget {
            attempts += 1;
            let mut winning: Option<(String, f64)> = None;
            {
                let mut rng = self.rng.lock().expect("population RNG poisoned");
                for _ in 0..tournament_size {
                    let candidate = &pool[rng.gen_range(0..pool.len())];
                    let base = inner.overall.get(candidate).copied().unwrap_or(0.5);
                    let penalty = max_similarity(&inner, candidate, &selected);
                    let score = base - lambda * penalty;
                    if winning.as_ref().map_or(true, |(_, s)| score >= *s) {
                        winning = Some((candidate.clone(), score));
                    }
                }
            }
            if let Some((winner, _)) = winning {
                if !selected.contains(&winner) {
                    selected.push(winner);
                }
            }
        }
        selected
    }

    pub async fn snapshot(&self) -> PopulationSnapshot {
        let inner = self.inner.read().await;
        snapshot_of(&inner)
    }

    pub async fn get_diversity_index(&self) -> f64 {
        self.inner.read().await.diversity_index
    }

    pub async fn generation(&self) -> u64 {
        self.inner.read().await.generation
    }

    pub async fn update_config(&self, params: PopulationParams) -> SwarmResult<()> {
        params.validate()?;
        let mut inner = self.inner.write().await;
        inner.params = params;
        inner.last_updated = Utc::now();
        Ok(())
    }

    pub async fn variant(&self, id: &str) -> Option<AntibodyVariant> {
        self.inner.read().await.variants.get(id).cloned()
    }

    pub async fn fitness_of(&self, id: &str) -> Option<FitnessSummary> {
        self.inner.read().await.fitness.get(id).cloned()
    }

    /// Phase bookkeeping is driven by the promotion controller.
    pub async fn update_phase(&self, id: &str, phase: AntibodyPhase) {
        let mut inner = self.inner.write().await;
        if inner.variants.contains_key(id) {
            inner.phases.insert(id.to_string(), phase);
        }
    }

    pub async fn ids_in_phase(&self, phase: AntibodyPhase) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .phases
            .iter()
            .filter(|(_, p)| **p == phase)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn phase_counts(&self) -> HashMap<AntibodyPhase, usize> {
        let inner = self.inner.read().await;
        let mut counts = HashMap::new();
        for phase in inner.phases.values() {
            *counts.entry(*phase).or_insert(0) += 1;
        }
        counts
    }

    pub async fn total_antibodies(&self) -> usize {
        self.inner.read().await.phases.len()
    }

    /// Restore the counters of a persisted snapshot. Variants are not
    /// persisted; pools refill as evaluation results arrive.
    pub async fn restore(&self, snapshot: &PopulationSnapshot) -> SwarmResult<()> {
        snapshot.params.validate()?;
        let mut inner = self.inner.write().await;
        inner.generation = snapshot.generation;
        inner.best_by_generation = snapshot.best_by_generation.clone();
        inner.best_fitness_history = snapshot.best_fitness_history.iter().copied().collect();
        inner.params = snapshot.params.clone();
        Ok(())
    }

    async fn persist_snapshot(&self, snapshot: &PopulationSnapshot) {
        let Some(store) = &self.store else {
            return;
        };
        match serde_json::to_value(snapshot) {
            Ok(value) => {
                if let Err(e) = store.set_json(POPULATION_STORE_ID, SNAPSHOT_KEY, value).await {
                    warn!(error = %e, "Failed to persist population snapshot");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize population snapshot"),
        }
    }

    pub async fn load_persisted_snapshot(
        store: &dyn SwarmDataStore,
    ) -> anyhow::Result<Option<PopulationSnapshot>> {
        match store.get_json(POPULATION_STORE_ID, SNAPSHOT_KEY).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

// ============================================================
// Pool maintenance (pure helpers over the locked state)
// ============================================================

fn refresh_pools(inner: &mut PopulationInner) {
    let mut scored: Vec<(String, f64)> = inner
        .overall
        .iter()
        .map(|(id, fit)| (id.clone(), *fit))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    inner.parent_pool = scored
        .iter()
        .take(inner.params.shadow_pool_size)
        .map(|(id, _)| id.clone())
        .collect();

    // Archive: union with the current elite, capped at 3x elite size,
    // best first.
    let elite: Vec<String> = scored
        .iter()
        .take(inner.params.elite_size)
        .map(|(id, _)| id.clone())
        .collect();
    let mut archive = inner.archive.clone();
    for id in elite {
        if !archive.contains(&id) {
            archive.push(id);
        }
    }
    archive.sort_by(|a, b| {
        let fa = inner.overall.get(a).copied().unwrap_or(0.0);
        let fb = inner.overall.get(b).copied().unwrap_or(0.0);
        fb.partial_cmp(&fa).unwrap_or(std::cmp::Ordering::Equal)
    });
    archive.truncate(inner.params.elite_size * 3);
    inner.archive = archive;
}

fn diversity_of(inner: &PopulationInner, pool: &[String]) -> f64 {
    let signatures: Vec<_> = pool
        .iter()
        .filter_map(|id| inner.variants.get(id))
        .map(|v| &v.diversity_signature)
        .collect();
    if signatures.len() < 2 {
        return 1.0;
    }
    let mut total = 0.0;
    let mut pairs = 0u64;
    for i in 0..signatures.len() {
        for j in (i + 1)..signatures.len() {
            match signatures[i].jaccard(signatures[j]) {
                Ok(sim) => {
                    total += sim;
                    pairs += 1;
                }
                Err(e) => warn!(error = %e, "Skipping incomparable signature pair"),
            }
        }
    }
    if pairs == 0 {
        return 1.0;
    }
    (1.0 - total / pairs as f64).clamp(0.0, 1.0)
}

fn max_similarity(inner: &PopulationInner, candidate: &str, selected: &[String]) -> f64 {
    let Some(candidate_sig) = inner
        .variants
        .get(candidate)
        .map(|v| &v.diversity_signature)
    else {
        return 0.0;
    };
    selected
        .iter()
        .filter_map(|id| inner.variants.get(id))
        .filter_map(|v| candidate_sig.jaccard(&v.diversity_signature).ok())
        .fold(0.0_f64, f64::max)
}

fn snapshot_of(inner: &PopulationInner) -> PopulationSnapshot {
    let mut active_pools: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (id, phase) in &inner.phases {
        active_pools
            .entry(phase.to_string())
            .or_default()
            .push(id.clone());
    }
    for ids in active_pools.values_mut() {
        ids.sort();
    }
    PopulationSnapshot {
        generation: inner.generation,
        parent_pool: inner.parent_pool.clone(),
        archive: inner.archive.clone(),
        active_pools,
        diversity_index: inner.diversity_index,
        best_fitness_history: inner.best_fitness_history.iter().copied().collect(),
        best_by_generation: inner.best_by_generation.clone(),
        spec_hashes: inner
            .variants
            .iter()
            .map(|(id, v)| (id.clone(), v.spec_hash.clone()))
            .collect(),
        params: inner.params.clone(),
        last_updated: inner.last_updated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationConfig;
    use aswarm_shared::antibody::{Controls, DetectorSpec, Scope};
    use aswarm_shared::AtomicMetrics;
    use std::collections::{BTreeMap as Map, BTreeSet};

    fn rule_spec(pattern: &str, features: &[(&str, &str)]) -> AntibodySpec {
        AntibodySpec {
            detector: DetectorSpec::Rule {
                pattern: pattern.into(),
                engine: "falco".into(),
                features: features
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            },
            scope: Scope {
                environments: BTreeSet::from(["prod".to_string()]),
                namespaces: None,
                labels: None,
                confidence_threshold: 0.7,
            },
            lineage: None,
            controls: Controls::default(),
        }
    }

    fn summary(lower: f64) -> FitnessSummary {
        FitnessSummary {
            detection_rate: lower,
            avg_latency_ms: 100.0,
            p95_latency_ms: 200.0,
            roc: None,
            confidence_lower: lower,
            confidence_upper: (lower + 0.05).min(1.0),
            stability_score: 0.8,
            sample_size: 250,
            avg_blast_radius: 1.0,
            containment_cost: 0.0,
            precision: None,
            recall: None,
            f1: None,
            safety_violations: None,
        }
    }

    fn manager() -> PopulationManager {
        let metrics = AtomicMetrics::new();
        let engine =
            Arc::new(MutationEngine::new(7, MutationConfig::default(), metrics.clone()).unwrap());
        PopulationManager::new(engine, PopulationParams::default(), 7, metrics, None).unwrap()
    }

    async fn seeded(manager: &PopulationManager, n: usize) -> Vec<String> {
        let mut ids = Vec::new();
        for i in 0..n {
            // Disjoint feature sets and distinct thresholds keep the
            // seeded pool diverse.
            let mut spec = rule_spec(
                &format!("proc.name=threat-{}", i),
                &[(&format!("sig_{}", i), "1"), (&format!("aux_{}", i), "0")],
            );
            spec.scope.confidence_threshold = 0.5 + 0.05 * i as f64;
            ids.push(manager.seed_variant(spec, "test").await.unwrap().id);
        }
        ids
    }

    #[tokio::test]
    async fn test_ingest_increments_generation_exactly_once() {
        let m = manager();
        let ids = seeded(&m, 3).await;
        assert_eq!(m.generation().await, 0);
        let results: HashMap<String, FitnessSummary> =
            ids.iter().map(|id| (id.clone(), summary(0.9))).collect();
        m.ingest_results(results).await;
        assert_eq!(m.generation().await, 1);
        m.ingest_results(HashMap::new()).await;
        assert_eq!(m.generation().await, 2);
    }

    #[tokio::test]
    async fn test_parent_pool_bounded_by_shadow_pool_size() {
        let metrics = AtomicMetrics::new();
        let engine =
            Arc::new(MutationEngine::new(7, MutationConfig::default(), metrics.clone()).unwrap());
        let params = PopulationParams {
            shadow_pool_size: 4,
            elite_size: 2,
            ..PopulationParams::default()
        };
        let m = PopulationManager::new(engine, params, 7, metrics, None).unwrap();
        let ids = seeded(&m, 10).await;
        let results: HashMap<String, FitnessSummary> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), summary(0.5 + i as f64 * 0.04)))
            .collect();
        m.ingest_results(results).await;
        let snap = m.snapshot().await;
        assert!(snap.parent_pool.len() <= 4);
        assert!(snap.archive.len() <= 6);
    }

    #[tokio::test]
    async fn test_diversity_index_bounds() {
        let m = manager();
        // Identical specs → identical signatures → diversity near 0.
        for _ in 0..4 {
            m.seed_variant(rule_spec("same", &[("a", "1")]), "test")
                .await
                .unwrap();
        }
        let ids: Vec<String> = m.ids_in_phase(AntibodyPhase::Pending).await;
        let results: HashMap<String, FitnessSummary> =
            ids.iter().map(|id| (id.clone(), summary(0.9))).collect();
        m.ingest_results(results).await;
        let diversity = m.get_diversity_index().await;
        assert!(diversity < 0.01, "identical pool diversity {}", diversity);

        // A fresh manager with disjoint specs trends toward 1.
        let m2 = manager();
        let ids = seeded(&m2, 5).await;
        let results: HashMap<String, FitnessSummary> =
            ids.iter().map(|id| (id.clone(), summary(0.9))).collect();
        m2.ingest_results(results).await;
        let diversity = m2.get_diversity_index().await;
        assert!(diversity > 0.5, "disjoint pool diversity {}", diversity);
    }

    #[tokio::test]
    async fn test_propose_cohort_injects_environment_and_stores() {
        let m = manager();
        let ids = seeded(&m, 2).await;
        let cohort = m.propose_cohort(&ids, 8, "staging").await.unwrap();
        assert!(!cohort.is_empty());
        for child in &cohort {
            assert!(child.spec.scope.environments.contains("staging"));
            assert_eq!(child.generation, 1);
            assert!(m.variant(&child.id).await.is_some());
            child.spec.validate().unwrap();
        }
    }

    #[tokio::test]
    async fn test_propose_cohort_without_parents_errors() {
        let m = manager();
        let err = m.propose_cohort(&[], 4, "prod").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_spec");
    }

    #[tokio::test]
    async fn test_select_next_parents_unique() {
        let m = manager();
        let ids = seeded(&m, 6).await;
        let results: HashMap<String, FitnessSummary> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), summary(0.6 + i as f64 * 0.05)))
            .collect();
        m.ingest_results(results).await;

        let parents = m.select_next_parents(4).await;
        assert!(!parents.is_empty());
        let unique: std::collections::HashSet<_> = parents.iter().collect();
        assert_eq!(unique.len(), parents.len());
    }

    #[tokio::test]
    async fn test_update_config_validation() {
        let m = manager();
        let bad = PopulationParams {
            elite_size: 50,
            shadow_pool_size: 10,
            ..PopulationParams::default()
        };
        assert!(m.update_config(bad).await.is_err());
        let good = PopulationParams::default();
        m.update_config(good).await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_carries_spec_hashes_and_params() {
        let m = manager();
        let ids = seeded(&m, 2).await;
        let snap = m.snapshot().await;
        for id in &ids {
            assert!(snap.spec_hashes.contains_key(id));
        }
        let _round_trip: PopulationSnapshot =
            serde_json::from_value(serde_json::to_value(&snap).unwrap()).unwrap();
    }

    #[test]
    fn test_params_validation() {
        let mut p = PopulationParams::default();
        p.crossover_rate = 1.4;
        assert!(p.validate().is_err());
        p.crossover_rate = 0.4;
        p.elite_size = p.shadow_pool_size + 1;
        assert!(p.validate().is_err());
    }
}
