//! Genetic operators over antibody specs.
//!
//! The engine owns the only RNG in the search path, seeded explicitly so
//! whole lineages replay byte-for-byte. `mutate_n` derives one child RNG
//! per offspring index from the parent id, which makes any child
//! reconstructable from (parent id, index) alone.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use aswarm_shared::{AntibodySpec, DetectorSpec, MetricsSink, SwarmError, SwarmResult};

// ============================================================
// Configuration
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationConfig {
    /// Probability of jittering the confidence threshold.
    pub param_jitter_prob: f64,
    /// Stddev of the threshold jitter.
    pub threshold_delta: f64,
    /// Per-feature flip probability for binary rule features.
    pub feature_toggle_prob: f64,
    pub feature_add_prob: f64,
    pub feature_remove_prob: f64,
    /// Probability of re-shuffling hybrid weights.
    pub weight_shuffle_prob: f64,
    /// Stddev of hybrid weight jitter.
    pub param_jitter_sigma: f64,
    /// Bounded retries when probing for a fresh feature name.
    pub feature_add_retries: u32,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            param_jitter_prob: 0.3,
            threshold_delta: 0.05,
            feature_toggle_prob: 0.1,
            feature_add_prob: 0.1,
            feature_remove_prob: 0.05,
            weight_shuffle_prob: 0.3,
            param_jitter_sigma: 0.1,
            feature_add_retries: 16,
        }
    }
}

impl MutationConfig {
    pub fn validate(&self) -> SwarmResult<()> {
        for (name, p) in [
            ("param_jitter_prob", self.param_jitter_prob),
            ("feature_toggle_prob", self.feature_toggle_prob),
            ("feature_add_prob", self.feature_add_prob),
            ("feature_remove_prob", self.feature_remove_prob),
            ("weight_shuffle_prob", self.weight_shuffle_prob),
        ] {
            if !(0.0..=1.0).contains(&p) || !p.is_finite() {
                return Err(SwarmError::InvalidSpec(format!(
                    "{} must be a probability, got {}",
                    name, p
                )));
            }
        }
        for (name, s) in [
            ("threshold_delta", self.threshold_delta),
            ("param_jitter_sigma", self.param_jitter_sigma),
        ] {
            if !s.is_finite() || s < 0.0 {
                return Err(SwarmError::NumericalDegenerate(format!(
                    "{} must be a non-negative finite stddev, got {}",
                    name, s
                )));
            }
        }
        Ok(())
    }
}

/// Auditable record of what one operator pass changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationDiff {
    pub operator: String,
    pub changes: Vec<String>,
}

// ============================================================
// Engine
// ============================================================

pub struct MutationEngine {
    config: MutationConfig,
    rng: Mutex<StdRng>,
    metrics: Arc<dyn MetricsSink>,
}

impl MutationEngine {
    pub fn new(
        seed: u64,
        config: MutationConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> SwarmResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            metrics,
        })
    }

    pub fn config(&self) -> &MutationConfig {
        &self.config
    }

    /// Stable per-offspring seed: SHA-256 over `parent_id:index`. The
    /// full 32-byte digest seeds the child RNG directly.
    #[must_use]
    pub fn seed_for_offspring(parent_id: &str, index: usize) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(parent_id.as_bytes());
        hasher.update(b":");
        hasher.update(index.to_string().as_bytes());
        hasher.finalize().into()
    }

    /// Mutate with the engine's own RNG stream.
    pub fn mutate(&self, parent: &AntibodySpec) -> SwarmResult<(AntibodySpec, MutationDiff)> {
        let mut rng = self.rng.lock().expect("mutation RNG poisoned");
        self.mutate_with_rng(&mut rng, parent)
    }

    /// Produce `n` children with reproducible per-index seeds. Children
    /// that fail an operator are returned as errors in-place so the
    /// caller can skip them without losing the rest of the batch.
    pub fn mutate_n(
        &self,
        parent: &AntibodySpec,
        parent_id: &str,
        n: usize,
    ) -> Vec<SwarmResult<(AntibodySpec, MutationDiff)>> {
        (0..n)
            .map(|index| {
                let mut rng = StdRng::from_seed(Self::seed_for_offspring(parent_id, index));
                self.mutate_with_rng(&mut rng, parent)
            })
            .collect()
    }

    /// Crossover over two or more parents. Rule children take each
    /// feature from a uniformly random rule parent; hybrid children
    /// average weights and renormalize.
    pub fn crossover(&self, parents: &[&AntibodySpec]) -> SwarmResult<(AntibodySpec, MutationDiff)> {
        let mut rng = self.rng.lock().expect("mutation RNG poisoned");
        self.crossover_with_rng(&mut rng, parents)
    }

    // ── Operator implementation ──

    fn mutate_with_rng(
        &self,
        rng: &mut StdRng,
        parent: &AntibodySpec,
    ) -> SwarmResult<(AntibodySpec, MutationDiff)> {
        let cfg = &self.config;
        let mut child = parent.clone();
        let mut changes = Vec::new();

        if rng.gen_bool(cfg.param_jitter_prob) {
            let before = child.scope.confidence_threshold;
            let jitter = sample_gaussian(rng, cfg.threshold_delta)?;
            child.scope.confidence_threshold = (before + jitter).clamp(0.0, 1.0);
            changes.push(format!(
                "jitter_threshold: {} -> {}",
                before, child.scope.confidence_threshold
            ));
        }

        match &mut child.detector {
            DetectorSpec::Rule { features, .. } => {
                self.toggle_features(rng, features, &mut changes);

                if rng.gen_bool(cfg.feature_add_prob) {
                    let name = fresh_feature_name(rng, features, cfg.feature_add_retries)?;
                    let value = if rng.gen_bool(0.5) { "1" } else { "0" };
                    features.insert(name.clone(), value.to_string());
                    changes.push(format!("add_feature: {}={}", name, value));
                }

                if rng.gen_bool(cfg.feature_remove_prob) && features.len() >= 2 {
                    let victim_index = rng.gen_range(0..features.len());
                    let victim = features
                        .keys()
                        .nth(victim_index)
                        .cloned()
                        .expect("index in range");
                    features.remove(&victim);
                    changes.push(format!("remove_feature: {}", victim));
                }
            }
            DetectorSpec::Hybrid { weights } => {
                if rng.gen_bool(cfg.weight_shuffle_prob) {
                    shuffle_weights(rng, weights, cfg.param_jitter_sigma, &mut changes)?;
                }
            }
            DetectorSpec::Model { .. } => {
                // Model detectors only take threshold jitter; their
                // feature bags are retrained, not mutated in place.
            }
        }

        child.sanitize();
        child.validate()?;
        Ok((
            child,
            MutationDiff {
                operator: "mutate".into(),
                changes,
            },
        ))
    }

    fn toggle_features(
        &self,
        rng: &mut StdRng,
        features: &mut BTreeMap<String, String>,
        changes: &mut Vec<String>,
    ) {
        let keys: Vec<String> = features.keys().cloned().collect();
        for key in keys {
            if !rng.gen_bool(self.config.feature_toggle_prob) {
                continue;
            }
            let value = features.get_mut(&key).expect("key just listed");
            match value.as_str() {
                "0" => {
                    *value = "1".into();
                    changes.push(format!("toggle_feature: {}=1", key));
                }
                "1" => {
                    *value = "0".into();
                    changes.push(format!("toggle_feature: {}=0", key));
                }
                _ => {
                    // Non-binary features are observed but never flipped.
                    self.metrics
                        .incr("mutation_feature_skips_total", &[("feature", &key)]);
                }
            }
        }
    }

    fn crossover_with_rng(
        &self,
        rng: &mut StdRng,
        parents: &[&AntibodySpec],
    ) -> SwarmResult<(AntibodySpec, MutationDiff)> {
        if parents.len() < 2 {
            return Err(SwarmError::InvalidSpec(format!(
                "crossover requires at least 2 parents, got {}",
                parents.len()
            )));
        }

        let mut child = parents[0].clone();
        let mut changes = Vec::new();

        match &mut child.detector {
            DetectorSpec::Rule { features, .. } => {
                let rule_parents: Vec<&BTreeMap<String, String>> = parents
                    .iter()
                    .filter_map(|p| match &p.detector {
                        DetectorSpec::Rule { features, .. } => Some(features),
                        _ => None,
                    })
                    .collect();

                let mut union: BTreeMap<String, Vec<&String>> = BTreeMap::new();
                for parent_features in &rule_parents {
                    for (k, v) in parent_features.iter() {
                        union.entry(k.clone()).or_default().push(v);
                    }
                }

                let mut mixed = BTreeMap::new();
                for (key, candidates) in union {
                    let pick = candidates[rng.gen_range(0..candidates.len())].clone();
                    mixed.insert(key, pick);
                }
                *features = mixed;
                changes.push(format!(
                    "crossover_rule_features: {} parents",
                    rule_parents.len()
                ));
            }
            DetectorSpec::Hybrid { weights } => {
                let hybrid_parents: Vec<&BTreeMap<String, f64>> = parents
                    .iter()
                    .filter_map(|p| match &p.detector {
                        DetectorSpec::Hybrid { weights } => Some(weights),
                        _ => None,
                    })
                    .collect();

                let mut averaged: BTreeMap<String, f64> = BTreeMap::new();
                for parent_weights in &hybrid_parents {
                    for (k, w) in parent_weights.iter() {
                        *averaged.entry(k.clone()).or_insert(0.0) += w;
                    }
                }
                let count = hybrid_parents.len() as f64;
                for w in averaged.values_mut() {
                    *w /= count;
                }
                renormalize(&mut averaged)?;
                *weights = averaged;
                changes.push(format!(
                    "crossover_hybrid_weights: {} parents",
                    hybrid_parents.len()
                ));
            }
            DetectorSpec::Model { .. } => {
                return Err(SwarmError::UnsupportedVariant(
                    "model detectors do not support crossover".into(),
                ));
            }
        }

        child.sanitize();
        child.validate()?;
        Ok((
            child,
            MutationDiff {
                operator: "crossover".into(),
                changes,
            },
        ))
    }
}

// ============================================================
// Operator helpers
// ============================================================

fn sample_gaussian(rng: &mut StdRng, sigma: f64) -> SwarmResult<f64> {
    if sigma == 0.0 {
        return Ok(0.0);
    }
    let normal = Normal::new(0.0, sigma)
        .map_err(|e| SwarmError::NumericalDegenerate(format!("gaussian sigma {}: {}", sigma, e)))?;
    Ok(normal.sample(rng))
}

fn fresh_feature_name(
    rng: &mut StdRng,
    features: &BTreeMap<String, String>,
    retries: u32,
) -> SwarmResult<String> {
    for _ in 0..retries {
        let candidate = format!("feat_{:04x}", rng.gen::<u16>());
        if !features.contains_key(&candidate) {
            return Ok(candidate);
        }
    }
    Err(SwarmError::FeatureNamespaceExhausted(format!(
        "no unique feature name found within {} attempts",
        retries
    )))
}

/// Jitter each weight, clamp to >= 0 and renormalize by the sum. A
/// degenerate sum (0, NaN, Inf) rejects the shuffle and keeps the prior
/// weights untouched.
fn shuffle_weights(
    rng: &mut StdRng,
    weights: &mut BTreeMap<String, f64>,
    sigma: f64,
    changes: &mut Vec<String>,
) -> SwarmResult<()> {
    let prior = weights.clone();
    for w in weights.values_mut() {
        let jitter = sample_gaussian(rng, sigma)?;
        *w = (*w + jitter).max(0.0);
    }
    if renormalize(weights).is_err() {
        *weights = prior;
        changes.push("shuffle_weights: rejected (degenerate sum), kept prior".into());
        return Ok(());
    }
    changes.push("shuffle_weights".into());
    Ok(())
}

fn renormalize(weights: &mut BTreeMap<String, f64>) -> SwarmResult<()> {
    let sum: f64 = weights.values().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return Err(SwarmError::NumericalDegenerate(format!(
            "weight sum {} cannot be renormalized",
            sum
        )));
    }
    for w in weights.values_mut() {
        *w /= sum;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aswarm_shared::antibody::{Controls, Scope};
    use aswarm_shared::AtomicMetrics;
    use std::collections::BTreeSet;

    fn rule_parent() -> AntibodySpec {
        AntibodySpec {
            detector: DetectorSpec::Rule {
                pattern: "proc.name in (xmrig, kinsing)".into(),
                engine: "falco".into(),
                features: BTreeMap::from([
                    ("burst".to_string(), "1".to_string()),
                    ("egress".to_string(), "0".to_string()),
                    ("persist".to_string(), "medium".to_string()),
                ]),
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

    fn hybrid_parent(rule_w: f64, model_w: f64) -> AntibodySpec {
        AntibodySpec {
            detector: DetectorSpec::Hybrid {
                weights: BTreeMap::from([
                    ("rule".to_string(), rule_w),
                    ("model".to_string(), model_w),
                ]),
            },
            ..rule_parent()
        }
    }

    fn engine(seed: u64) -> MutationEngine {
        MutationEngine::new(seed, MutationConfig::default(), AtomicMetrics::new()).unwrap()
    }

    fn aggressive_engine(seed: u64) -> MutationEngine {
        let config = MutationConfig {
            param_jitter_prob: 1.0,
            feature_toggle_prob: 1.0,
            feature_add_prob: 1.0,
            feature_remove_prob: 1.0,
            weight_shuffle_prob: 1.0,
            ..MutationConfig::default()
        };
        MutationEngine::new(seed, config, AtomicMetrics::new()).unwrap()
    }

    #[test]
    fn test_mutate_is_deterministic_for_same_seed() {
        let parent = rule_parent();
        let (a, _) = engine(7).mutate(&parent).unwrap();
        let (b, _) = engine(7).mutate(&parent).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mutate_n_reproducible_across_engines() {
        let parent = rule_parent();
        let first: Vec<_> = engine(1)
            .mutate_n(&parent, "ab-g1-cafe-0", 5)
            .into_iter()
            .map(|r| r.unwrap().0)
            .collect();
        // Different base seed: per-offspring seeds come from the parent
        // id, so the children must still match.
        let second: Vec<_> = engine(999)
            .mutate_n(&parent, "ab-g1-cafe-0", 5)
            .into_iter()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_children_always_validate() {
        let parent = rule_parent();
        let eng = aggressive_engine(42);
        for result in eng.mutate_n(&parent, "ab-g1-beef-0", 50) {
            let (child, _) = result.unwrap();
            child.validate().unwrap();
            assert!((0.0..=1.0).contains(&child.scope.confidence_threshold));
        }
    }

    #[test]
    fn test_toggle_skips_non_binary_features() {
        let parent = rule_parent();
        let eng = aggressive_engine(3);
        let (child, _) = eng.mutate(&parent).unwrap();
        if let DetectorSpec::Rule { features, .. } = &child.detector {
            // "persist" is non-binary and must survive untouched (unless
            // the remove operator claimed it).
            if let Some(v) = features.get("persist") {
                assert_eq!(v, "medium");
            }
        } else {
            panic!("child detector kind changed");
        }
    }

    #[test]
    fn test_remove_keeps_at_least_one_feature() {
        let mut parent = rule_parent();
        if let DetectorSpec::Rule { features, .. } = &mut parent.detector {
            features.clear();
            features.insert("only".into(), "1".into());
        }
        let config = MutationConfig {
            feature_remove_prob: 1.0,
            feature_add_prob: 0.0,
            ..MutationConfig::default()
        };
        let eng = MutationEngine::new(5, config, AtomicMetrics::new()).unwrap();
        let (child, _) = eng.mutate(&parent).unwrap();
        if let DetectorSpec::Rule { features, .. } = &child.detector {
            assert_eq!(features.len(), 1);
        }
    }

    #[test]
    fn test_feature_namespace_exhaustion_is_reported() {
        let parent = rule_parent();
        let config = MutationConfig {
            feature_add_prob: 1.0,
            feature_add_retries: 0,
            ..MutationConfig::default()
        };
        let eng = MutationEngine::new(5, config, AtomicMetrics::new()).unwrap();
        let err = eng.mutate(&parent).unwrap_err();
        assert_eq!(err.kind(), "feature_namespace_exhausted");
    }

    #[test]
    fn test_hybrid_shuffle_preserves_weight_sum() {
        let parent = hybrid_parent(0.6, 0.4);
        let eng = aggressive_engine(11);
        for result in eng.mutate_n(&parent, "ab-g2-f00d-1", 20) {
            let (child, _) = result.unwrap();
            if let DetectorSpec::Hybrid { weights } = &child.detector {
                let sum: f64 = weights.values().sum();
                assert!((sum - 1.0).abs() <= 1e-6, "sum {}", sum);
                assert!(weights.values().all(|w| *w >= 0.0));
            }
        }
    }

    #[test]
    fn test_crossover_requires_two_parents() {
        let parent = rule_parent();
        let err = engine(1).crossover(&[&parent]).unwrap_err();
        assert_eq!(err.kind(), "invalid_spec");
    }

    #[test]
    fn test_rule_crossover_draws_values_from_parents() {
        let mut left = rule_parent();
        let mut right = rule_parent();
        if let DetectorSpec::Rule { features, .. } = &mut left.detector {
            features.insert("burst".into(), "1".into());
            features.insert("left_only".into(), "1".into());
        }
        if let DetectorSpec::Rule { features, .. } = &mut right.detector {
            features.insert("burst".into(), "0".into());
            features.insert("right_only".into(), "0".into());
        }
        let (child, diff) = engine(2).crossover(&[&left, &right]).unwrap();
        assert_eq!(diff.operator, "crossover");
        if let DetectorSpec::Rule { features, .. } = &child.detector {
            // Union of keys, values drawn from some parent that has them.
            assert!(features.contains_key("left_only"));
            assert!(features.contains_key("right_only"));
            let burst = features.get("burst").unwrap();
            assert!(burst == "0" || burst == "1");
        }
    }

    #[test]
    fn test_hybrid_crossover_averages_and_renormalizes() {
        let left = hybrid_parent(0.8, 0.2);
        let right = hybrid_parent(0.4, 0.6);
        let (child, _) = engine(2).crossover(&[&left, &right]).unwrap();
        if let DetectorSpec::Hybrid { weights } = &child.detector {
            assert!((weights["rule"] - 0.6).abs() < 1e-9);
            assert!((weights["model"] - 0.4).abs() < 1e-9);
        } else {
            panic!("expected hybrid child");
        }
    }

    #[test]
    fn test_model_crossover_unsupported() {
        let model = AntibodySpec {
            detector: DetectorSpec::Model {
                training_ref: "s3://corpus/v3".into(),
                features: BTreeMap::new(),
            },
            ..rule_parent()
        };
        let err = engine(1).crossover(&[&model, &model]).unwrap_err();
        assert_eq!(err.kind(), "unsupported_variant");
    }

    #[test]
    fn test_seed_for_offspring_varies_with_index() {
        let a = MutationEngine::seed_for_offspring("ab-g1-cafe-0", 0);
        let b = MutationEngine::seed_for_offspring("ab-g1-cafe-0", 1);
        assert_ne!(a, b);
        assert_eq!(a, MutationEngine::seed_for_offspring("ab-g1-cafe-0", 0));
    }
}
