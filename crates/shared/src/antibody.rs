//! Antibody data model: immutable identity material, lineage, and
//! deployment state.
//!
//! An `AntibodySpec` is frozen at creation; everything the promotion
//! pipeline learns about it lives in `DeploymentState` and the fitness
//! records, never in the spec itself.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{SwarmError, SwarmResult};
use crate::signature::DiversitySignature;

/// Upper bound on a rule detector pattern, in characters.
pub const MAX_RULE_PATTERN_LEN: usize = 2048;

/// Tolerance for the hybrid weight sum around 1.0.
pub const HYBRID_WEIGHT_TOLERANCE: f64 = 1e-6;

// ============================================================
// Detector
// ============================================================

/// Supported model-feature value kinds. Anything else in the incoming
/// document (arrays, objects, null) fails deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Num(f64),
    Str(String),
}

impl FeatureValue {
    /// Canonical text form used for hashing and diversity tokens.
    /// Numbers use shortest-round-trip formatting.
    #[must_use]
    pub fn canonical_text(&self) -> String {
        match self {
            FeatureValue::Bool(b) => format!("b:{}", b),
            FeatureValue::Num(n) => format!("n:{}", n),
            FeatureValue::Str(s) => format!("s:{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "detector", rename_all = "snake_case")]
pub enum DetectorSpec {
    /// Pattern-matching rule with an engine hint and string features.
    Rule {
        pattern: String,
        engine: String,
        #[serde(default)]
        features: BTreeMap<String, String>,
    },
    /// Learned model referenced by its training-data artifact.
    Model {
        training_ref: String,
        #[serde(default)]
        features: BTreeMap<String, FeatureValue>,
    },
    /// Weighted blend of detectors; weights must sum to 1.0.
    Hybrid { weights: BTreeMap<String, f64> },
}

impl DetectorSpec {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DetectorSpec::Rule { .. } => "rule",
            DetectorSpec::Model { .. } => "model",
            DetectorSpec::Hybrid { .. } => "hybrid",
        }
    }
}

// ============================================================
// Scope / Lineage / Controls
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    /// Environments the antibody may deploy to. Never empty.
    pub environments: BTreeSet<String>,
    #[serde(default)]
    pub namespaces: Option<BTreeSet<String>>,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    /// Detection confidence threshold in [0, 1].
    pub confidence_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    #[serde(default)]
    pub parent_id: Option<String>,
    pub generation: u64,
    #[serde(default)]
    pub mutation_kind: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Controls {
    pub ttl_hours: u32,
    pub shadow_hours: u32,
    /// Containment level ceiling, 1 (lightest) to 5 (broadest).
    pub max_ring: u8,
    pub auto_promote: bool,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            ttl_hours: 168,
            shadow_hours: 24,
            max_ring: 3,
            auto_promote: false,
        }
    }
}

// ============================================================
// AntibodySpec
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntibodySpec {
    pub detector: DetectorSpec,
    pub scope: Scope,
    #[serde(default)]
    pub lineage: Option<Lineage>,
    #[serde(default)]
    pub controls: Controls,
}

impl AntibodySpec {
    /// Normalize user-supplied material before validation: rule patterns
    /// are trimmed, label keys are lowercased and trimmed.
    pub fn sanitize(&mut self) {
        if let DetectorSpec::Rule { pattern, .. } = &mut self.detector {
            *pattern = pattern.trim().to_string();
        }
        if let Some(labels) = self.scope.labels.take() {
            self.scope.labels = Some(
                labels
                    .into_iter()
                    .map(|(k, v)| (k.trim().to_lowercase(), v))
                    .collect(),
            );
        }
    }

    /// Structural and numerical validation. Every mutation output must
    /// pass this before it is admitted to a population.
    pub fn validate(&self) -> SwarmResult<()> {
        if self.scope.environments.is_empty() {
            return Err(SwarmError::InvalidSpec(
                "scope must name at least one environment".into(),
            ));
        }
        let threshold = self.scope.confidence_threshold;
        if !threshold.is_finite() {
            return Err(SwarmError::NumericalDegenerate(format!(
                "confidence_threshold is {}",
                threshold
            )));
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(SwarmError::InvalidSpec(format!(
                "confidence_threshold {} outside [0, 1]",
                threshold
            )));
        }

        match &self.detector {
            DetectorSpec::Rule { pattern, .. } => {
                if pattern.trim().is_empty() {
                    return Err(SwarmError::InvalidSpec("rule pattern is empty".into()));
                }
                if pattern.chars().count() > MAX_RULE_PATTERN_LEN {
                    return Err(SwarmError::InvalidSpec(format!(
                        "rule pattern exceeds {} characters",
                        MAX_RULE_PATTERN_LEN
                    )));
                }
            }
            DetectorSpec::Model { features, .. } => {
                for (name, value) in features {
                    if let FeatureValue::Num(n) = value {
                        if !n.is_finite() {
                            return Err(SwarmError::NumericalDegenerate(format!(
                                "model feature '{}' is {}",
                                name, n
                            )));
                        }
                    }
                }
            }
            DetectorSpec::Hybrid { weights } => {
                if weights.is_empty() {
                    return Err(SwarmError::UnsupportedVariant(
                        "hybrid detector without weights".into(),
                    ));
                }
                let mut sum = 0.0;
                for (name, w) in weights {
                    if !w.is_finite() {
                        return Err(SwarmError::NumericalDegenerate(format!(
                            "hybrid weight '{}' is {}",
                            name, w
                        )));
                    }
                    if *w < 0.0 {
                        return Err(SwarmError::InvalidSpec(format!(
                            "hybrid weight '{}' is negative ({})",
                            name, w
                        )));
                    }
                    sum += *w;
                }
                if (sum - 1.0).abs() > HYBRID_WEIGHT_TOLERANCE {
                    return Err(SwarmError::InvalidSpec(format!(
                        "hybrid weights sum to {} (expected 1.0)",
                        sum
                    )));
                }
            }
        }
        Ok(())
    }

    /// Deterministic SHA-256 identity over the canonical serialization.
    /// Equal specs hash equally across processes, platforms, and time.
    #[must_use]
    pub fn spec_hash(&self) -> String {
        crate::canonical::spec_hash(self)
    }

    /// Fresh diversity signature at the current signature version.
    #[must_use]
    pub fn diversity_signature(&self) -> DiversitySignature {
        DiversitySignature::compute(self)
    }
}

// ============================================================
// Variant identity
// ============================================================

/// Derive the deterministic variant id from the lineage tuple.
/// Parent ids are sorted so the id does not depend on argument order.
#[must_use]
pub fn variant_id(
    kind: &str,
    generation: u64,
    offspring_index: usize,
    parent_ids: &[String],
) -> String {
    let mut sorted: Vec<&String> = parent_ids.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(generation.to_be_bytes());
    hasher.update((offspring_index as u64).to_be_bytes());
    for parent in sorted {
        hasher.update((parent.len() as u32).to_be_bytes());
        hasher.update(parent.as_bytes());
    }
    let digest = hasher.finalize();
    format!(
        "ab-g{}-{}-{}",
        generation,
        hex_prefix(&digest, 8),
        offspring_index
    )
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

/// An antibody plus lineage metadata and a diversity signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntibodyVariant {
    pub id: String,
    pub spec_hash: String,
    pub parent_ids: Vec<String>,
    pub generation: u64,
    pub spec: AntibodySpec,
    pub proposed_by: String,
    pub created_at: DateTime<Utc>,
    pub diversity_signature: DiversitySignature,
}

// ============================================================
// Deployment state
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AntibodyPhase {
    Pending,
    Shadow,
    Staged,
    Canary,
    Active,
    Retired,
}

impl std::fmt::Display for AntibodyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Shadow => "shadow",
            Self::Staged => "staged",
            Self::Canary => "canary",
            Self::Active => "active",
            Self::Retired => "retired",
        };
        write!(f, "{}", s)
    }
}

impl AntibodyPhase {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Retired)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeploymentState {
    #[serde(default = "DeploymentState::default_phase")]
    pub phase: AntibodyPhase,
    pub shadow_start: Option<DateTime<Utc>>,
    pub promotion_eligible: Option<DateTime<Utc>>,
    pub last_promotion_time: Option<DateTime<Utc>>,
    /// Idempotency marker: the phase the last reconcile pass processed.
    pub current_reconcile_phase: Option<AntibodyPhase>,
    pub safety_violations: u32,
    pub deployed_clusters: Vec<String>,
}

impl Default for AntibodyPhase {
    fn default() -> Self {
        Self::Pending
    }
}

impl DeploymentState {
    fn default_phase() -> AntibodyPhase {
        AntibodyPhase::Pending
    }
}

// ============================================================
// Orchestrator condition surface
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Status condition written for the external orchestrator. The core only
/// produces these records; persisting them on the resource is the
/// orchestrator's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionRecord {
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition: DateTime<Utc>,
}
