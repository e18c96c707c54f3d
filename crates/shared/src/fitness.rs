//! Fitness summaries produced by combat evaluation, plus the aggregate
//! scoring used by parent selection and promotion gating.

use serde::{Deserialize, Serialize};

/// Operating point selected from the ROC sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocSummary {
    pub threshold: f64,
    pub tpr: f64,
    pub fpr: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitnessSummary {
    /// TPR on attack samples.
    pub detection_rate: f64,
    /// Latency statistics over attack samples only.
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    #[serde(default)]
    pub roc: Option<RocSummary>,
    /// Wilson 95% bounds on the detection rate.
    pub confidence_lower: f64,
    pub confidence_upper: f64,
    /// Cross-environment stability in [0, 1].
    pub stability_score: f64,
    pub sample_size: usize,
    pub avg_blast_radius: f64,
    pub containment_cost: f64,
    // Extended-form fields; when present, scoring switches to the
    // precision/recall form with safety decay.
    #[serde(default)]
    pub precision: Option<f64>,
    #[serde(default)]
    pub recall: Option<f64>,
    #[serde(default)]
    pub f1: Option<f64>,
    #[serde(default)]
    pub safety_violations: Option<u32>,
}

impl FitnessSummary {
    /// Promotion service-level objective: enough evidence, confident
    /// detection, and (when measured) a false-positive rate under the cap.
    #[must_use]
    pub fn meets_promotion_slo(&self, min_tpr_lb: f64, max_fpr_ub: f64) -> bool {
        if self.sample_size < 200 {
            return false;
        }
        if self.confidence_lower < min_tpr_lb {
            return false;
        }
        match &self.roc {
            Some(roc) => roc.fpr <= max_fpr_ub,
            None => true,
        }
    }

    /// Aggregate scalar fitness in [0, 1]. Uses the extended
    /// precision/recall form when those fields are present.
    #[must_use]
    pub fn overall_fitness(&self) -> f64 {
        match (self.precision, self.recall) {
            (Some(p), Some(r)) => self.extended_fitness(p, r),
            _ => self.base_fitness(),
        }
    }

    fn wilson_base(&self) -> f64 {
        // Wilson lower bound on detection; 0.5 when nothing is known yet.
        if self.sample_size == 0 {
            0.5
        } else {
            self.confidence_lower
        }
    }

    fn base_fitness(&self) -> f64 {
        let score = 0.5 * self.wilson_base()
            + 0.2 * self.stability_score
            + 0.2 * latency_band(self.p95_latency_ms)
            + 0.1 * ring_penalty(self.avg_blast_radius);
        score.clamp(0.0, 1.0)
    }

    fn extended_fitness(&self, precision: f64, recall: f64) -> f64 {
        let f1 = self.f1.unwrap_or_else(|| {
            if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            }
        });
        let violations = f64::from(self.safety_violations.unwrap_or(0));
        let score = 0.35 * self.wilson_base()
            + 0.25 * f1
            + 0.2 * self.stability_score
            + 0.1 * latency_band(self.p95_latency_ms)
            + 0.1 * ring_penalty(self.avg_blast_radius);
        (score * (-violations).exp()).clamp(0.0, 1.0)
    }
}

/// 1.0 at p95 <= 500ms, 0.0 at >= 2000ms, linear between.
#[must_use]
pub fn latency_band(p95_ms: f64) -> f64 {
    if p95_ms <= 500.0 {
        1.0
    } else if p95_ms >= 2000.0 {
        0.0
    } else {
        (2000.0 - p95_ms) / 1500.0
    }
}

/// Blast-radius penalty keyed on containment ring, ring 1 lightest.
#[must_use]
pub fn ring_penalty(avg_ring: f64) -> f64 {
    match avg_ring.round().clamp(1.0, 5.0) as u8 {
        1 => 1.0,
        2 => 0.9,
        3 => 0.7,
        4 => 0.5,
        _ => 0.3,
    }
}
