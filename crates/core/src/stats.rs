//! Pure statistics used by the fitness evaluator: Wilson score bounds,
//! latency percentiles, and the ROC sweep. Everything here is a plain
//! function so it stays trivially testable.

use aswarm_shared::fitness::RocSummary;

/// z for a 95% two-sided interval. The evaluator uses 95% throughout;
/// the 90/99% constants exist for operator-tuned gates.
pub const Z_95: f64 = 1.959_963_984_540_054;
pub const Z_90: f64 = 1.644_853_626_951_472_2;
pub const Z_99: f64 = 2.575_829_303_548_900_4;

/// Wilson score interval for a binomial proportion. Robust for small n
/// and extreme p, which is exactly where the naive normal interval
/// falls apart. Zero trials return (0, 0).
#[must_use]
pub fn wilson_bounds(successes: u64, trials: u64, z: f64) -> (f64, f64) {
    if trials == 0 {
        return (0.0, 0.0);
    }
    let n = trials as f64;
    let p = successes as f64 / n;
    let z2 = z * z;
    let denom = 1.0 + z2 / n;
    let center = (p + z2 / (2.0 * n)) / denom;
    let half = (z / denom) * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt();
    ((center - half).max(0.0), (center + half).min(1.0))
}

/// p95 by the `ceil(0.95 * n) - 1` rank over an ascending sort.
/// Empty input returns 0.0.
#[must_use]
pub fn p95(values: &[f64]) -> f64 {
    percentile(values, 0.95)
}

#[must_use]
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// Sweep thresholds over (score, is_attack) samples and return the best
/// true-positive rate achievable while holding `fpr <= target_fpr`.
///
/// Ties in score are grouped: a threshold can only sit between distinct
/// score values, so all samples sharing a score flip together. When no
/// real threshold satisfies the FPR cap, the degenerate detect-nothing
/// point (threshold just above the top score) is returned. If either
/// class is empty the curve is undefined and the result is None.
#[must_use]
pub fn roc_at_fpr(samples: &[(f64, bool)], target_fpr: f64) -> Option<RocSummary> {
    let positives = samples.iter().filter(|(_, attack)| *attack).count();
    let negatives = samples.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let pos = positives as f64;
    let neg = negatives as f64;

    // Detect-nothing operating point: always admissible at fpr = 0.
    let mut best = RocSummary {
        threshold: sorted[0].0 + 1e-6,
        tpr: 0.0,
        fpr: 0.0,
    };

    let mut tp = 0u64;
    let mut fp = 0u64;
    let mut i = 0usize;
    while i < sorted.len() {
        let threshold = sorted[i].0;
        // Consume the whole tie group before emitting a point.
        while i < sorted.len() && sorted[i].0 == threshold {
            if sorted[i].1 {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        let tpr = tp as f64 / pos;
        let fpr = fp as f64 / neg;
        if fpr <= target_fpr
            && (tpr > best.tpr || (tpr == best.tpr && fpr < best.fpr))
        {
            best = RocSummary {
                threshold,
                tpr,
                fpr,
            };
        }
    }

    Some(best)
}
