//! Versioned diversity signatures.
//!
//! A signature is a 512-bit set built by feature-hashing the attributes
//! of a spec. Two signatures of the same version are comparable via
//! bitwise Jaccard similarity; different versions are incomparable and
//! comparing them is a hard error, never a silent 0.0.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::antibody::{AntibodySpec, DetectorSpec};
use crate::error::{SwarmError, SwarmResult};

pub const SIGNATURE_VERSION: u8 = 1;
pub const SIGNATURE_BITS: usize = 512;

/// Domain salt for feature hashing. Changing it is a version bump.
const DOMAIN_SALT: &[u8] = b"aswarm-diversity-v1\0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiversitySignature {
    version: u8,
    bits: [u8; SIGNATURE_BITS / 8],
}

impl DiversitySignature {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: SIGNATURE_VERSION,
            bits: [0u8; SIGNATURE_BITS / 8],
        }
    }

    /// Feature-hash a spec into a fresh signature.
    #[must_use]
    pub fn compute(spec: &AntibodySpec) -> Self {
        let mut sig = Self::empty();
        sig.set_token(&format!("detector:{}", spec.detector.kind()));

        match &spec.detector {
            DetectorSpec::Rule { features, .. } => {
                for (k, v) in features {
                    sig.set_token(&format!("rule_feature:{}={}", k, v));
                }
            }
            DetectorSpec::Model { features, .. } => {
                for (k, v) in features {
                    sig.set_token(&format!("model_feature:{}={}", k, v.canonical_text()));
                }
            }
            DetectorSpec::Hybrid { weights } => {
                for (k, w) in weights {
                    sig.set_token(&format!("hybrid_weight:{}={:.3}", k, w));
                }
            }
        }

        sig.set_token(&format!(
            "threshold={:.2}",
            spec.scope.confidence_threshold
        ));
        sig
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    fn set_token(&mut self, token: &str) {
        let mut hasher = Sha256::new();
        hasher.update(DOMAIN_SALT);
        hasher.update(token.as_bytes());
        let h = hasher.finalize();
        let index = ((usize::from(h[0]) << 8) | usize::from(h[1])) % SIGNATURE_BITS;
        self.bits[index / 8] |= 1 << (index % 8);
    }

    #[must_use]
    pub fn count_ones(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    /// Bitwise Jaccard similarity in [0, 1]. Two empty signatures are
    /// identical, hence 1.0. Version mismatch fails loudly.
    pub fn jaccard(&self, other: &Self) -> SwarmResult<f64> {
        if self.version != other.version {
            return Err(SwarmError::IncompatibleSignature {
                ours: self.version,
                theirs: other.version,
            });
        }
        let mut intersection = 0u32;
        let mut union = 0u32;
        for (a, b) in self.bits.iter().zip(other.bits.iter()) {
            intersection += (a & b).count_ones();
            union += (a | b).count_ones();
        }
        if union == 0 {
            return Ok(1.0);
        }
        Ok(f64::from(intersection) / f64::from(union))
    }
}

impl std::fmt::Display for DiversitySignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}:{}", self.version, BASE64.encode(self.bits))
    }
}

impl std::str::FromStr for DiversitySignature {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SwarmError::InvalidSpec(format!("malformed diversity signature '{}'", s));
        let rest = s.strip_prefix('v').ok_or_else(malformed)?;
        let (version_text, b64) = rest.split_once(':').ok_or_else(malformed)?;
        let version: u8 = version_text.parse().map_err(|_| malformed())?;
        let raw = BASE64.decode(b64).map_err(|_| malformed())?;
        let bits: [u8; SIGNATURE_BITS / 8] = raw.try_into().map_err(|_| malformed())?;
        Ok(Self { version, bits })
    }
}

// Serialized as the compact text form so signatures stay readable in
// snapshots and WAL lines.
impl serde::Serialize for DiversitySignature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for DiversitySignature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::antibody::{Controls, Scope};
    use std::collections::{BTreeMap, BTreeSet};

    fn spec(features: &[(&str, &str)], threshold: f64) -> AntibodySpec {
        AntibodySpec {
            detector: DetectorSpec::Rule {
                pattern: "p".into(),
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
                confidence_threshold: threshold,
            },
            lineage: None,
            controls: Controls::default(),
        }
    }

    #[test]
    fn test_identical_specs_identical_signatures() {
        let a = DiversitySignature::compute(&spec(&[("x", "1"), ("y", "0")], 0.8));
        let b = DiversitySignature::compute(&spec(&[("y", "0"), ("x", "1")], 0.8));
        assert_eq!(a, b);
        assert!((a.jaccard(&b).unwrap() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_disjoint_feature_sets_diverge() {
        let a = DiversitySignature::compute(&spec(
            &[("alpha", "1"), ("beta", "1"), ("gamma", "1")],
            0.2,
        ));
        let b = DiversitySignature::compute(&spec(
            &[("delta", "1"), ("epsilon", "1"), ("zeta", "1")],
            0.9,
        ));
        let sim = a.jaccard(&b).unwrap();
        assert!(sim < 0.5, "disjoint specs should be dissimilar, got {}", sim);
    }

    #[test]
    fn test_version_mismatch_fails_loudly() {
        let a = DiversitySignature::compute(&spec(&[("x", "1")], 0.8));
        let mut b = a.clone();
        b.version = 2;
        let err = a.jaccard(&b).unwrap_err();
        assert_eq!(err.kind(), "incompatible_signature");
    }

    #[test]
    fn test_text_round_trip() {
        let a = DiversitySignature::compute(&spec(&[("x", "1")], 0.8));
        let text = a.to_string();
        assert!(text.starts_with("v1:"));
        let back: DiversitySignature = text.parse().unwrap();
        assert_eq!(a, back);
    }

    #[test]
    fn test_threshold_quantization_buckets() {
        // 0.801 and 0.804 quantize to the same 2-decimal bucket.
        let a = DiversitySignature::compute(&spec(&[], 0.801));
        let b = DiversitySignature::compute(&spec(&[], 0.804));
        assert_eq!(a, b);
        let c = DiversitySignature::compute(&spec(&[], 0.85));
        assert_ne!(a, c);
    }
}
