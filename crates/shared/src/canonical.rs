//! Canonical serialization for spec hashing.
//!
//! The byte layout is the identity contract: equal specs must produce
//! equal hashes across processes, platforms, and time. Every atom is
//! length-prefixed (u32 big-endian) so no delimiter collision is
//! possible; maps emit sorted keys, sets sorted elements, tagged unions
//! their discriminant first, and floats the shortest round-trip decimal.

use sha2::{Digest, Sha256};

use crate::antibody::{AntibodySpec, DetectorSpec};

const CANONICAL_HEADER: &str = "aswarm/antibody-spec/v1";

struct CanonicalWriter {
    buf: Vec<u8>,
}

impl CanonicalWriter {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
        }
    }

    fn atom(&mut self, bytes: &[u8]) {
        self.buf.extend((bytes.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(bytes);
    }

    fn text(&mut self, s: &str) {
        self.atom(s.as_bytes());
    }

    /// Rust's `{}` formatting for f64 is the shortest decimal that
    /// round-trips, which is exactly the canonical form we need.
    fn float(&mut self, v: f64) {
        self.text(&format!("{}", v));
    }

    fn uint(&mut self, v: u64) {
        self.atom(&v.to_be_bytes());
    }

    fn int(&mut self, v: i64) {
        self.atom(&v.to_be_bytes());
    }

    fn flag(&mut self, v: bool) {
        self.atom(&[u8::from(v)]);
    }
}

/// Canonical byte serialization of a spec. Exposed for tests; callers
/// normally want [`spec_hash`].
#[must_use]
pub fn canonical_bytes(spec: &AntibodySpec) -> Vec<u8> {
    let mut w = CanonicalWriter::new();
    w.text(CANONICAL_HEADER);

    // Tagged union: discriminant first.
    match &spec.detector {
        DetectorSpec::Rule {
            pattern,
            engine,
            features,
        } => {
            w.text("rule");
            w.text(pattern);
            w.text(engine);
            w.uint(features.len() as u64);
            for (k, v) in features {
                w.text(k);
                w.text(v);
            }
        }
        DetectorSpec::Model {
            training_ref,
            features,
        } => {
            w.text("model");
            w.text(training_ref);
            w.uint(features.len() as u64);
            for (k, v) in features {
                w.text(k);
                w.text(&v.canonical_text());
            }
        }
        DetectorSpec::Hybrid { weights } => {
            w.text("hybrid");
            w.uint(weights.len() as u64);
            for (k, weight) in weights {
                w.text(k);
                w.float(*weight);
            }
        }
    }

    w.uint(spec.scope.environments.len() as u64);
    for env in &spec.scope.environments {
        w.text(env);
    }
    w.flag(spec.scope.namespaces.is_some());
    if let Some(namespaces) = &spec.scope.namespaces {
        w.uint(namespaces.len() as u64);
        for ns in namespaces {
            w.text(ns);
        }
    }
    w.flag(spec.scope.labels.is_some());
    if let Some(labels) = &spec.scope.labels {
        w.uint(labels.len() as u64);
        for (k, v) in labels {
            w.text(k);
            w.text(v);
        }
    }
    w.float(spec.scope.confidence_threshold);

    w.flag(spec.lineage.is_some());
    if let Some(lineage) = &spec.lineage {
        w.flag(lineage.parent_id.is_some());
        if let Some(parent) = &lineage.parent_id {
            w.text(parent);
        }
        w.uint(lineage.generation);
        w.flag(lineage.mutation_kind.is_some());
        if let Some(kind) = &lineage.mutation_kind {
            w.text(kind);
        }
        w.text(&lineage.created_by);
        w.int(lineage.created_at.timestamp_micros());
    }

    w.uint(u64::from(spec.controls.ttl_hours));
    w.uint(u64::from(spec.controls.shadow_hours));
    w.uint(u64::from(spec.controls.max_ring));
    w.flag(spec.controls.auto_promote);

    w.buf
}

/// SHA-256 hex digest of the canonical serialization.
#[must_use]
pub fn spec_hash(spec: &AntibodySpec) -> String {
    let digest = Sha256::digest(canonical_bytes(spec));
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
