//! HyperLogLog++ coverage sketch with register-wise-max CRDT merge.
//!
//! Item hashing is salted SHA-256 with a salt derived by the caller
//! (the antibody's spec hash), so independently built sketches of the
//! same item space converge and merge across clusters. The wire layout
//! is bit-stable: `magic(4) | version(1) | precision(1) | salt_fp(8) |
//! registers(ceil(m*6/8))` with 6-bit big-endian packed registers.

use sha2::{Digest, Sha256};

use aswarm_shared::{SwarmError, SwarmResult};

pub const SKETCH_MAGIC: [u8; 4] = *b"ASKH";
pub const SKETCH_VERSION: u8 = 1;
pub const MIN_PRECISION: u8 = 4;
pub const MAX_PRECISION: u8 = 16;

/// Registers hold rho values up to 63; 6 bits on the wire.
const REGISTER_MAX: u8 = 63;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HllSketch {
    precision: u8,
    salt_fp: [u8; 8],
    salt: Option<Vec<u8>>,
    registers: Vec<u8>,
}

impl HllSketch {
    /// Build an empty sketch over the item space identified by `salt`.
    pub fn new(precision: u8, salt: &[u8]) -> SwarmResult<Self> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return Err(SwarmError::IncompatibleSketch(format!(
                "precision {} outside [{}, {}]",
                precision, MIN_PRECISION, MAX_PRECISION
            )));
        }
        Ok(Self {
            precision,
            salt_fp: salt_fingerprint(salt),
            salt: Some(salt.to_vec()),
            registers: vec![0u8; 1 << precision],
        })
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    pub fn salt_fingerprint(&self) -> [u8; 8] {
        self.salt_fp
    }

    #[must_use]
    pub fn register_count(&self) -> usize {
        self.registers.len()
    }

    /// Target standard error: 1.04 / sqrt(m).
    #[must_use]
    pub fn standard_error(&self) -> f64 {
        1.04 / (self.register_count() as f64).sqrt()
    }

    /// Insert one item. Decoded sketches carry only the salt
    /// fingerprint and cannot accept inserts.
    pub fn insert(&mut self, item: &[u8]) -> SwarmResult<()> {
        let Some(salt) = &self.salt else {
            return Err(SwarmError::IncompatibleSketch(
                "sketch was decoded from the wire and has no salt material".into(),
            ));
        };
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(item);
        let digest = hasher.finalize();
        let h = u64::from_be_bytes(digest[0..8].try_into().expect("8 bytes"));

        let p = u32::from(self.precision);
        let index = (h >> (64 - p)) as usize;
        let rest = h << p;
        let rho = if rest == 0 {
            64 - p + 1
        } else {
            rest.leading_zeros() + 1
        };
        let rho = (rho.min(u32::from(REGISTER_MAX))) as u8;
        if self.registers[index] < rho {
            self.registers[index] = rho;
        }
        Ok(())
    }

    /// Cardinality estimate with the standard small-range
    /// linear-counting correction.
    #[must_use]
    pub fn estimate(&self) -> f64 {
        let m = self.register_count() as f64;
        let alpha = match self.register_count() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            n => 0.7213 / (1.0 + 1.079 / n as f64),
        };
        let sum: f64 = self
            .registers
            .iter()
            .map(|r| 2f64.powi(-i32::from(*r)))
            .sum();
        let raw = alpha * m * m / sum;

        if raw <= 2.5 * m {
            let zeros = self.registers.iter().filter(|r| **r == 0).count();
            if zeros > 0 {
                return m * (m / zeros as f64).ln();
            }
        }
        raw
    }

    /// Register-wise max. Associative, commutative, idempotent;
    /// mismatched version/precision/salt is `incompatible_sketch`.
    pub fn merge(&mut self, other: &Self) -> SwarmResult<()> {
        if self.precision != other.precision {
            return Err(SwarmError::IncompatibleSketch(format!(
                "precision mismatch: {} vs {}",
                self.precision, other.precision
            )));
        }
        if self.salt_fp != other.salt_fp {
            return Err(SwarmError::IncompatibleSketch(
                "salt fingerprint mismatch".into(),
            ));
        }
        for (mine, theirs) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *mine < *theirs {
                *mine = *theirs;
            }
        }
        Ok(())
    }

    // ── Wire format ──

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14 + (self.registers.len() * 6).div_ceil(8));
        out.extend_from_slice(&SKETCH_MAGIC);
        out.push(SKETCH_VERSION);
        out.push(self.precision);
        out.extend_from_slice(&self.salt_fp);
        out.extend_from_slice(&pack_registers(&self.registers));
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> SwarmResult<Self> {
        if bytes.len() < 14 {
            return Err(SwarmError::CorruptSketch(format!(
                "sketch header truncated at {} bytes",
                bytes.len()
            )));
        }
        if bytes[0..4] != SKETCH_MAGIC {
            return Err(SwarmError::CorruptSketch("bad magic".into()));
        }
        let version = bytes[4];
        if version != SKETCH_VERSION {
            return Err(SwarmError::IncompatibleSketch(format!(
                "version {} (expected {})",
                version, SKETCH_VERSION
            )));
        }
        let precision = bytes[5];
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return Err(SwarmError::CorruptSketch(format!(
                "precision {} out of range",
                precision
            )));
        }
        let salt_fp: [u8; 8] = bytes[6..14].try_into().expect("8 bytes");
        let m = 1usize << precision;
        let body_len = (m * 6).div_ceil(8);
        let body = &bytes[14..];
        if body.len() != body_len {
            return Err(SwarmError::CorruptSketch(format!(
                "register body {} bytes, expected {}",
                body.len(),
                body_len
            )));
        }
        Ok(Self {
            precision,
            salt_fp,
            salt: None,
            registers: unpack_registers(body, m),
        })
    }
}

pub fn salt_fingerprint(salt: &[u8]) -> [u8; 8] {
    let digest = Sha256::digest(salt);
    digest[0..8].try_into().expect("8 bytes")
}

fn pack_registers(registers: &[u8]) -> Vec<u8> {
    let total_bits = registers.len() * 6;
    let mut out = vec![0u8; total_bits.div_ceil(8)];
    for (i, register) in registers.iter().enumerate() {
        let base = i * 6;
        for bit in 0..6 {
            if register & (1 << (5 - bit)) != 0 {
                let pos = base + bit;
                out[pos / 8] |= 1 << (7 - (pos % 8));
            }
        }
    }
    out
}

fn unpack_registers(bytes: &[u8], count: usize) -> Vec<u8> {
    let mut out = vec![0u8; count];
    for (i, register) in out.iter_mut().enumerate() {
        let base = i * 6;
        for bit in 0..6 {
            let pos = base + bit;
            if bytes[pos / 8] & (1 << (7 - (pos % 8))) != 0 {
                *register |= 1 << (5 - bit);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(precision: u8, salt: &[u8], range: std::ops::Range<usize>) -> HllSketch {
        let mut sketch = HllSketch::new(precision, salt).unwrap();
        for i in range {
            sketch.insert(format!("item-{}", i).as_bytes()).unwrap();
        }
        sketch
    }

    #[test]
    fn test_precision_bounds() {
        assert!(HllSketch::new(3, b"salt").is_err());
        assert!(HllSketch::new(17, b"salt").is_err());
        assert!(HllSketch::new(4, b"salt").is_ok());
        assert!(HllSketch::new(16, b"salt").is_ok());
    }

    #[test]
    fn test_estimate_within_standard_error() {
        // 10 independently salted trials; each must land within 3x the
        // 1.04/sqrt(m) target (a per-trial bound that holds with high
        // probability at p=14).
        let n = 10_000usize;
        for trial in 0..10 {
            let salt = format!("trial-{}", trial);
            let sketch = filled(14, salt.as_bytes(), 0..n);
            let estimate = sketch.estimate();
            let tolerance = 3.0 * sketch.standard_error() * n as f64;
            let error = (estimate - n as f64).abs();
            assert!(
                error <= tolerance,
                "trial {}: estimate {} off by {} (tolerance {})",
                trial,
                estimate,
                error,
                tolerance
            );
        }
    }

    #[test]
    fn test_small_range_linear_counting() {
        let sketch = filled(12, b"small", 0..100);
        let estimate = sketch.estimate();
        assert!((estimate - 100.0).abs() < 10.0, "estimate {}", estimate);
    }

    #[test]
    fn test_merge_is_commutative_associative_idempotent() {
        let a = filled(12, b"cov", 0..1000);
        let b = filled(12, b"cov", 1000..3000);
        let c = filled(12, b"cov", 3000..6000);

        let mut ab_c = a.clone();
        ab_c.merge(&b).unwrap();
        ab_c.merge(&c).unwrap();

        let mut c_ba = c.clone();
        c_ba.merge(&b).unwrap();
        c_ba.merge(&a).unwrap();

        assert_eq!(ab_c, c_ba);

        let mut idem = ab_c.clone();
        idem.merge(&b).unwrap();
        assert_eq!(idem, ab_c);
    }

    #[test]
    fn test_disjoint_merge_estimates_union() {
        // 10k + 20k + 30k disjoint items; any merge order lands within
        // 2% of 60k.
        let a = filled(14, b"union", 0..10_000);
        let b = filled(14, b"union", 10_000..30_000);
        let c = filled(14, b"union", 30_000..60_000);

        let mut forward = a.clone();
        forward.merge(&b).unwrap();
        forward.merge(&c).unwrap();

        let mut backward = c.clone();
        backward.merge(&a).unwrap();
        backward.merge(&b).unwrap();

        assert_eq!(forward.estimate(), backward.estimate());
        let estimate = forward.estimate();
        assert!(
            (estimate - 60_000.0).abs() / 60_000.0 < 0.02,
            "estimate {}",
            estimate
        );
    }

    #[test]
    fn test_merge_rejects_mismatches() {
        let mut a = filled(12, b"cov", 0..10);
        let b = filled(13, b"cov", 0..10);
        assert_eq!(
            a.merge(&b).unwrap_err().kind(),
            "incompatible_sketch"
        );
        let c = filled(12, b"other-salt", 0..10);
        assert_eq!(
            a.merge(&c).unwrap_err().kind(),
            "incompatible_sketch"
        );
    }

    #[test]
    fn test_wire_round_trip() {
        let sketch = filled(10, b"wire", 0..5000);
        let bytes = sketch.to_bytes();
        assert_eq!(&bytes[0..4], &SKETCH_MAGIC);
        let decoded = HllSketch::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.precision(), 10);
        assert_eq!(decoded.estimate(), sketch.estimate());
        let mut merged = sketch.clone();
        merged.merge(&decoded).unwrap();
        assert_eq!(merged.estimate(), sketch.estimate());
    }

    #[test]
    fn test_corrupt_and_incompatible_wire_forms() {
        let sketch = filled(10, b"wire", 0..100);
        let bytes = sketch.to_bytes();

        let truncated = &bytes[..bytes.len() - 3];
        assert_eq!(
            HllSketch::from_bytes(truncated).unwrap_err().kind(),
            "corrupt_sketch"
        );

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert_eq!(
            HllSketch::from_bytes(&bad_magic).unwrap_err().kind(),
            "corrupt_sketch"
        );

        let mut bad_version = bytes;
        bad_version[4] = 9;
        assert_eq!(
            HllSketch::from_bytes(&bad_version).unwrap_err().kind(),
            "incompatible_sketch"
        );
    }

    #[test]
    fn test_decoded_sketch_rejects_inserts() {
        let sketch = filled(10, b"wire", 0..10);
        let mut decoded = HllSketch::from_bytes(&sketch.to_bytes()).unwrap();
        assert!(decoded.insert(b"late item").is_err());
    }
}
