//! Protobuf wire contract for the federation RPC surface.
//!
//! Messages are hand-derived prost structs so the binary layout matches
//! the published schema without build-time codegen. Enumerations are
//! closed sets; unknown discriminants are rejected at decode time. The
//! sign view of a request is its prost encoding with the auth oneof
//! cleared.

use prost::Message;

use aswarm_shared::{AntibodyPhase, SwarmError, SwarmResult};

// ============================================================
// Enumerations (closed sets)
// ============================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum AntibodyPhaseCode {
    PhaseUnspecified = 0,
    Pending = 1,
    Shadow = 2,
    Staged = 3,
    Canary = 4,
    Active = 5,
    Retired = 6,
}

impl From<AntibodyPhase> for AntibodyPhaseCode {
    fn from(phase: AntibodyPhase) -> Self {
        match phase {
            AntibodyPhase::Pending => Self::Pending,
            AntibodyPhase::Shadow => Self::Shadow,
            AntibodyPhase::Staged => Self::Staged,
            AntibodyPhase::Canary => Self::Canary,
            AntibodyPhase::Active => Self::Active,
            AntibodyPhase::Retired => Self::Retired,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SignatureTypeCode {
    SignatureUnspecified = 0,
    Ed25519 = 1,
    HmacSha256 = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum BlastRadiusCode {
    RadiusUnspecified = 0,
    Ring1 = 1,
    Ring2 = 2,
    Ring3 = 3,
    Ring4 = 4,
    Ring5 = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FederationErrorCode {
    ErrorNone = 0,
    Replay = 1,
    RateLimited = 2,
    SignatureInvalid = 3,
    IncompatibleSketch = 4,
    CorruptSketch = 5,
    PeerUnreachable = 6,
    Internal = 7,
}

impl FederationErrorCode {
    /// Map a core error onto the closed wire code set.
    #[must_use]
    pub fn from_error(error: &SwarmError) -> Self {
        match error {
            SwarmError::Replay(_) => Self::Replay,
            SwarmError::RateLimited(_) => Self::RateLimited,
            SwarmError::SignatureInvalid(_) => Self::SignatureInvalid,
            SwarmError::IncompatibleSketch(_) | SwarmError::IncompatibleSignature { .. } => {
                Self::IncompatibleSketch
            }
            SwarmError::CorruptSketch(_) => Self::CorruptSketch,
            SwarmError::PeerUnreachable(_) => Self::PeerUnreachable,
            _ => Self::Internal,
        }
    }
}

/// Decode a raw enum field, rejecting values outside the closed set.
pub fn decode_enum<E: TryFrom<i32>>(raw: i32, what: &str) -> SwarmResult<E> {
    E::try_from(raw).map_err(|_| {
        SwarmError::CorruptSketch(format!("unknown {} discriminant {}", what, raw))
    })
}

// ============================================================
// Messages
// ============================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct SketchMetadata {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    #[prost(enumeration = "AntibodyPhaseCode", tag = "2")]
    pub antibody_phase: i32,
    #[prost(enumeration = "SignatureTypeCode", tag = "3")]
    pub signature_type: i32,
    #[prost(enumeration = "BlastRadiusCode", tag = "4")]
    pub blast_radius: i32,
    #[prost(double, tag = "5")]
    pub cardinality_estimate: f64,
    #[prost(int64, tag = "6")]
    pub created_at_unix: i64,
    #[prost(double, tag = "7")]
    pub confidence_level: f64,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Auth {
    #[prost(bytes, tag = "7")]
    Ed25519(Vec<u8>),
    #[prost(bytes, tag = "8")]
    HmacSha256(Vec<u8>),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ShareSketchRequest {
    #[prost(string, tag = "1")]
    pub sender_cluster: String,
    #[prost(bytes = "vec", tag = "2")]
    pub sketch: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub metadata: Option<SketchMetadata>,
    /// Anti-replay fields are part of the signed view.
    #[prost(uint64, tag = "4")]
    pub sequence_number: u64,
    #[prost(bytes = "vec", tag = "5")]
    pub nonce: Vec<u8>,
    #[prost(int64, tag = "6")]
    pub timestamp_unix: i64,
    #[prost(oneof = "Auth", tags = "7, 8")]
    pub auth: Option<Auth>,
}

impl ShareSketchRequest {
    /// Canonical bytes that signatures cover: the encoded request with
    /// the auth oneof cleared.
    #[must_use]
    pub fn sign_view(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.auth = None;
        unsigned.encode_to_vec()
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ShareSketchResponse {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    #[prost(enumeration = "FederationErrorCode", tag = "2")]
    pub error_code: i32,
    #[prost(string, tag = "3")]
    pub message: String,
}

impl ShareSketchResponse {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            accepted: true,
            error_code: FederationErrorCode::ErrorNone as i32,
            message: String::new(),
        }
    }

    #[must_use]
    pub fn rejected(error: &SwarmError) -> Self {
        Self {
            accepted: false,
            error_code: FederationErrorCode::from_error(error) as i32,
            message: error.to_string(),
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestSketch {
    #[prost(string, tag = "1")]
    pub sender_cluster: String,
    /// Hex salt fingerprint of the coverage space being requested.
    #[prost(string, tag = "2")]
    pub coverage_key: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SketchPayload {
    #[prost(bool, tag = "1")]
    pub found: bool,
    #[prost(bytes = "vec", tag = "2")]
    pub sketch: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthReport {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    #[prost(bool, tag = "2")]
    pub healthy: bool,
    #[prost(uint64, tag = "3")]
    pub active_antibodies: u64,
    #[prost(int64, tag = "4")]
    pub timestamp_unix: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthAck {
    #[prost(bool, tag = "1")]
    pub acknowledged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ShareSketchRequest {
        ShareSketchRequest {
            sender_cluster: "cluster-a".into(),
            sketch: vec![1, 2, 3],
            metadata: Some(SketchMetadata {
                cluster_id: "cluster-a".into(),
                antibody_phase: AntibodyPhaseCode::Active as i32,
                signature_type: SignatureTypeCode::Ed25519 as i32,
                blast_radius: BlastRadiusCode::Ring1 as i32,
                cardinality_estimate: 1234.5,
                created_at_unix: 1_700_000_000,
                confidence_level: 0.92,
            }),
            sequence_number: 42,
            nonce: vec![0u8; 16],
            timestamp_unix: 1_700_000_100,
            auth: Some(Auth::Ed25519(vec![9u8; 64])),
        }
    }

    #[test]
    fn test_sign_view_excludes_auth_only() {
        let signed = request();
        let mut resigned = signed.clone();
        resigned.auth = Some(Auth::HmacSha256(vec![1u8; 32]));
        // Different auth material, identical sign view.
        assert_eq!(signed.sign_view(), resigned.sign_view());

        let mut tampered = signed.clone();
        tampered.sequence_number = 43;
        assert_ne!(signed.sign_view(), tampered.sign_view());
    }

    #[test]
    fn test_round_trip_encoding() {
        let req = request();
        let bytes = req.encode_to_vec();
        let back = ShareSketchRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn test_unknown_enum_discriminant_rejected() {
        let ok: SwarmResult<AntibodyPhaseCode> = decode_enum(5, "antibody_phase");
        assert_eq!(ok.unwrap(), AntibodyPhaseCode::Active);
        let err: SwarmResult<AntibodyPhaseCode> = decode_enum(99, "antibody_phase");
        assert!(err.is_err());
    }

    #[test]
    fn test_phase_code_mapping() {
        assert_eq!(
            AntibodyPhaseCode::from(AntibodyPhase::Active),
            AntibodyPhaseCode::Active
        );
        assert_eq!(
            AntibodyPhaseCode::from(AntibodyPhase::Retired),
            AntibodyPhaseCode::Retired
        );
    }
}
