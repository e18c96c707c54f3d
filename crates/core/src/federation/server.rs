//! Receiving side of the federation exchange: replay defense, rate
//! limiting, signature verification, and trust-scored quorum merge.
//!
//! Gate order on a share: rate bucket, timestamp skew, peer signature,
//! nonce freshness, sequence monotonicity, sketch decode, quorum. The
//! sequence check runs after signature verification so unauthenticated
//! traffic can never advance a sender's counter.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use lru::LruCache;
use tracing::{info, warn};

use aswarm_shared::{MetricsSink, SwarmError, SwarmResult};

use crate::config::EvolutionConfig;
use crate::db::{SwarmDataStore, FEDERATION_STORE_ID};

use super::auth::FederationVerifier;
use super::sketch::HllSketch;
use super::wire::{
    decode_enum, AntibodyPhaseCode, BlastRadiusCode, HealthAck, HealthReport, RequestSketch,
    ShareSketchRequest, ShareSketchResponse, SignatureTypeCode, SketchPayload,
};

const NONCE_LEN: usize = 16;
const NONCE_CACHE_CAPACITY: usize = 8192;

#[derive(Clone)]
pub struct FederationServerConfig {
    pub cluster_id: String,
    pub rate_limit_rpm: u32,
    pub max_skew_secs: i64,
    pub nonce_ttl: Duration,
    /// Distinct trusted peers that must attest a coverage space before
    /// it merges into local state.
    pub quorum: usize,
    /// Trust floor below which a peer's attestation does not count.
    pub min_trust: f64,
}

impl FederationServerConfig {
    #[must_use]
    pub fn from_config(config: &EvolutionConfig) -> Self {
        Self {
            cluster_id: config.cluster_id.clone(),
            rate_limit_rpm: config.federation_rate_limit_rpm,
            max_skew_secs: config.federation_max_skew_secs,
            nonce_ttl: Duration::from_secs(config.federation_nonce_ttl_secs),
            quorum: 2,
            min_trust: 0.5,
        }
    }
}

pub struct PeerProfile {
    pub verifier: FederationVerifier,
    pub trust_score: f64,
}

pub struct FederationServer {
    config: FederationServerConfig,
    peers: DashMap<String, PeerProfile>,
    store: Arc<dyn SwarmDataStore>,
    /// Fresh-nonce cache with TTL; bounded so a chatty peer cannot grow
    /// it without bound.
    nonces: Mutex<LruCache<Vec<u8>, Instant>>,
    /// Per-cluster minute-boundary token buckets.
    buckets: DashMap<String, (i64, u32)>,
    /// Attestations awaiting quorum, keyed by coverage fingerprint.
    pending: Mutex<HashMap<String, HashMap<String, HllSketch>>>,
    /// Quorum-approved merged coverage.
    merged: Mutex<HashMap<String, HllSketch>>,
    metrics: Arc<dyn MetricsSink>,
}

impl FederationServer {
    pub fn new(
        config: FederationServerConfig,
        store: Arc<dyn SwarmDataStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            peers: DashMap::new(),
            store,
            nonces: Mutex::new(LruCache::new(
                NonZeroUsize::new(NONCE_CACHE_CAPACITY).expect("nonzero"),
            )),
            buckets: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            merged: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn register_peer(&self, name: &str, profile: PeerProfile) {
        self.peers.insert(name.to_string(), profile);
    }

    pub fn set_trust(&self, name: &str, trust_score: f64) {
        if let Some(mut peer) = self.peers.get_mut(name) {
            peer.trust_score = trust_score.clamp(0.0, 1.0);
        }
    }

    /// RPC: accept (or reject) a signed coverage sketch.
    pub async fn share_sketch(&self, request: ShareSketchRequest) -> ShareSketchResponse {
        let peer = request.sender_cluster.clone();
        match self.handle_share(&request).await {
            Ok(()) => {
                self.metrics.incr(
                    "federation_shares_total",
                    &[("peer", &peer), ("outcome", "accepted")],
                );
                ShareSketchResponse::ok()
            }
            Err(e) => {
                self.metrics.incr(
                    "federation_shares_total",
                    &[("peer", &peer), ("outcome", e.kind())],
                );
                if matches!(e, SwarmError::Replay(_)) {
                    self.metrics
                        .incr("federation_replays_total", &[("peer", &peer)]);
                }
                warn!(peer, error = %e, "Rejected sketch share");
                ShareSketchResponse::rejected(&e)
            }
        }
    }

    async fn handle_share(&self, request: &ShareSketchRequest) -> SwarmResult<()> {
        let sender = &request.sender_cluster;
        self.check_rate(sender)?;
        self.check_skew(request.timestamp_unix)?;

        let (trust, verifier) = {
            let peer = self.peers.get(sender).ok_or_else(|| {
                SwarmError::SignatureInvalid(format!("unknown peer '{}'", sender))
            })?;
            (peer.trust_score, peer.verifier.clone())
        };

        let auth = request.auth.as_ref().ok_or_else(|| {
            SwarmError::SignatureInvalid("request carries no auth material".into())
        })?;
        verifier.verify(&request.sign_view(), auth)?;

        self.check_nonce(&request.nonce)?;
        self.check_sequence(sender, request.sequence_number).await?;

        let metadata = request.metadata.as_ref().ok_or_else(|| {
            SwarmError::CorruptSketch("share carries no metadata".into())
        })?;
        decode_enum::<AntibodyPhaseCode>(metadata.antibody_phase, "antibody_phase")?;
        decode_enum::<SignatureTypeCode>(metadata.signature_type, "signature_type")?;
        decode_enum::<BlastRadiusCode>(metadata.blast_radius, "blast_radius")?;

        let sketch = HllSketch::from_bytes(&request.sketch)?;
        self.attest(sender, trust, sketch);
        Ok(())
    }

    /// RPC: hand back the quorum-merged coverage for a space, if any.
    pub fn request_sketch(&self, request: &RequestSketch) -> SketchPayload {
        let merged = self.merged.lock().expect("merged map poisoned");
        match merged.get(&request.coverage_key) {
            Some(sketch) => SketchPayload {
                found: true,
                sketch: sketch.to_bytes(),
            },
            None => SketchPayload {
                found: false,
                sketch: Vec::new(),
            },
        }
    }

    /// RPC: peer liveness bookkeeping.
    pub async fn report_health(&self, report: HealthReport) -> HealthAck {
        let known = self.peers.contains_key(&report.cluster_id);
        if known {
            self.metrics.set_gauge(
                "federation_peer_active_antibodies",
                report.active_antibodies as f64,
                &[("peer", &report.cluster_id)],
            );
            if let Err(e) = self
                .store
                .set_json(
                    FEDERATION_STORE_ID,
                    &format!("health:{}", report.cluster_id),
                    serde_json::json!({
                        "healthy": report.healthy,
                        "active_antibodies": report.active_antibodies,
                        "timestamp_unix": report.timestamp_unix,
                    }),
                )
                .await
            {
                warn!(error = %e, "Failed to persist peer health");
            }
        }
        HealthAck {
            acknowledged: known,
        }
    }

    /// Quorum-merged coverage estimate for a space, if established.
    pub fn coverage_estimate(&self, coverage_key: &str) -> Option<f64> {
        self.merged
            .lock()
            .expect("merged map poisoned")
            .get(coverage_key)
            .map(HllSketch::estimate)
    }

    // ── Gates ──

    fn check_rate(&self, sender: &str) -> SwarmResult<()> {
        let minute = Utc::now().timestamp() / 60;
        let mut entry = self
            .buckets
            .entry(sender.to_string())
            .or_insert((minute, 0));
        // Bucket refills at the minute boundary, not continuously.
        if entry.0 != minute {
            *entry = (minute, 0);
        }
        if entry.1 >= self.config.rate_limit_rpm {
            return Err(SwarmError::RateLimited(format!(
                "{} exceeded {} requests/minute",
                sender, self.config.rate_limit_rpm
            )));
        }
        entry.1 += 1;
        Ok(())
    }

    fn check_skew(&self, timestamp_unix: i64) -> SwarmResult<()> {
        let skew = (Utc::now().timestamp() - timestamp_unix).abs();
        if skew > self.config.max_skew_secs {
            return Err(SwarmError::Replay(format!(
                "timestamp skew {}s exceeds {}s window",
                skew, self.config.max_skew_secs
            )));
        }
        Ok(())
    }

    fn check_nonce(&self, nonce: &[u8]) -> SwarmResult<()> {
        if nonce.len() != NONCE_LEN {
            return Err(SwarmError::SignatureInvalid(format!(
                "nonce is {} bytes, expected {}",
                nonce.len(),
                NONCE_LEN
            )));
        }
        let mut cache = self.nonces.lock().expect("nonce cache poisoned");
        if let Some(seen_at) = cache.get(&nonce.to_vec()) {
            if seen_at.elapsed() < self.config.nonce_ttl {
                return Err(SwarmError::Replay("nonce reused within TTL".into()));
            }
        }
        cache.put(nonce.to_vec(), Instant::now());
        Ok(())
    }

    async fn check_sequence(&self, sender: &str, sequence: u64) -> SwarmResult<()> {
        let key = format!("last_seq:{}", sender);
        let last = self
            .store
            .get_json(FEDERATION_STORE_ID, &key)
            .await
            .map_err(|e| SwarmError::Internal(format!("sequence lookup: {}", e)))?
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if sequence <= last {
            return Err(SwarmError::Replay(format!(
                "duplicate (sender, sequence): ({}, {}) <= {}",
                sender, sequence, last
            )));
        }
        self.store
            .set_json(FEDERATION_STORE_ID, &key, serde_json::json!(sequence))
            .await
            .map_err(|e| SwarmError::Internal(format!("sequence store: {}", e)))?;
        Ok(())
    }

    fn attest(&self, sender: &str, trust: f64, sketch: HllSketch) {
        let coverage_key = hex::encode(sketch.salt_fingerprint());
        if trust < self.config.min_trust {
            info!(
                peer = sender,
                trust, coverage_key, "Attestation recorded but below trust floor"
            );
            return;
        }

        let mut pending = self.pending.lock().expect("pending map poisoned");
        let attesters = pending.entry(coverage_key.clone()).or_default();
        attesters.insert(sender.to_string(), sketch);

        if attesters.len() >= self.config.quorum {
            let mut merged = self.merged.lock().expect("merged map poisoned");
            for sketch in attesters.values() {
                match merged.get_mut(&coverage_key) {
                    Some(local) => {
                        if let Err(e) = local.merge(sketch) {
                            warn!(coverage_key, error = %e, "Skipping incompatible attestation");
                        }
                    }
                    None => {
                        merged.insert(coverage_key.clone(), sketch.clone());
                    }
                }
            }
            info!(
                coverage_key,
                attesters = attesters.len(),
                "Quorum reached, merged coverage into local state"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_db, SqliteStore};
    use crate::federation::auth::FederationKey;
    use crate::federation::wire::{FederationErrorCode, SketchMetadata};
    use aswarm_shared::AtomicMetrics;
    use sqlx::SqlitePool;

    async fn store() -> Arc<SqliteStore> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_db(&pool).await.unwrap();
        Arc::new(SqliteStore::new(pool))
    }

    fn server_config() -> FederationServerConfig {
        FederationServerConfig {
            cluster_id: "cluster-local".into(),
            rate_limit_rpm: 600,
            max_skew_secs: 300,
            nonce_ttl: Duration::from_secs(600),
            quorum: 2,
            min_trust: 0.5,
        }
    }

    struct Fixture {
        server: FederationServer,
        key: FederationKey,
        metrics: Arc<AtomicMetrics>,
    }

    async fn fixture() -> Fixture {
        let metrics = AtomicMetrics::new();
        let server = FederationServer::new(server_config(), store().await, metrics.clone());
        let key = FederationKey::ed25519_from_bytes(&[3u8; 32]);
        server.register_peer(
            "cluster-a",
            PeerProfile {
                verifier: key.verifier(),
                trust_score: 0.9,
            },
        );
        Fixture {
            server,
            key,
            metrics,
        }
    }

    fn coverage_sketch(items: usize) -> HllSketch {
        let mut sketch = HllSketch::new(12, b"coverage-space").unwrap();
        for i in 0..items {
            sketch.insert(format!("ip-{}", i).as_bytes()).unwrap();
        }
        sketch
    }

    fn signed_request(
        key: &FederationKey,
        sequence: u64,
        nonce: [u8; 16],
        sketch: &HllSketch,
    ) -> ShareSketchRequest {
        let mut request = ShareSketchRequest {
            sender_cluster: "cluster-a".into(),
            sketch: sketch.to_bytes(),
            metadata: Some(SketchMetadata {
                cluster_id: "cluster-a".into(),
                antibody_phase: AntibodyPhaseCode::Active as i32,
                signature_type: SignatureTypeCode::Ed25519 as i32,
                blast_radius: BlastRadiusCode::Ring1 as i32,
                cardinality_estimate: sketch.estimate(),
                created_at_unix: Utc::now().timestamp(),
                confidence_level: 0.9,
            }),
            sequence_number: sequence,
            nonce: nonce.to_vec(),
            timestamp_unix: Utc::now().timestamp(),
            auth: None,
        };
        request.auth = Some(key.sign(&request.sign_view()).unwrap());
        request
    }

    #[tokio::test]
    async fn test_share_accepts_valid_request() {
        let f = fixture().await;
        let response = f
            .server
            .share_sketch(signed_request(&f.key, 1, [1u8; 16], &coverage_sketch(100)))
            .await;
        assert!(response.accepted, "{}", response.message);
    }

    #[tokio::test]
    async fn test_identical_resend_is_replay() {
        let f = fixture().await;
        let request = signed_request(&f.key, 42, [7u8; 16], &coverage_sketch(100));
        assert!(f.server.share_sketch(request.clone()).await.accepted);

        let second = f.server.share_sketch(request).await;
        assert!(!second.accepted);
        assert_eq!(second.error_code, FederationErrorCode::Replay as i32);
        assert_eq!(
            f.metrics
                .counter("federation_replays_total", &[("peer", "cluster-a")]),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicate_sequence_with_fresh_nonce_is_replay() {
        let f = fixture().await;
        assert!(
            f.server
                .share_sketch(signed_request(&f.key, 42, [1u8; 16], &coverage_sketch(10)))
                .await
                .accepted
        );
        let response = f
            .server
            .share_sketch(signed_request(&f.key, 42, [2u8; 16], &coverage_sketch(10)))
            .await;
        assert_eq!(response.error_code, FederationErrorCode::Replay as i32);
    }

    #[tokio::test]
    async fn test_tampered_payload_fails_signature() {
        let f = fixture().await;
        let mut request = signed_request(&f.key, 1, [1u8; 16], &coverage_sketch(10));
        request.sequence_number = 2;
        let response = f.server.share_sketch(request).await;
        assert_eq!(
            response.error_code,
            FederationErrorCode::SignatureInvalid as i32
        );
    }

    #[tokio::test]
    async fn test_unknown_peer_rejected() {
        let f = fixture().await;
        let rogue = FederationKey::ed25519_from_bytes(&[9u8; 32]);
        let mut request = signed_request(&rogue, 1, [1u8; 16], &coverage_sketch(10));
        request.sender_cluster = "cluster-unknown".into();
        request.auth = Some(rogue.sign(&request.sign_view()).unwrap());
        let response = f.server.share_sketch(request).await;
        assert!(!response.accepted);
    }

    #[tokio::test]
    async fn test_rate_limit_refills_at_minute_boundary_only() {
        let metrics = AtomicMetrics::new();
        let mut config = server_config();
        config.rate_limit_rpm = 2;
        let server = FederationServer::new(config, store().await, metrics);
        let key = FederationKey::ed25519_from_bytes(&[3u8; 32]);
        server.register_peer(
            "cluster-a",
            PeerProfile {
                verifier: key.verifier(),
                trust_score: 0.9,
            },
        );
        let sketch = coverage_sketch(10);
        assert!(server
            .share_sketch(signed_request(&key, 1, [1u8; 16], &sketch))
            .await
            .accepted);
        assert!(server
            .share_sketch(signed_request(&key, 2, [2u8; 16], &sketch))
            .await
            .accepted);
        let third = server
            .share_sketch(signed_request(&key, 3, [3u8; 16], &sketch))
            .await;
        assert_eq!(third.error_code, FederationErrorCode::RateLimited as i32);
    }

    #[tokio::test]
    async fn test_stale_timestamp_rejected() {
        let f = fixture().await;
        let mut request = signed_request(&f.key, 1, [1u8; 16], &coverage_sketch(10));
        request.timestamp_unix = Utc::now().timestamp() - 10_000;
        request.auth = Some(f.key.sign(&request.sign_view()).unwrap());
        let response = f.server.share_sketch(request).await;
        assert_eq!(response.error_code, FederationErrorCode::Replay as i32);
    }

    #[tokio::test]
    async fn test_corrupt_sketch_rejected() {
        let f = fixture().await;
        let mut request = signed_request(&f.key, 1, [1u8; 16], &coverage_sketch(10));
        request.sketch.truncate(5);
        request.auth = Some(f.key.sign(&request.sign_view()).unwrap());
        let response = f.server.share_sketch(request).await;
        assert_eq!(
            response.error_code,
            FederationErrorCode::CorruptSketch as i32
        );
    }

    #[tokio::test]
    async fn test_quorum_required_before_merge() {
        let f = fixture().await;
        let key_b = FederationKey::ed25519_from_bytes(&[4u8; 32]);
        f.server.register_peer(
            "cluster-b",
            PeerProfile {
                verifier: key_b.verifier(),
                trust_score: 0.8,
            },
        );

        let sketch = coverage_sketch(500);
        let coverage_key = hex::encode(sketch.salt_fingerprint());

        assert!(
            f.server
                .share_sketch(signed_request(&f.key, 1, [1u8; 16], &sketch))
                .await
                .accepted
        );
        // One attestation: not merged yet.
        assert!(f.server.coverage_estimate(&coverage_key).is_none());

        let mut from_b = signed_request(&key_b, 1, [2u8; 16], &sketch);
        from_b.sender_cluster = "cluster-b".into();
        if let Some(meta) = from_b.metadata.as_mut() {
            meta.cluster_id = "cluster-b".into();
        }
        from_b.auth = Some(key_b.sign(&from_b.sign_view()).unwrap());
        assert!(f.server.share_sketch(from_b).await.accepted);

        let estimate = f.server.coverage_estimate(&coverage_key).unwrap();
        assert!((estimate - 500.0).abs() / 500.0 < 0.1, "estimate {}", estimate);
    }

    #[tokio::test]
    async fn test_low_trust_peer_does_not_count_toward_quorum() {
        let f = fixture().await;
        f.server.set_trust("cluster-a", 0.2);
        let sketch = coverage_sketch(100);
        let coverage_key = hex::encode(sketch.salt_fingerprint());
        assert!(
            f.server
                .share_sketch(signed_request(&f.key, 1, [1u8; 16], &sketch))
                .await
                .accepted
        );
        assert!(
            f.server
                .share_sketch(signed_request(&f.key, 2, [2u8; 16], &sketch))
                .await
                .accepted
        );
        assert!(f.server.coverage_estimate(&coverage_key).is_none());
    }

    #[tokio::test]
    async fn test_health_report_ack() {
        let f = fixture().await;
        let ack = f
            .server
            .report_health(HealthReport {
                cluster_id: "cluster-a".into(),
                healthy: true,
                active_antibodies: 12,
                timestamp_unix: Utc::now().timestamp(),
            })
            .await;
        assert!(ack.acknowledged);
        let unknown = f
            .server
            .report_health(HealthReport {
                cluster_id: "cluster-x".into(),
                healthy: true,
                active_antibodies: 0,
                timestamp_unix: Utc::now().timestamp(),
            })
            .await;
        assert!(!unknown.acknowledged);
    }
}
