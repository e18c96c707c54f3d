//! Sending side of the federation exchange.
//!
//! Broadcasts fan out to every configured peer with bounded concurrency
//! and per-peer timeouts. Retries are additive with full jitter and
//! reuse the original (sequence, nonce) pair, which makes redelivery
//! idempotent: a peer that already processed the share answers
//! `replay`, and a replay on a retry counts as success.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use aswarm_shared::{AntibodyVariant, FitnessSummary, MetricsSink, SwarmError, SwarmResult};

use crate::config::EvolutionConfig;
use crate::db::{SwarmDataStore, FEDERATION_STORE_ID};

use super::auth::FederationKey;
use super::sketch::HllSketch;
use super::wire::{
    AntibodyPhaseCode, Auth, BlastRadiusCode, FederationErrorCode, ShareSketchRequest,
    ShareSketchResponse, SignatureTypeCode, SketchMetadata,
};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BROADCAST_CONCURRENCY: usize = 4;
const SKETCH_PRECISION: u8 = 12;

/// Transport seam: in-process loopback in tests, the RPC stack in
/// deployment. The wire payload is the prost-encoded request either way.
#[async_trait]
pub trait FederationTransport: Send + Sync {
    async fn share_sketch(
        &self,
        peer: &str,
        request: ShareSketchRequest,
    ) -> SwarmResult<ShareSketchResponse>;
}

/// Per-peer outcome of one broadcast; errors never fail the whole call.
#[derive(Debug)]
pub struct BroadcastReport {
    pub results: Vec<(String, SwarmResult<()>)>,
}

impl BroadcastReport {
    #[must_use]
    pub fn successes(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }

    #[must_use]
    pub fn failures(&self) -> usize {
        self.results.len() - self.successes()
    }
}

pub struct FederationClient {
    cluster_id: String,
    key: Arc<FederationKey>,
    transport: Arc<dyn FederationTransport>,
    peers: Vec<String>,
    store: Arc<dyn SwarmDataStore>,
    concurrency: Arc<Semaphore>,
    rpc_timeout: Duration,
    allow_opaque_sketch: bool,
    metrics: Arc<dyn MetricsSink>,
}

impl FederationClient {
    pub fn new(
        config: &EvolutionConfig,
        key: FederationKey,
        transport: Arc<dyn FederationTransport>,
        peers: Vec<String>,
        store: Arc<dyn SwarmDataStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            cluster_id: config.cluster_id.clone(),
            key: Arc::new(key),
            transport,
            peers,
            store,
            concurrency: Arc::new(Semaphore::new(BROADCAST_CONCURRENCY)),
            rpc_timeout: Duration::from_secs(config.federation_rpc_timeout_secs),
            allow_opaque_sketch: config.federation_allow_opaque_sketch,
            metrics,
        }
    }

    /// Broadcast an antibody's coverage sketch to every peer. Returns a
    /// multi-status report; per-peer failures are contained.
    pub async fn broadcast_coverage(
        &self,
        antibody: &AntibodyVariant,
        fitness: &FitnessSummary,
        coverage: &[String],
    ) -> BroadcastReport {
        let (sketch_bytes, estimate) = self.build_sketch(antibody, coverage);
        let metadata = SketchMetadata {
            cluster_id: self.cluster_id.clone(),
            antibody_phase: AntibodyPhaseCode::Active as i32,
            signature_type: match self.key.as_ref() {
                FederationKey::Ed25519(_) => SignatureTypeCode::Ed25519 as i32,
                FederationKey::Hmac(_) => SignatureTypeCode::HmacSha256 as i32,
            },
            blast_radius: blast_radius_code(fitness.avg_blast_radius) as i32,
            cardinality_estimate: estimate,
            created_at_unix: Utc::now().timestamp(),
            confidence_level: fitness.confidence_lower,
        };

        let mut handles = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            let peer = peer.clone();
            let permit_source = self.concurrency.clone();
            let transport = self.transport.clone();
            let key = self.key.clone();
            let store = self.store.clone();
            let metrics = self.metrics.clone();
            let cluster_id = self.cluster_id.clone();
            let metadata = metadata.clone();
            let sketch_bytes = sketch_bytes.clone();
            let rpc_timeout = self.rpc_timeout;

            handles.push(tokio::spawn(async move {
                let _permit = permit_source.acquire_owned().await;
                let result = send_to_peer(
                    transport.as_ref(),
                    key.as_ref(),
                    store.as_ref(),
                    &cluster_id,
                    &peer,
                    sketch_bytes,
                    metadata,
                    rpc_timeout,
                )
                .await;
                let outcome = match &result {
                    Ok(()) => "ok",
                    Err(e) => e.kind(),
                };
                metrics.incr(
                    "federation_shares_total",
                    &[("peer", &peer), ("outcome", outcome)],
                );
                (peer, result)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(entry) => results.push(entry),
                Err(e) => results.push((
                    "unknown".to_string(),
                    Err(SwarmError::Internal(format!("broadcast task panicked: {}", e))),
                )),
            }
        }
        let report = BroadcastReport { results };
        info!(
            antibody_id = %antibody.id,
            successes = report.successes(),
            failures = report.failures(),
            "Federation broadcast complete"
        );
        report
    }

    fn build_sketch(&self, antibody: &AntibodyVariant, coverage: &[String]) -> (Vec<u8>, f64) {
        if self.allow_opaque_sketch {
            // Test mode: skip HLL marshalling entirely.
            return (
                format!("opaque-sketch:{}", antibody.id).into_bytes(),
                coverage.len() as f64,
            );
        }
        // Salt from the spec hash: peers sketching the same antibody's
        // coverage converge on the same item hashing.
        let mut sketch = HllSketch::new(SKETCH_PRECISION, antibody.spec_hash.as_bytes())
            .expect("precision constant in range");
        for item in coverage {
            // Insert only fails on decoded sketches; this one is local.
            let _ = sketch.insert(item.as_bytes());
        }
        let estimate = sketch.estimate();
        (sketch.to_bytes(), estimate)
    }
}

#[allow(clippy::too_many_arguments)]
async fn send_to_peer(
    transport: &dyn FederationTransport,
    key: &FederationKey,
    store: &dyn SwarmDataStore,
    cluster_id: &str,
    peer: &str,
    sketch: Vec<u8>,
    metadata: SketchMetadata,
    rpc_timeout: Duration,
) -> SwarmResult<()> {
    // Crash-safe monotone sequence per peer; retries reuse it so the
    // receiver can deduplicate on (sender, sequence).
    let sequence = store
        .increment_counter(FEDERATION_STORE_ID, &format!("sequence:{}", peer))
        .await
        .map_err(|e| SwarmError::Internal(format!("sequence counter: {}", e)))? as u64;
    let nonce: [u8; 16] = rand::random();

    let mut request = ShareSketchRequest {
        sender_cluster: cluster_id.to_string(),
        sketch,
        metadata: Some(metadata),
        sequence_number: sequence,
        nonce: nonce.to_vec(),
        timestamp_unix: Utc::now().timestamp(),
        auth: None,
    };
    request.auth = Some(key.sign(&request.sign_view())?);

    let mut last_error = SwarmError::PeerUnreachable(peer.to_string());
    for attempt in 1..=MAX_ATTEMPTS {
        match timeout(rpc_timeout, transport.share_sketch(peer, request.clone())).await {
            Ok(Ok(response)) if response.accepted => return Ok(()),
            Ok(Ok(response)) => {
                let code = FederationErrorCode::try_from(response.error_code)
                    .unwrap_or(FederationErrorCode::Internal);
                // A replay answer on a retry means the first delivery
                // landed; that is success, not failure.
                if code == FederationErrorCode::Replay && attempt > 1 {
                    debug!(peer, sequence, "Retry answered replay; share already delivered");
                    return Ok(());
                }
                let error = error_from_code(code, &response.message, peer);
                if !retryable(code) {
                    return Err(error);
                }
                last_error = error;
            }
            Ok(Err(e)) => last_error = e,
            Err(_) => {
                last_error = SwarmError::PeerUnreachable(format!(
                    "{} timed out after {:?}",
                    peer, rpc_timeout
                ));
            }
        }

        if attempt < MAX_ATTEMPTS {
            let jitter = rand::thread_rng().gen_range(Duration::ZERO..BACKOFF_BASE);
            let delay = BACKOFF_BASE * attempt + jitter;
            debug!(peer, attempt, ?delay, "Retrying federation share");
            tokio::time::sleep(delay).await;
        }
    }
    warn!(peer, error = %last_error, "Federation share exhausted retries");
    Err(last_error)
}

fn retryable(code: FederationErrorCode) -> bool {
    matches!(
        code,
        FederationErrorCode::PeerUnreachable | FederationErrorCode::Internal
    )
}

fn error_from_code(code: FederationErrorCode, message: &str, peer: &str) -> SwarmError {
    let detail = format!("{}: {}", peer, message);
    match code {
        FederationErrorCode::Replay => SwarmError::Replay(detail),
        FederationErrorCode::RateLimited => SwarmError::RateLimited(detail),
        FederationErrorCode::SignatureInvalid => SwarmError::SignatureInvalid(detail),
        FederationErrorCode::IncompatibleSketch => SwarmError::IncompatibleSketch(detail),
        FederationErrorCode::CorruptSketch => SwarmError::CorruptSketch(detail),
        FederationErrorCode::PeerUnreachable => SwarmError::PeerUnreachable(detail),
        FederationErrorCode::ErrorNone | FederationErrorCode::Internal => {
            SwarmError::Internal(detail)
        }
    }
}

fn blast_radius_code(avg_ring: f64) -> BlastRadiusCode {
    match avg_ring.round().clamp(1.0, 5.0) as u8 {
        1 => BlastRadiusCode::Ring1,
        2 => BlastRadiusCode::Ring2,
        3 => BlastRadiusCode::Ring3,
        4 => BlastRadiusCode::Ring4,
        _ => BlastRadiusCode::Ring5,
    }
}
