//! End-to-end federation: an antibody that reaches active has its
//! coverage sketch signed, shipped through the loop's federation topic,
//! verified by the receiving cluster, and merged after quorum.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use aswarm_core::config::EvolutionConfig;
use aswarm_core::driver::run_cycle;
use aswarm_core::federation::sketch::salt_fingerprint;
use aswarm_core::federation::{
    FederationClient, FederationKey, FederationServer, FederationServerConfig, FederationTransport,
    PeerProfile, ShareSketchRequest, ShareSketchResponse,
};
use aswarm_core::test_utils::{learning_event, memory_store, DeterministicArena};
use aswarm_shared::{AntibodyPhase, AtomicMetrics, LearningEvent, SwarmResult, TraceId};

struct Loopback {
    server: Arc<FederationServer>,
}

#[async_trait]
impl FederationTransport for Loopback {
    async fn share_sketch(
        &self,
        _peer: &str,
        request: ShareSketchRequest,
    ) -> SwarmResult<ShareSketchResponse> {
        Ok(self.server.share_sketch(request).await)
    }
}

#[tokio::test]
async fn test_active_antibody_broadcasts_and_peer_merges() {
    let mut config = EvolutionConfig::for_tests();
    config.wal_dir = std::env::temp_dir().join(format!("aswarm-wal-{}", TraceId::new()));

    let metrics = AtomicMetrics::new();
    let key = FederationKey::ed25519_from_bytes(&[11u8; 32]);

    let server = Arc::new(FederationServer::new(
        FederationServerConfig {
            cluster_id: "cluster-remote".into(),
            rate_limit_rpm: 600,
            max_skew_secs: 300,
            nonce_ttl: Duration::from_secs(600),
            quorum: 1,
            min_trust: 0.5,
        },
        memory_store().await,
        metrics.clone(),
    ));
    server.register_peer(
        "cluster-test",
        PeerProfile {
            verifier: key.verifier(),
            trust_score: 0.9,
        },
    );

    let client = Arc::new(FederationClient::new(
        &config,
        key,
        Arc::new(Loopback {
            server: server.clone(),
        }),
        vec!["cluster-remote".into()],
        memory_store().await,
        metrics.clone(),
    ));

    let state = aswarm_core::build_state(
        config,
        Arc::new(DeterministicArena::default()),
        Some(memory_store().await),
        Some(client),
        metrics.clone(),
        7,
    )
    .unwrap();

    // Grow and score a founder antibody through one normal cycle.
    for i in 0..60 {
        state
            .bus
            .emit(learning_event(i, "T1496.cryptomining", 0.8))
            .unwrap();
    }
    run_cycle(&state).await;
    let founder = state.population.ids_in_phase(AntibodyPhase::Shadow).await[0].clone();

    // The orchestrator moves it into active; the loop then owns the
    // broadcast.
    let outcome = state
        .promotion
        .force_phase(&founder, AntibodyPhase::Active)
        .await
        .unwrap();
    assert!(outcome.federation_broadcast);

    let now = chrono::Utc::now().timestamp();
    state
        .bus
        .emit(LearningEvent {
            event_id: format!("federation-share-{}", founder),
            signature: founder.clone(),
            env: "prod".into(),
            features: BTreeMap::new(),
            severity: 0.0,
            first_seen_unix: now,
            last_seen_unix: now,
        })
        .unwrap();
    run_cycle(&state).await;

    // The receiving cluster verified, attested, and merged the sketch.
    let variant = state.population.variant(&founder).await.unwrap();
    let coverage_key = hex::encode(salt_fingerprint(variant.spec_hash.as_bytes()));
    let estimate = server.coverage_estimate(&coverage_key).unwrap();
    assert!(estimate > 0.0);
    assert_eq!(
        metrics.counter(
            "federation_shares_total",
            &[("peer", "cluster-remote"), ("outcome", "ok")]
        ),
        1
    );
}
