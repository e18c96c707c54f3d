pub mod arena;
pub mod bus;
pub mod config;
pub mod db;
pub mod driver;
pub mod evaluator;
pub mod federation;
pub mod mutation;
pub mod population;
pub mod promotion;
pub mod stats;
pub mod test_utils;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::info;

use aswarm_shared::{CombatArena, MetricsSink, SwarmResult};

use bus::LearningBus;
use config::EvolutionConfig;
use db::{SqliteStore, SwarmDataStore};
use evaluator::FitnessEvaluator;
use federation::FederationClient;
use mutation::{MutationConfig, MutationEngine};
use population::{PopulationManager, PopulationParams};
use promotion::{PromotionController, PromotionGates};

/// Everything the evolution loop needs, wired once at startup.
pub struct SwarmState {
    pub config: EvolutionConfig,
    pub metrics: Arc<dyn MetricsSink>,
    pub bus: Arc<LearningBus>,
    pub engine: Arc<MutationEngine>,
    pub population: Arc<PopulationManager>,
    pub evaluator: Arc<FitnessEvaluator>,
    pub promotion: Arc<PromotionController>,
    pub federation: Option<Arc<FederationClient>>,
    /// Soft pause: set to stop new evolution work while ingestion and
    /// already-running evaluations continue.
    pub circuit_breaker: AtomicBool,
    pub shutdown: Arc<Notify>,
}

/// Assemble a `SwarmState` from its collaborators. The arena and the
/// optional federation client are injected; everything else is built
/// from the configuration.
pub fn build_state(
    config: EvolutionConfig,
    arena: Arc<dyn CombatArena>,
    store: Option<Arc<dyn SwarmDataStore>>,
    federation: Option<Arc<FederationClient>>,
    metrics: Arc<dyn MetricsSink>,
    seed: u64,
) -> SwarmResult<Arc<SwarmState>> {
    let engine = Arc::new(MutationEngine::new(
        seed,
        MutationConfig::default(),
        metrics.clone(),
    )?);
    let population = Arc::new(PopulationManager::new(
        engine.clone(),
        PopulationParams::default(),
        seed,
        metrics.clone(),
        store,
    )?);
    let evaluator = Arc::new(FitnessEvaluator::new(
        arena,
        metrics.clone(),
        config.eval_target_fpr,
    ));
    let promotion = Arc::new(PromotionController::new(
        PromotionGates::from_config(&config),
        population.clone(),
        metrics.clone(),
    ));
    let bus = Arc::new(LearningBus::new(
        config.event_queue_capacity,
        config.wal_dir.clone(),
        config.cluster_id.clone(),
        metrics.clone(),
    ));
    let circuit_breaker = AtomicBool::new(config.circuit_breaker);

    Ok(Arc::new(SwarmState {
        config,
        metrics,
        bus,
        engine,
        population,
        evaluator,
        promotion,
        federation,
        circuit_breaker,
        shutdown: Arc::new(Notify::new()),
    }))
}

/// Default entrypoint used by the `aswarm_system` binary: synthetic
/// arena, SQLite store, no federation transport (a deployment wires its
/// own RPC stack and arena through `build_state`).
pub async fn run_system() -> anyhow::Result<()> {
    let config = EvolutionConfig::load()?;
    let store: Arc<dyn SwarmDataStore> =
        Arc::new(SqliteStore::connect(&config.database_url).await?);

    let metrics = aswarm_shared::AtomicMetrics::new();
    let arena = Arc::new(arena::SyntheticArena::new(rand::random()));
    let state = build_state(
        config,
        arena,
        Some(store.clone()),
        None,
        metrics,
        rand::random(),
    )?;

    if let Some(snapshot) = PopulationManager::load_persisted_snapshot(store.as_ref()).await? {
        state.population.restore(&snapshot).await?;
        info!(
            generation = snapshot.generation,
            "Restored population counters from snapshot"
        );
    }

    let loop_handle = driver::spawn_evolution_loop(state.clone());
    info!(cluster_id = %state.config.cluster_id, "A-SWARM evolution core running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    state.shutdown.notify_waiters();
    let _ = loop_handle.await;
    Ok(())
}
