pub mod antibody;
pub mod canonical;
pub mod combat;
pub mod error;
pub mod events;
pub mod fitness;
pub mod ids;
pub mod metrics;
pub mod signature;

pub use antibody::{
    AntibodyPhase, AntibodySpec, AntibodyVariant, ConditionRecord, ConditionStatus, Controls,
    DeploymentState, DetectorSpec, FeatureValue, Lineage, Scope,
};
pub use combat::{AttackResult, CombatArena, DetectionResult};
pub use error::{SwarmError, SwarmResult};
pub use events::{CycleResult, EventTopic, LearningEvent};
pub use fitness::{FitnessSummary, RocSummary};
pub use ids::TraceId;
pub use metrics::{AtomicMetrics, MetricsSink};
pub use signature::DiversitySignature;

/// SDK version constant for consistent version reporting across the control plane.
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");
