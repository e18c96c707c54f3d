use anyhow::Context;
use std::env;
use std::path::PathBuf;

/// Returns the directory containing the running executable.
/// Falls back to CWD if the exe path cannot be determined.
#[must_use]
pub fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug, Clone)]
pub struct EvolutionConfig {
    pub database_url: String,
    pub cluster_id: String,
    /// Initial circuit-breaker position; the running flag lives in
    /// `SwarmState` so operators and tests can flip it without env games.
    pub circuit_breaker: bool,
    pub tick_interval_secs: u64,
    pub event_queue_capacity: usize,
    pub wal_dir: PathBuf,
    pub evolve_min_events: usize,
    /// Detections below this confidence emit a learning event.
    pub learn_low_conf: f64,
    pub fitness_promote_threshold: f64,
    // Promotion gates.
    pub promote_max_canary_pct: f64,
    pub promote_cooldown_hours: i64,
    pub promote_min_wilson_bound: f64,
    pub safety_violation_limit: u32,
    // Evaluation.
    pub eval_target_fpr: f64,
    // Federation.
    pub federation_rate_limit_rpm: u32,
    pub federation_rpc_timeout_secs: u64,
    pub federation_max_skew_secs: i64,
    pub federation_nonce_ttl_secs: u64,
    pub federation_allow_opaque_sketch: bool,
    // Resource budget hints; None disables the check.
    pub max_rss_mb: Option<u64>,
    pub max_load_avg: Option<f64>,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Failed to parse {}", name)),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

impl EvolutionConfig {
    #[allow(clippy::too_many_lines)]
    pub fn load() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| {
            let db_path = exe_dir().join("data").join("aswarm_evolution.db");
            format!("sqlite:{}", db_path.display())
        });

        let cluster_id = env::var("CLUSTER_ID").unwrap_or_else(|_| "cluster-local".to_string());
        if cluster_id.trim().is_empty() {
            anyhow::bail!("CLUSTER_ID must not be empty");
        }

        let tick_interval_secs = env_parse("EVOLUTION_TICK_SECS", 60u64)?;
        if tick_interval_secs == 0 || tick_interval_secs > 3600 {
            anyhow::bail!(
                "EVOLUTION_TICK_SECS must be between 1 and 3600 (got {})",
                tick_interval_secs
            );
        }

        let event_queue_capacity = env_parse("EVENT_QUEUE_CAPACITY", 10_000usize)?;
        if event_queue_capacity == 0 {
            anyhow::bail!("EVENT_QUEUE_CAPACITY must be positive");
        }

        let wal_dir = env::var("EVENT_WAL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| exe_dir().join("data").join("wal"));

        let learn_low_conf = env_parse("LEARN_LOW_CONF", 0.5f64)?;
        if !(0.0..=1.0).contains(&learn_low_conf) {
            anyhow::bail!("LEARN_LOW_CONF must be in [0, 1] (got {})", learn_low_conf);
        }

        let evolve_min_events = env_parse("EVOLVE_MIN_EVENTS", 1usize)?;

        let fitness_promote_threshold = env_parse("FITNESS_PROMOTE_THRESHOLD", 0.70f64)?;
        if !(0.0..=1.0).contains(&fitness_promote_threshold) {
            anyhow::bail!(
                "FITNESS_PROMOTE_THRESHOLD must be in [0, 1] (got {})",
                fitness_promote_threshold
            );
        }

        let promote_max_canary_pct = env_parse("PROMOTE_MAX_CANARY_PCT", 5.0f64)?;
        if !(0.0..=100.0).contains(&promote_max_canary_pct) {
            anyhow::bail!(
                "PROMOTE_MAX_CANARY_PCT must be in [0, 100] (got {})",
                promote_max_canary_pct
            );
        }

        let promote_cooldown_hours = env_parse("PROMOTE_COOLDOWN_HOURS", 4i64)?;
        if promote_cooldown_hours < 0 {
            anyhow::bail!(
                "PROMOTE_COOLDOWN_HOURS must be non-negative (got {})",
                promote_cooldown_hours
            );
        }

        let promote_min_wilson_bound = env_parse("PROMOTE_MIN_WILSON_BOUND", 0.70f64)?;
        if !(0.0..=1.0).contains(&promote_min_wilson_bound) {
            anyhow::bail!(
                "PROMOTE_MIN_WILSON_BOUND must be in [0, 1] (got {})",
                promote_min_wilson_bound
            );
        }

        let safety_violation_limit = env_parse("SAFETY_VIOLATION_LIMIT", 0u32)?;

        let eval_target_fpr = env_parse("EVAL_TARGET_FPR", 0.001f64)?;
        if !(0.0..=1.0).contains(&eval_target_fpr) {
            anyhow::bail!("EVAL_TARGET_FPR must be in [0, 1] (got {})", eval_target_fpr);
        }

        let federation_rate_limit_rpm = env_parse("FEDERATION_RATE_LIMIT_RPM", 600u32)?;
        if federation_rate_limit_rpm == 0 {
            anyhow::bail!("FEDERATION_RATE_LIMIT_RPM must be positive");
        }

        let federation_rpc_timeout_secs = env_parse("FEDERATION_RPC_TIMEOUT_SECS", 5u64)?;
        if federation_rpc_timeout_secs == 0 || federation_rpc_timeout_secs > 120 {
            anyhow::bail!(
                "FEDERATION_RPC_TIMEOUT_SECS must be between 1 and 120 (got {})",
                federation_rpc_timeout_secs
            );
        }

        let federation_max_skew_secs = env_parse("FEDERATION_MAX_SKEW_SECS", 300i64)?;
        if federation_max_skew_secs <= 0 {
            anyhow::bail!("FEDERATION_MAX_SKEW_SECS must be positive");
        }

        let federation_nonce_ttl_secs = env_parse("FEDERATION_NONCE_TTL_SECS", 600u64)?;
        if federation_nonce_ttl_secs == 0 {
            anyhow::bail!("FEDERATION_NONCE_TTL_SECS must be positive");
        }

        let max_rss_mb = env::var("EVOLVE_MAX_RSS_MB")
            .ok()
            .map(|v| v.trim().parse::<u64>())
            .transpose()
            .context("Failed to parse EVOLVE_MAX_RSS_MB")?;
        let max_load_avg = env::var("EVOLVE_MAX_LOAD")
            .ok()
            .map(|v| v.trim().parse::<f64>())
            .transpose()
            .context("Failed to parse EVOLVE_MAX_LOAD")?;

        Ok(Self {
            database_url,
            cluster_id,
            circuit_breaker: env_bool("EVOLUTION_CIRCUIT_BREAKER"),
            tick_interval_secs,
            event_queue_capacity,
            wal_dir,
            evolve_min_events,
            learn_low_conf,
            fitness_promote_threshold,
            promote_max_canary_pct,
            promote_cooldown_hours,
            promote_min_wilson_bound,
            safety_violation_limit,
            eval_target_fpr,
            federation_rate_limit_rpm,
            federation_rpc_timeout_secs,
            federation_max_skew_secs,
            federation_nonce_ttl_secs,
            federation_allow_opaque_sketch: env_bool("FEDERATION_ALLOW_OPAQUE_SKETCH"),
            max_rss_mb,
            max_load_avg,
        })
    }

    /// Defaults without touching the process environment; used by tests.
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            database_url: "sqlite::memory:".into(),
            cluster_id: "cluster-test".into(),
            circuit_breaker: false,
            tick_interval_secs: 1,
            event_queue_capacity: 10_000,
            wal_dir: std::env::temp_dir().join("aswarm-wal-tests"),
            evolve_min_events: 1,
            learn_low_conf: 0.5,
            fitness_promote_threshold: 0.70,
            promote_max_canary_pct: 5.0,
            promote_cooldown_hours: 4,
            promote_min_wilson_bound: 0.70,
            safety_violation_limit: 0,
            eval_target_fpr: 0.001,
            federation_rate_limit_rpm: 600,
            federation_rpc_timeout_secs: 5,
            federation_max_skew_secs: 300,
            federation_nonce_ttl_secs: 600,
            federation_allow_opaque_sketch: false,
            max_rss_mb: None,
            max_load_avg: None,
        }
    }
}
