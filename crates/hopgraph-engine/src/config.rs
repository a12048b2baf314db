use hopgraph_core::{EngineError, Result};
use std::time::Duration;

pub const DEFAULT_GENERIC_TERMS: &[&str] = &[
    "all", "any", "anything", "every", "everything", "top", "best", "most", "many", "some",
    "various", "revenue", "data", "info", "information", "details", "list", "show", "results",
    "none", "null", "undefined", "n/a", "unknown", "*",
];

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Weight of the vector side in hybrid fusion, in [0, 1].
    pub vector_weight: f32,
    /// Rows scanned by the in-process cosine fallback.
    pub vector_candidate_limit: usize,
    pub default_limit: usize,
    pub max_iterations: u32,
    pub time_budget: Duration,
    /// Applied to the answer confidence when iteration stops without a valid critique.
    pub degraded_confidence_factor: f32,
    pub generic_terms: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.5,
            vector_candidate_limit: 100,
            default_limit: 20,
            max_iterations: 3,
            time_budget: Duration::from_secs(60),
            degraded_confidence_factor: 0.5,
            generic_terms: DEFAULT_GENERIC_TERMS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `HOPGRAPH_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = env_parse("HOPGRAPH_VECTOR_WEIGHT") {
            cfg.vector_weight = v;
        }
        if let Some(v) = env_parse("HOPGRAPH_VECTOR_CANDIDATES") {
            cfg.vector_candidate_limit = v;
        }
        if let Some(v) = env_parse("HOPGRAPH_DEFAULT_LIMIT") {
            cfg.default_limit = v;
        }
        if let Some(v) = env_parse("HOPGRAPH_MAX_ITERATIONS") {
            cfg.max_iterations = v;
        }
        if let Some(ms) = env_parse::<u64>("HOPGRAPH_TIME_BUDGET_MS") {
            cfg.time_budget = Duration::from_millis(ms);
        }
        if let Some(v) = env_parse("HOPGRAPH_DEGRADED_FACTOR") {
            cfg.degraded_confidence_factor = v;
        }
        if let Ok(terms) = std::env::var("HOPGRAPH_GENERIC_TERMS") {
            cfg.generic_terms = terms
                .split(',')
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.vector_weight) {
            return Err(EngineError::Config(format!(
                "vector weight {} outside [0, 1]",
                self.vector_weight
            )));
        }
        if !(0.0..=1.0).contains(&self.degraded_confidence_factor) {
            return Err(EngineError::Config(format!(
                "degraded confidence factor {} outside [0, 1]",
                self.degraded_confidence_factor
            )));
        }
        if self.max_iterations == 0 {
            return Err(EngineError::Config("max iterations must be at least 1".into()));
        }
        if self.default_limit == 0 || self.vector_candidate_limit == 0 {
            return Err(EngineError::Config("limits must be positive".into()));
        }
        Ok(())
    }
}
