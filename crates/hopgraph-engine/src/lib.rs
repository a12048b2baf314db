pub mod config;
pub mod context;
pub mod embed;
pub mod fusion;
pub mod hop;
pub mod iteration;
pub mod metrics;
pub mod orchestrator;
pub mod path;
pub mod sanitize;
pub mod search;

pub use config::EngineConfig;
pub use context::{ProgressEvent, RequestContext};
pub use embed::{Embedder, HashingEmbedder};
pub use hop::{HopExecutor, HopOutcome, HopReport, HopRequest};
pub use iteration::{
    AnalysisRequest, Analyst, Answer, Critic, Critique, IterationController, IterationState,
};
pub use orchestrator::{PlanExecution, PlanOrchestrator, StepOutcome, StepStatus};
pub use path::PathFinder;
pub use sanitize::{FilterSanitizer, RuleTable, SanitizeReport, Validator};
pub use search::SearchEngine;

use hopgraph_core::{
    HoppingPath, Result, RetrievalPlan, SchemaRegistry, SearchQuery, SearchResult,
};
use hopgraph_storage::DocumentStore;
use std::sync::Arc;

/// Wires the components over one registry and one store.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<SchemaRegistry>,
    config: EngineConfig,
    paths: PathFinder,
    search: SearchEngine,
    hops: HopExecutor,
    orchestrator: PlanOrchestrator,
}

impl Engine {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn Embedder>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let search = SearchEngine::new(registry.clone(), store.clone(), embedder, config.clone());
        let orchestrator =
            PlanOrchestrator::new(registry.clone(), store.clone(), search.clone(), config.clone());
        Ok(Self {
            paths: PathFinder::new(registry.clone()),
            hops: HopExecutor::new(registry.clone(), store, &config),
            registry,
            config,
            search,
            orchestrator,
        })
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn find_path(&self, from: &str, to: &str) -> Option<HoppingPath> {
        self.paths.find_path(from, to)
    }

    pub fn find_chain(&self, from: &str, to: &str) -> Vec<HoppingPath> {
        self.paths.find_chain(from, to)
    }

    pub async fn search(&self, ctx: &RequestContext, query: &SearchQuery) -> Result<SearchResult> {
        self.search.search(ctx, query).await
    }

    pub async fn hop(&self, ctx: &RequestContext, req: &HopRequest) -> SearchResult {
        self.hops.hop(ctx, req).await
    }

    pub async fn execute(&self, ctx: &RequestContext, plan: &RetrievalPlan) -> Result<PlanExecution> {
        self.orchestrator.execute(ctx, plan).await
    }

    pub fn controller(&self, analyst: Arc<dyn Analyst>, critic: Arc<dyn Critic>) -> IterationController {
        IterationController::new(self.orchestrator.clone(), analyst, critic, self.config.clone())
    }
}
