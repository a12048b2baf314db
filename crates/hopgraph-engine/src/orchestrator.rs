//! Plan orchestrator.
//!
//! Executes a [`RetrievalPlan`] strictly in step order. Each step's output is
//! the list of its document ids, published under the step id and under its
//! `produces` tag so later steps can reference it as `"{{name}}"` inside
//! their filters. A step never aborts the plan; it finishes as completed,
//! broken (an upstream or a hop link produced nothing), skipped (a dependency
//! or a referenced placeholder does not come from an earlier step) or failed.

use crate::config::EngineConfig;
use crate::context::{ProgressEvent, RequestContext};
use crate::hop::{document_ids, HopExecutor, HopOutcome};
use crate::metrics::PLAN_STEP_SECONDS;
use crate::path::PathFinder;
use crate::sanitize::scope_to_tenant;
use crate::search::SearchEngine;
use hopgraph_core::{
    placeholder_name, Action, Document, DocumentId, EngineError, FilterMap, HoppingPath,
    Result, RetrievalPlan, RetrievalStep, SchemaRegistry, SearchMethod, SearchQuery,
    SearchResult,
};
use hopgraph_storage::DocumentStore;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Field added to flattened documents naming their source collection.
pub const COLLECTION_TAG: &str = "_collection";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Broken,
    Skipped,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::Broken => "broken",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub action: Action,
    pub collection: String,
    pub status: StepStatus,
    pub result: SearchResult,
    pub ids: Vec<DocumentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PlanExecution {
    pub steps: Vec<StepOutcome>,
    /// Every completed step's documents, first occurrence per (collection, id).
    pub documents: Vec<Document>,
}

impl PlanExecution {
    pub fn step(&self, id: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step_id == id)
    }

    pub fn is_broken(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.status, StepStatus::Broken | StepStatus::Failed))
    }
}

// Result of one step before bookkeeping.
struct StepRun {
    status: StepStatus,
    result: SearchResult,
    note: Option<String>,
}

impl StepRun {
    fn completed(result: SearchResult) -> Self {
        Self {
            status: StepStatus::Completed,
            result,
            note: None,
        }
    }

    fn not_run(status: StepStatus, note: String) -> Self {
        Self {
            status,
            result: SearchResult::empty(SearchMethod::Metadata),
            note: Some(note),
        }
    }
}

#[derive(Default)]
struct ResolvedFilter {
    filter: FilterMap,
    // placeholders whose producer yielded no ids
    empty: Vec<String>,
    // placeholders no earlier step produced
    missing: Vec<String>,
}

#[derive(Clone)]
pub struct PlanOrchestrator {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn DocumentStore>,
    search: SearchEngine,
    hops: HopExecutor,
    paths: PathFinder,
    config: EngineConfig,
}

impl PlanOrchestrator {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        store: Arc<dyn DocumentStore>,
        search: SearchEngine,
        config: EngineConfig,
    ) -> Self {
        Self {
            hops: HopExecutor::new(registry.clone(), store.clone(), &config),
            paths: PathFinder::new(registry.clone()),
            registry,
            store,
            search,
            config,
        }
    }

    /// Only a malformed plan (duplicate or empty step ids) is an error.
    pub async fn execute(&self, ctx: &RequestContext, plan: &RetrievalPlan) -> Result<PlanExecution> {
        let unordered: HashSet<String> = plan.validate()?.into_iter().collect();
        let mut outputs: HashMap<String, Vec<DocumentId>> = HashMap::new();
        let mut collections: HashMap<String, String> = HashMap::new();
        let mut steps = Vec::with_capacity(plan.steps.len());

        for step in &plan.steps {
            ctx.emit(ProgressEvent::StepStarted {
                step_id: step.id.clone(),
                action: step.action,
                collection: step.collection.clone(),
            });
            let started = Instant::now();
            let timer = PLAN_STEP_SECONDS
                .with_label_values(&[step.action.as_str()])
                .start_timer();

            let run = if unordered.contains(&step.id) {
                warn!(step = %step.id, deps = ?step.depends_on, "dependencies do not run before this step");
                StepRun::not_run(
                    StepStatus::Skipped,
                    "dependency is unknown or scheduled later".into(),
                )
            } else if let Some(dep) = step
                .depends_on
                .iter()
                .find(|d| outputs.get(*d).map(Vec::is_empty).unwrap_or(true))
            {
                StepRun::not_run(StepStatus::Broken, format!("upstream step {dep} returned no documents"))
            } else {
                let resolved = resolve_filter(&step.filter, &outputs);
                if let Some(tag) = resolved.missing.first() {
                    warn!(step = %step.id, %tag, "placeholder is not produced by an earlier step");
                    StepRun::not_run(
                        StepStatus::Skipped,
                        format!("{{{{{tag}}}}} is not produced by an earlier step"),
                    )
                } else if let Some(tag) = resolved.empty.first() {
                    StepRun::not_run(StepStatus::Broken, format!("{{{{{tag}}}}} resolved to no ids"))
                } else {
                    self.dispatch(ctx, step, resolved.filter, &outputs, &collections)
                        .await
                }
            };
            timer.observe_duration();

            if run.status == StepStatus::Broken {
                let reason = run.note.clone().unwrap_or_default();
                info!(request_id = %ctx.request_id, step = %step.id, %reason, "retrieval chain broken");
                ctx.emit(ProgressEvent::ChainBroken {
                    step_id: step.id.clone(),
                    reason,
                });
            }

            let id_field = self.id_field_for(step);
            let ids = document_ids(&run.result.documents, &id_field);
            outputs.insert(step.id.clone(), ids.clone());
            collections.insert(step.id.clone(), step.collection.clone());
            if let Some(tag) = &step.produces {
                outputs.insert(tag.clone(), ids.clone());
                collections.insert(tag.clone(), step.collection.clone());
            }
            ctx.emit(ProgressEvent::StepFinished {
                step_id: step.id.clone(),
                status: run.status.as_str().to_string(),
                documents: run.result.documents.len(),
            });
            debug!(
                step = %step.id,
                status = run.status.as_str(),
                documents = run.result.documents.len(),
                "plan step finished"
            );
            steps.push(StepOutcome {
                step_id: step.id.clone(),
                action: step.action,
                collection: step.collection.clone(),
                status: run.status,
                result: run.result,
                ids,
                note: run.note,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        let documents = self.flatten(&steps);
        Ok(PlanExecution { steps, documents })
    }

    async fn dispatch(
        &self,
        ctx: &RequestContext,
        step: &RetrievalStep,
        filter: FilterMap,
        outputs: &HashMap<String, Vec<DocumentId>>,
        collections: &HashMap<String, String>,
    ) -> StepRun {
        match step.action {
            Action::Fetch => self.fetch(ctx, step, filter).await,
            Action::Aggregate => match &step.aggregate {
                Some(_) => self.aggregate(ctx, step, filter).await,
                None => self.fetch(ctx, step, filter).await,
            },
            Action::Hop => self.hop(ctx, step, filter, outputs, collections).await,
        }
    }

    async fn fetch(&self, ctx: &RequestContext, step: &RetrievalStep, filter: FilterMap) -> StepRun {
        let query = SearchQuery {
            collection: step.collection.clone(),
            tenant_id: ctx.tenant_id.clone(),
            filter,
            vector_query: step.vector_query.clone(),
            text_query: step.text_query.clone(),
            limit: step.limit,
            skip: None,
            sort: step.sort.clone(),
        };
        match self.search.search(ctx, &query).await {
            Ok(r) => StepRun::completed(r),
            Err(e) => {
                warn!(step = %step.id, error = %e, "fetch step failed");
                StepRun::not_run(StepStatus::Failed, e.to_string())
            }
        }
    }

    async fn aggregate(
        &self,
        ctx: &RequestContext,
        step: &RetrievalStep,
        filter: FilterMap,
    ) -> StepRun {
        let Some(schema) = self.registry.get_schema(&step.collection) else {
            let e = EngineError::SchemaNotFound(step.collection.clone());
            warn!(step = %step.id, error = %e, "aggregate step failed");
            return StepRun::not_run(StepStatus::Failed, e.to_string());
        };
        let spec = step.aggregate.clone().unwrap_or_default();
        let sanitized = self.search.sanitizer().sanitize(schema, &filter).filter;
        let scoped = scope_to_tenant(schema, &ctx.tenant_id, sanitized);
        match self.store.aggregate(&schema.name, &scoped, &spec).await {
            Ok(mut rows) => {
                if let Some(limit) = step.limit {
                    rows.truncate(limit);
                }
                StepRun::completed(SearchResult {
                    total: rows.len(),
                    confidence: if rows.is_empty() { 0.0 } else { 1.0 },
                    documents: rows,
                    method: SearchMethod::Metadata,
                })
            }
            Err(e) => {
                warn!(step = %step.id, error = %e, "aggregate step failed");
                StepRun::not_run(StepStatus::Failed, e.to_string())
            }
        }
    }

    async fn hop(
        &self,
        ctx: &RequestContext,
        step: &RetrievalStep,
        filter: FilterMap,
        outputs: &HashMap<String, Vec<DocumentId>>,
        collections: &HashMap<String, String>,
    ) -> StepRun {
        let Some(upstream) = step.depends_on.first() else {
            return StepRun::not_run(StepStatus::Skipped, "hop step has no upstream step".into());
        };
        let source_ids = outputs.get(upstream).cloned().unwrap_or_default();
        let from = match &step.hop {
            Some(declared) => declared.from.clone(),
            None => match collections.get(upstream) {
                Some(c) => c.clone(),
                None => {
                    return StepRun::not_run(StepStatus::Skipped, format!("unknown upstream {upstream}"))
                }
            },
        };
        if collections.get(upstream).is_some_and(|c| *c != from) {
            warn!(step = %step.id, %from, upstream = %upstream, "hop source differs from upstream collection");
        }
        let to = step.collection.clone();

        let chain = self.resolve_chain(step.hop.as_ref(), &from, &to);
        if chain.is_empty() {
            let e = EngineError::PathNotFound { from, to };
            warn!(step = %step.id, error = %e, "hop step failed");
            return StepRun::not_run(StepStatus::Failed, e.to_string());
        }
        let report = self
            .hops
            .hop_chain(ctx, &chain, source_ids, filter, step.limit)
            .await;
        match report.outcome {
            HopOutcome::Joined => StepRun::completed(report.result),
            outcome => {
                let link = chain
                    .get(report.link)
                    .map(|l| l.to_string())
                    .unwrap_or_default();
                let why = match outcome {
                    HopOutcome::Failed => "failed",
                    _ => "joined nothing",
                };
                StepRun::not_run(StepStatus::Broken, format!("hop {link} {why}"))
            }
        }
    }

    // A declared path is checked against the registry, which is
    // authoritative for join fields; without a direct path the chain is used.
    fn resolve_chain(&self, declared: Option<&HoppingPath>, from: &str, to: &str) -> Vec<HoppingPath> {
        if let Some(p) = self.paths.find_path(from, to) {
            if let Some(d) = declared {
                if d.via != p.via || d.to != p.to {
                    warn!(declared = %d, resolved = %p, "declared hop path differs from schema");
                }
            }
            return vec![p];
        }
        self.paths.find_chain(from, to)
    }

    fn id_field_for(&self, step: &RetrievalStep) -> String {
        if step.action == Action::Aggregate && step.aggregate.is_some() {
            return "_id".to_string();
        }
        self.registry
            .get_schema(&step.collection)
            .map(|s| s.id_field.clone())
            .unwrap_or_else(|| "_id".to_string())
    }

    fn flatten(&self, steps: &[StepOutcome]) -> Vec<Document> {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut out = Vec::new();
        for outcome in steps.iter().filter(|s| s.status == StepStatus::Completed) {
            let id_field = self
                .registry
                .get_schema(&outcome.collection)
                .map(|s| s.id_field.as_str())
                .unwrap_or("_id");
            for doc in &outcome.result.documents {
                let key = doc
                    .id(id_field)
                    .unwrap_or_else(|| serde_json::to_string(&doc.0).unwrap_or_default());
                if !seen.insert((outcome.collection.clone(), key)) {
                    continue;
                }
                let mut tagged = doc.clone();
                tagged.insert(COLLECTION_TAG, JsonValue::String(outcome.collection.clone()));
                out.push(tagged);
            }
        }
        out
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn resolve_filter(raw: &FilterMap, outputs: &HashMap<String, Vec<DocumentId>>) -> ResolvedFilter {
    let mut resolved = ResolvedFilter::default();
    resolved.filter = resolve_map(raw, outputs, &mut resolved);
    resolved
}

fn resolve_map(
    raw: &FilterMap,
    outputs: &HashMap<String, Vec<DocumentId>>,
    acc: &mut ResolvedFilter,
) -> FilterMap {
    raw.iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, outputs, acc)))
        .collect()
}

// Placeholders become id arrays; inside an array their ids are spliced in.
fn resolve_value(
    v: &JsonValue,
    outputs: &HashMap<String, Vec<DocumentId>>,
    acc: &mut ResolvedFilter,
) -> JsonValue {
    match v {
        JsonValue::String(s) => match placeholder_name(s) {
            Some(name) => JsonValue::Array(
                placeholder_ids(name, outputs, acc)
                    .into_iter()
                    .map(JsonValue::String)
                    .collect(),
            ),
            None => v.clone(),
        },
        JsonValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str().and_then(placeholder_name) {
                    Some(name) => out.extend(
                        placeholder_ids(name, outputs, acc)
                            .into_iter()
                            .map(JsonValue::String),
                    ),
                    None => out.push(resolve_value(item, outputs, acc)),
                }
            }
            JsonValue::Array(out)
        }
        JsonValue::Object(map) => JsonValue::Object(resolve_map(map, outputs, acc)),
        other => other.clone(),
    }
}

fn placeholder_ids(
    name: &str,
    outputs: &HashMap<String, Vec<DocumentId>>,
    acc: &mut ResolvedFilter,
) -> Vec<DocumentId> {
    match outputs.get(name) {
        Some(ids) => {
            if ids.is_empty() {
                acc.empty.push(name.to_string());
            }
            ids.clone()
        }
        None => {
            acc.missing.push(name.to_string());
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> HashMap<String, Vec<DocumentId>> {
        let mut m = HashMap::new();
        m.insert("company_ids".to_string(), vec!["c1".to_string(), "c2".to_string()]);
        m.insert("nothing".to_string(), Vec::new());
        m
    }

    fn map(v: JsonValue) -> FilterMap {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn placeholders_become_id_lists() {
        let r = resolve_filter(
            &map(json!({"companyId": "{{company_ids}}", "title": "VP Sales"})),
            &outputs(),
        );
        assert_eq!(
            JsonValue::Object(r.filter),
            json!({"companyId": ["c1", "c2"], "title": "VP Sales"})
        );
        assert!(r.empty.is_empty());
    }

    #[test]
    fn operator_and_list_positions() {
        let r = resolve_filter(
            &map(json!({"companyId": {"$in": "{{company_ids}}"}, "_id": ["c9", "{{company_ids}}"]})),
            &outputs(),
        );
        assert_eq!(
            JsonValue::Object(r.filter),
            json!({"companyId": {"$in": ["c1", "c2"]}, "_id": ["c9", "c1", "c2"]})
        );
    }

    #[test]
    fn unknown_placeholders_are_reported_missing() {
        let r = resolve_filter(
            &map(json!({"companyId": "{{ghost}}", "$or": [{"deal": {"$in": ["{{later}}"]}}], "x": 1})),
            &outputs(),
        );
        let mut missing = r.missing.clone();
        missing.sort();
        assert_eq!(missing, vec!["ghost", "later"]);
        assert!(r.empty.is_empty());
    }

    #[test]
    fn empty_producers_are_reported() {
        let r = resolve_filter(&map(json!({"companyId": "{{nothing}}"})), &outputs());
        assert_eq!(r.empty, vec!["nothing"]);
    }
}
