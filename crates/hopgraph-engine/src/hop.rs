//! Hop executor: follows one declared relationship from a set of source ids.
//!
//! Source ids are never trusted. On a tenant-scoped source collection they
//! are re-read under the owner filter first and only the verified subset is
//! joined. Hops never fail the caller; every problem is logged and turns into
//! an empty result whose [`HopOutcome`] says what went wrong.

use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::metrics::HOP_TOTAL;
use crate::sanitize::{scope_to_tenant, tenant_filter, FilterSanitizer};
use hopgraph_core::{
    id_string, CollectionSchema, Document, DocumentId, EngineError, Filter, FilterMap,
    HoppingPath, Operator, SchemaRegistry, SearchMethod, SearchResult,
};
use hopgraph_storage::{DocumentStore, FindRequest};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct HopRequest {
    pub source_collection: String,
    pub source_ids: Vec<DocumentId>,
    pub target_collection: String,
    /// Field on the target matched against the join keys.
    pub via_field: String,
    /// Field on the source supplying the join keys; the source id field when `None`.
    pub source_field: Option<String>,
    pub filter: FilterMap,
    pub limit: Option<usize>,
}

impl HopRequest {
    pub fn along(path: &HoppingPath, source_ids: Vec<DocumentId>) -> Self {
        Self {
            source_collection: path.from.clone(),
            source_ids,
            target_collection: path.to.clone(),
            via_field: path.via.clone(),
            source_field: Some(path.source_field.clone()),
            filter: FilterMap::new(),
            limit: None,
        }
    }

    pub fn with_filter(mut self, filter: FilterMap) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopOutcome {
    /// At least one target document matched.
    Joined,
    NoSources,
    /// No verified source keys, or no target matched them.
    Empty,
    /// Unknown collection, undeclared join field or a store error.
    Failed,
}

impl HopOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HopOutcome::Joined => "ok",
            HopOutcome::NoSources => "noop",
            HopOutcome::Empty => "empty",
            HopOutcome::Failed => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HopReport {
    pub result: SearchResult,
    pub outcome: HopOutcome,
    pub link: usize,
}

impl HopReport {
    fn empty(outcome: HopOutcome) -> Self {
        Self {
            result: SearchResult::empty(SearchMethod::Metadata),
            outcome,
            link: 0,
        }
    }
}

#[derive(Clone)]
pub struct HopExecutor {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn DocumentStore>,
    sanitizer: FilterSanitizer,
}

impl HopExecutor {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        store: Arc<dyn DocumentStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            store,
            sanitizer: FilterSanitizer::from_config(config),
        }
    }

    pub async fn hop(&self, ctx: &RequestContext, req: &HopRequest) -> SearchResult {
        self.run(ctx, req).await.result
    }

    /// Like [`hop`](Self::hop) but also says why a result is empty.
    pub async fn run(&self, ctx: &RequestContext, req: &HopRequest) -> HopReport {
        let report = self.join(ctx, req).await;
        HOP_TOTAL.with_label_values(&[report.outcome.as_str()]).inc();
        report
    }

    async fn join(&self, ctx: &RequestContext, req: &HopRequest) -> HopReport {
        if req.source_ids.is_empty() {
            debug!(from = %req.source_collection, to = %req.target_collection, "hop with no source ids");
            return HopReport::empty(HopOutcome::NoSources);
        }
        let (Some(src), Some(dst)) = (
            self.registry.get_schema(&req.source_collection),
            self.registry.get_schema(&req.target_collection),
        ) else {
            warn!(
                from = %req.source_collection,
                to = %req.target_collection,
                "hop between unknown collections"
            );
            return HopReport::empty(HopOutcome::Failed);
        };
        if !dst.has_join_field(&req.via_field) {
            warn!(to = %dst.name, via = %req.via_field, "hop via undeclared field");
            return HopReport::empty(HopOutcome::Failed);
        }

        let keys = match self.join_keys(ctx, src, req).await {
            Ok(k) => k,
            Err(e) => {
                warn!(request_id = %ctx.request_id, error = %e, "hop source lookup failed");
                return HopReport::empty(HopOutcome::Failed);
            }
        };
        if keys.is_empty() {
            return HopReport::empty(HopOutcome::Empty);
        }

        let user = self.sanitizer.sanitize(dst, &req.filter).filter;
        let filter = scope_to_tenant(
            dst,
            &ctx.tenant_id,
            Filter::field(req.via_field.clone(), Operator::In, JsonValue::Array(keys)).and(user),
        );
        let mut find = FindRequest::new(filter);
        find.limit = req.limit;
        match self.store.find(&dst.name, find).await {
            Ok(documents) => {
                debug!(
                    from = %src.name,
                    to = %dst.name,
                    sources = req.source_ids.len(),
                    matched = documents.len(),
                    "hop"
                );
                if documents.is_empty() {
                    return HopReport::empty(HopOutcome::Empty);
                }
                HopReport {
                    result: SearchResult {
                        total: documents.len(),
                        confidence: 1.0,
                        documents,
                        method: SearchMethod::Metadata,
                    },
                    outcome: HopOutcome::Joined,
                    link: 0,
                }
            }
            Err(e) => {
                warn!(to = %dst.name, error = %e, "hop target lookup failed");
                HopReport::empty(HopOutcome::Failed)
            }
        }
    }

    pub async fn hop_path(
        &self,
        ctx: &RequestContext,
        path: &HoppingPath,
        source_ids: Vec<DocumentId>,
        filter: FilterMap,
        limit: Option<usize>,
    ) -> SearchResult {
        let req = HopRequest::along(path, source_ids)
            .with_filter(filter)
            .with_limit(limit);
        self.hop(ctx, &req).await
    }

    /// Walk every link of `chain`; `filter` and `limit` apply to the last one.
    /// Stops at the first link that joins nothing; `link` in the report is
    /// that link's index.
    pub async fn hop_chain(
        &self,
        ctx: &RequestContext,
        chain: &[HoppingPath],
        source_ids: Vec<DocumentId>,
        filter: FilterMap,
        limit: Option<usize>,
    ) -> HopReport {
        let mut ids = source_ids;
        let mut last = HopReport::empty(HopOutcome::NoSources);
        for (i, link) in chain.iter().enumerate() {
            let is_last = i + 1 == chain.len();
            let req = if is_last {
                HopRequest::along(link, ids).with_filter(filter.clone()).with_limit(limit)
            } else {
                HopRequest::along(link, ids)
            };
            last = self.run(ctx, &req).await;
            last.link = i;
            if last.outcome != HopOutcome::Joined {
                debug!(link = %link, hop = i, outcome = last.outcome.as_str(), "hop chain broken");
                return last;
            }
            let id_field = self
                .registry
                .get_schema(&link.to)
                .map(|s| s.id_field.as_str())
                .unwrap_or("_id");
            ids = document_ids(&last.result.documents, id_field);
        }
        last
    }

    // Re-verifies the source ids under the tenant and returns the values
    // the target's via field is matched against.
    async fn join_keys(
        &self,
        ctx: &RequestContext,
        src: &CollectionSchema,
        req: &HopRequest,
    ) -> Result<Vec<JsonValue>, EngineError> {
        let source_field = req.source_field.as_deref().unwrap_or(&src.id_field);
        let requested: Vec<JsonValue> = req
            .source_ids
            .iter()
            .map(|id| JsonValue::String(id.clone()))
            .collect();
        if !src.is_tenant_scoped() && source_field == src.id_field {
            return Ok(key_variants(&requested));
        }

        let filter = Filter::field(src.id_field.clone(), Operator::In, JsonValue::Array(key_variants(&requested)))
            .and(tenant_filter(src, &ctx.tenant_id));
        let found = self
            .store
            .find(
                &src.name,
                FindRequest::new(filter).project(&[src.id_field.as_str(), source_field]),
            )
            .await?;

        let verified: HashSet<String> = found.iter().filter_map(|d| d.id(&src.id_field)).collect();
        let rejected = req
            .source_ids
            .iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|id| !verified.contains(*id))
            .count();
        if rejected > 0 {
            HOP_TOTAL.with_label_values(&["rejected"]).inc();
            let err = EngineError::UnauthorizedAccess {
                collection: src.name.clone(),
                tenant: ctx.tenant_id.clone(),
                rejected,
            };
            warn!(request_id = %ctx.request_id, error = %err, "dropping unverified source ids");
        }

        let mut raw = Vec::new();
        for doc in &found {
            match doc.get(source_field) {
                Some(JsonValue::Array(items)) => raw.extend(items.iter().cloned()),
                Some(JsonValue::Null) | None => {}
                Some(v) => raw.push(v.clone()),
            }
        }
        Ok(key_variants(&raw))
    }
}

/// String ids of `docs`, in order, without duplicates.
pub fn document_ids(docs: &[Document], id_field: &str) -> Vec<DocumentId> {
    let mut seen = HashSet::new();
    docs.iter()
        .filter_map(|d| d.id(id_field))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

// Stores may keep the same key as a string or a number; match both spellings.
fn key_variants(values: &[JsonValue]) -> Vec<JsonValue> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut push = |v: JsonValue, out: &mut Vec<JsonValue>| {
        if seen.insert(v.to_string()) {
            out.push(v);
        }
    };
    for v in values {
        match v {
            JsonValue::String(s) => {
                push(v.clone(), &mut out);
                if let Ok(n) = s.parse::<i64>() {
                    push(JsonValue::from(n), &mut out);
                }
            }
            JsonValue::Number(n) => {
                push(v.clone(), &mut out);
                push(JsonValue::String(n.to_string()), &mut out);
            }
            other => {
                if let Some(s) = id_string(other) {
                    push(JsonValue::String(s), &mut out);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_variants_cover_both_spellings() {
        let keys = key_variants(&[json!("7"), json!(7), json!("abc"), json!({"$oid": "ff"})]);
        assert_eq!(keys, vec![json!("7"), json!(7), json!("abc"), json!("ff")]);
    }

    #[test]
    fn document_ids_dedupe_in_order() {
        let docs: Vec<Document> = vec![
            json!({"_id": "b"}).into(),
            json!({"_id": "a"}).into(),
            json!({"_id": "b"}).into(),
            json!({"name": "no id"}).into(),
        ];
        assert_eq!(document_ids(&docs, "_id"), vec!["b", "a"]);
    }
}
