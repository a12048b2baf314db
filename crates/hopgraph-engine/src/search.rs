//! Search fusion engine.
//!
//! One entry point, [`SearchEngine::search`], picks a mode from what the query
//! carries (first match wins):
//!
//! 1. metadata, when the sanitized filter has a non-tenant clause or a sort
//!    key survives sanitation
//! 2. hybrid, when both vector and text query text are present
//! 3. vector
//! 4. text
//! 5. metadata with the tenant filter only
//!
//! Store and index failures degrade to fallbacks and finally to an empty
//! result with confidence 0. Embedding failures are hard errors outside
//! hybrid mode. `skip` pages the store query in metadata mode and the ranked
//! list in the other modes.

use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::embed::Embedder;
use crate::fusion::{fuse, normalize_by_max};
use crate::metrics::{SEARCH_FALLBACK_TOTAL, SEARCH_MODE_TOTAL};
use crate::sanitize::{scope_to_tenant, FilterSanitizer};
use hopgraph_core::util::cosine_sim;
use hopgraph_core::{
    CollectionSchema, EngineError, Filter, Operator, Result, SchemaRegistry, ScoredDocument,
    SearchMethod, SearchQuery, SearchResult, SortKey,
};
use hopgraph_storage::{DocumentStore, FindRequest, TextSearchRequest, VectorSearchRequest};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// Confidence reported for substring-fallback hits.
const SUBSTRING_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Default)]
struct Ranked {
    hits: Vec<ScoredDocument>,
    confidence: f32,
}

impl Ranked {
    fn into_result(self, method: SearchMethod) -> SearchResult {
        let documents: Vec<_> = self.hits.into_iter().map(|h| h.document).collect();
        SearchResult {
            total: documents.len(),
            documents,
            method,
            confidence: self.confidence,
        }
    }
}

#[derive(Clone)]
pub struct SearchEngine {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn DocumentStore>,
    embedder: Arc<dyn Embedder>,
    sanitizer: FilterSanitizer,
    config: EngineConfig,
}

impl SearchEngine {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn Embedder>,
        config: EngineConfig,
    ) -> Self {
        Self {
            sanitizer: FilterSanitizer::from_config(&config),
            registry,
            store,
            embedder,
            config,
        }
    }

    pub fn sanitizer(&self) -> &FilterSanitizer {
        &self.sanitizer
    }

    /// The tenant comes from `ctx`; a query naming a different tenant is rejected.
    pub async fn search(&self, ctx: &RequestContext, query: &SearchQuery) -> Result<SearchResult> {
        let schema = self
            .registry
            .get_schema(&query.collection)
            .ok_or_else(|| EngineError::SchemaNotFound(query.collection.clone()))?;
        if !query.tenant_id.is_empty() && query.tenant_id != ctx.tenant_id {
            return Err(EngineError::UnauthorizedAccess {
                collection: query.collection.clone(),
                tenant: ctx.tenant_id.clone(),
                rejected: 0,
            });
        }

        let sanitized = self.sanitizer.sanitize(schema, &query.filter);
        let has_clauses = sanitized.filter != Filter::All;
        let scoped = scope_to_tenant(schema, &ctx.tenant_id, sanitized.filter);
        let sort = self.sanitizer.sanitize_sort(schema, &query.sort).keys;
        let limit = query.limit.unwrap_or(self.config.default_limit);
        let skip = query.skip.unwrap_or(0);
        // ranked modes fetch the skipped prefix too and drop it afterwards
        let window = limit.saturating_add(skip);

        let vector_text = non_blank(query.vector_query.as_deref()).filter(|_| {
            let usable = schema.embedding_field.is_some();
            if !usable {
                debug!(collection = %schema.name, "vector query ignored, no embedding field");
            }
            usable
        });
        let text = non_blank(query.text_query.as_deref());

        let method = if has_clauses || !sort.is_empty() {
            SearchMethod::Metadata
        } else {
            match (vector_text, text) {
                (Some(_), Some(_)) => SearchMethod::Hybrid,
                (Some(_), None) => SearchMethod::Vector,
                (None, Some(_)) => SearchMethod::Text,
                (None, None) => SearchMethod::Metadata,
            }
        };
        SEARCH_MODE_TOTAL.with_label_values(&[method.as_str()]).inc();
        debug!(
            request_id = %ctx.request_id,
            collection = %schema.name,
            mode = method.as_str(),
            limit,
            "search"
        );

        let result = match method {
            SearchMethod::Metadata => {
                return Ok(self.metadata(schema, scoped, sort, skip, limit).await)
            }
            SearchMethod::Vector => self
                .vector(schema, &scoped, vector_text.unwrap_or_default(), window)
                .await?
                .into_result(SearchMethod::Vector),
            SearchMethod::Text => self
                .text(schema, &scoped, text.unwrap_or_default(), window)
                .await
                .into_result(SearchMethod::Text),
            SearchMethod::Hybrid => {
                self.hybrid(
                    schema,
                    &scoped,
                    vector_text.unwrap_or_default(),
                    text.unwrap_or_default(),
                    window,
                )
                .await
            }
        };
        Ok(skip_ranked(result, skip))
    }

    async fn metadata(
        &self,
        schema: &CollectionSchema,
        filter: Filter,
        sort: Vec<SortKey>,
        skip: usize,
        limit: usize,
    ) -> SearchResult {
        let req = FindRequest {
            filter: filter.clone(),
            sort,
            skip,
            limit: Some(limit),
            projection: None,
        };
        let documents = match self.store.find(&schema.name, req).await {
            Ok(d) => d,
            Err(e) => {
                warn!(collection = %schema.name, error = %e, "metadata search failed");
                return SearchResult::empty(SearchMethod::Metadata);
            }
        };
        let total = match self.store.count(&schema.name, &filter).await {
            Ok(n) => n.max(documents.len()),
            Err(e) => {
                warn!(collection = %schema.name, error = %e, "count failed");
                documents.len()
            }
        };
        SearchResult {
            confidence: if documents.is_empty() { 0.0 } else { 1.0 },
            total,
            documents,
            method: SearchMethod::Metadata,
        }
    }

    async fn vector(
        &self,
        schema: &CollectionSchema,
        filter: &Filter,
        text: &str,
        limit: usize,
    ) -> Result<Ranked> {
        let Some(field) = schema.embedding_field.as_deref() else {
            return Ok(Ranked::default());
        };
        let embedding = self
            .embedder
            .embed(text)
            .await
            .map_err(|e| EngineError::Embedding(e.to_string()))?;

        if schema.vector_index {
            let req = VectorSearchRequest {
                field: field.to_string(),
                embedding: embedding.clone(),
                filter: filter.clone(),
                top_k: limit,
            };
            match self.store.vector_search(&schema.name, req).await {
                Ok(hits) => return Ok(ranked_by_mean(hits)),
                Err(e) => {
                    warn!(collection = %schema.name, error = %e, "vector index failed, scanning");
                }
            }
        }
        SEARCH_FALLBACK_TOTAL.with_label_values(&["vector_scan"]).inc();
        Ok(self.vector_scan(schema, field, filter, &embedding, limit).await)
    }

    async fn vector_scan(
        &self,
        schema: &CollectionSchema,
        field: &str,
        filter: &Filter,
        embedding: &[f32],
        limit: usize,
    ) -> Ranked {
        let req = FindRequest::new(filter.clone()).limit(self.config.vector_candidate_limit);
        let candidates = match self.store.find(&schema.name, req).await {
            Ok(d) => d,
            Err(e) => {
                warn!(collection = %schema.name, error = %e, "vector scan failed");
                return Ranked::default();
            }
        };
        let mut hits: Vec<ScoredDocument> = candidates
            .into_iter()
            .filter_map(|doc| {
                let v = doc.vector(field)?;
                if v.len() != embedding.len() {
                    return None;
                }
                let score = cosine_sim(&v, embedding).clamp(0.0, 1.0);
                Some(ScoredDocument {
                    document: doc,
                    score,
                })
            })
            .collect();
        sort_hits(&mut hits, &schema.id_field);
        hits.truncate(limit);
        ranked_by_mean(hits)
    }

    async fn text(
        &self,
        schema: &CollectionSchema,
        filter: &Filter,
        text: &str,
        limit: usize,
    ) -> Ranked {
        if schema.text_index {
            let req = TextSearchRequest {
                text: text.to_string(),
                filter: filter.clone(),
                limit,
            };
            match self.store.text_search(&schema.name, req).await {
                Ok(mut hits) => {
                    normalize_by_max(&mut hits);
                    return ranked_by_mean(hits);
                }
                Err(e) => {
                    warn!(collection = %schema.name, error = %e, "text index failed, matching substrings");
                }
            }
        }
        SEARCH_FALLBACK_TOTAL.with_label_values(&["substring"]).inc();
        self.substring(schema, filter, text, limit).await
    }

    // Case-insensitive substring OR across string fields; each hit is scored
    // by the importance of the fields it matched in.
    async fn substring(
        &self,
        schema: &CollectionSchema,
        filter: &Filter,
        text: &str,
        limit: usize,
    ) -> Ranked {
        let fields = schema.text_fields();
        if fields.is_empty() {
            debug!(collection = %schema.name, "no string fields for substring search");
            return Ranked::default();
        }
        let needle = text.trim().to_lowercase();
        let pattern = format!("(?i){}", regex::escape(text.trim()));
        let any_field = Filter::or(
            fields
                .iter()
                .map(|f| Filter::field(f.name.clone(), Operator::Regex, JsonValue::String(pattern.clone())))
                .collect(),
        );
        let req = FindRequest::new(filter.clone().and(any_field))
            .limit(self.config.vector_candidate_limit.max(limit));
        let docs = match self.store.find(&schema.name, req).await {
            Ok(d) => d,
            Err(e) => {
                warn!(collection = %schema.name, error = %e, "substring search failed");
                return Ranked::default();
            }
        };
        let mut hits: Vec<ScoredDocument> = docs
            .into_iter()
            .map(|doc| {
                let score: f32 = fields
                    .iter()
                    .filter(|f| {
                        doc.get(&f.name)
                            .and_then(JsonValue::as_str)
                            .map(|s| s.to_lowercase().contains(&needle))
                            .unwrap_or(false)
                    })
                    .map(|f| f.importance.weight())
                    .sum();
                ScoredDocument {
                    document: doc,
                    score,
                }
            })
            .collect();
        sort_hits(&mut hits, &schema.id_field);
        hits.truncate(limit);
        normalize_by_max(&mut hits);
        Ranked {
            confidence: if hits.is_empty() { 0.0 } else { SUBSTRING_CONFIDENCE },
            hits,
        }
    }

    async fn hybrid(
        &self,
        schema: &CollectionSchema,
        filter: &Filter,
        vector_text: &str,
        text: &str,
        limit: usize,
    ) -> SearchResult {
        let vector = match self.vector(schema, filter, vector_text, limit).await {
            Ok(r) => r,
            Err(e) => {
                warn!(collection = %schema.name, error = %e, "vector side of hybrid failed");
                Ranked::default()
            }
        };
        let textual = self.text(schema, filter, text, limit).await;
        let fused = fuse(
            &vector.hits,
            &textual.hits,
            self.config.vector_weight,
            &schema.id_field,
            limit,
        );
        let documents: Vec<_> = fused.into_iter().map(|f| f.document).collect();
        SearchResult {
            total: documents.len(),
            documents,
            method: SearchMethod::Hybrid,
            confidence: (vector.confidence + textual.confidence) / 2.0,
        }
    }
}

// `total` keeps counting the skipped hits.
fn skip_ranked(mut result: SearchResult, skip: usize) -> SearchResult {
    let n = skip.min(result.documents.len());
    result.documents.drain(..n);
    result
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.filter(|t| !t.trim().is_empty())
}

fn ranked_by_mean(hits: Vec<ScoredDocument>) -> Ranked {
    let confidence = if hits.is_empty() {
        0.0
    } else {
        (hits.iter().map(|h| h.score).sum::<f32>() / hits.len() as f32).clamp(0.0, 1.0)
    };
    Ranked { hits, confidence }
}

fn sort_hits(hits: &mut [ScoredDocument], id_field: &str) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.document.id(id_field).cmp(&b.document.id(id_field)))
    });
}
