use hopgraph_core::{
    AggregateSpec, Document, EngineError, Filter, Result, ScoredDocument, SortKey,
};

#[derive(Debug, Clone, Default)]
pub struct FindRequest {
    pub filter: Filter,
    pub sort: Vec<SortKey>,
    pub skip: usize,
    pub limit: Option<usize>,
    // None returns whole documents
    pub projection: Option<Vec<String>>,
}

impl FindRequest {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn project(mut self, fields: &[&str]) -> Self {
        self.projection = Some(fields.iter().map(|s| s.to_string()).collect());
        self
    }
}

#[derive(Debug, Clone)]
pub struct VectorSearchRequest {
    pub field: String,
    pub embedding: Vec<f32>,
    pub filter: Filter,
    pub top_k: usize,
}

#[derive(Debug, Clone)]
pub struct TextSearchRequest {
    pub text: String,
    pub filter: Filter,
    pub limit: usize,
}

/// Document-store driver. Everything the engine needs from a backing store:
/// filtered reads, counts, grouping, and the two optional index operations.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn find(&self, collection: &str, req: FindRequest) -> Result<Vec<Document>>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<usize>;

    async fn aggregate(
        &self,
        collection: &str,
        filter: &Filter,
        spec: &AggregateSpec,
    ) -> Result<Vec<Document>>;

    // Nearest-neighbour search; scores are similarities in [0, 1].
    async fn vector_search(
        &self,
        collection: &str,
        _req: VectorSearchRequest,
    ) -> Result<Vec<ScoredDocument>> {
        Err(EngineError::IndexUnavailable {
            collection: collection.to_string(),
            kind: "vector".into(),
        })
    }

    // Full-text search; scores are raw relevance, higher is better.
    async fn text_search(
        &self,
        collection: &str,
        _req: TextSearchRequest,
    ) -> Result<Vec<ScoredDocument>> {
        Err(EngineError::IndexUnavailable {
            collection: collection.to_string(),
            kind: "text".into(),
        })
    }
}
