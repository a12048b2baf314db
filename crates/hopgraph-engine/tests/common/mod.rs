#![allow(dead_code)]

use hopgraph_core::{
    AggregateSpec, Cardinality, CollectionSchema, Document, EngineError, FieldDefinition,
    FieldType, Filter, Result, SchemaRegistry, ScoredDocument,
};
use hopgraph_engine::{Engine, EngineConfig, HashingEmbedder};
use hopgraph_storage::{
    DocumentStore, FindRequest, InMemoryStore, TextSearchRequest, VectorSearchRequest,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

pub fn registry() -> Arc<SchemaRegistry> {
    Arc::new(
        SchemaRegistry::new(vec![
            CollectionSchema::new("companies")
                .owned_by("userId")
                .field_def(FieldDefinition::new("name", FieldType::String))
                .field_def(FieldDefinition::new("industry", FieldType::String))
                .relate("_id", "employees", Cardinality::OneToMany, Some("companyId")),
            CollectionSchema::new("employees")
                .owned_by("userId")
                .field_def(FieldDefinition::new("companyId", FieldType::Identifier))
                .field_def(FieldDefinition::new("title", FieldType::String))
                .relate(
                    "_id",
                    "gtm_persona_intelligence",
                    Cardinality::OneToOne,
                    Some("employeeId"),
                ),
            CollectionSchema::new("gtm_persona_intelligence")
                .owned_by("userId")
                .field_def(FieldDefinition::new("employeeId", FieldType::Identifier))
                .field_def(FieldDefinition::new("persona", FieldType::String)),
        ])
        .unwrap(),
    )
}

/// Two tenants; `e5` belongs to u2 but points at u1's company `c1`.
pub fn seeded_store() -> InMemoryStore {
    let store = InMemoryStore::new();
    for doc in [
        json!({"_id": "c1", "userId": "u1", "name": "Acme", "industry": "SaaS"}),
        json!({"_id": "c2", "userId": "u1", "name": "Globex", "industry": "Shipping"}),
        json!({"_id": "c3", "userId": "u2", "name": "Rival", "industry": "SaaS"}),
    ] {
        store.insert("companies", doc.into());
    }
    for doc in [
        json!({"_id": "e1", "userId": "u1", "companyId": "c1", "title": "VP Sales"}),
        json!({"_id": "e2", "userId": "u1", "companyId": "c1", "title": "Engineer"}),
        json!({"_id": "e3", "userId": "u1", "companyId": "c2", "title": "Driver"}),
        json!({"_id": "e4", "userId": "u2", "companyId": "c3", "title": "VP Sales"}),
        json!({"_id": "e5", "userId": "u2", "companyId": "c1", "title": "Spy"}),
    ] {
        store.insert("employees", doc.into());
    }
    for doc in [
        json!({"_id": "g1", "userId": "u1", "employeeId": "e1", "persona": "Champion"}),
        json!({"_id": "g3", "userId": "u1", "employeeId": "e3", "persona": "Blocker"}),
        json!({"_id": "g4", "userId": "u2", "employeeId": "e4", "persona": "Champion"}),
    ] {
        store.insert("gtm_persona_intelligence", doc.into());
    }
    store
}

/// Records every store call by collection; optionally fails one collection.
#[derive(Clone)]
pub struct CountingStore {
    inner: InMemoryStore,
    calls: Arc<Mutex<Vec<String>>>,
    failing: Option<String>,
}

impl CountingStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            calls: Arc::new(Mutex::new(Vec::new())),
            failing: None,
        }
    }

    pub fn failing_on(mut self, collection: &str) -> Self {
        self.failing = Some(collection.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, collection: &str) -> Result<()> {
        self.calls.lock().push(collection.to_string());
        if self.failing.as_deref() == Some(collection) {
            return Err(EngineError::search(collection, "connection reset"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DocumentStore for CountingStore {
    async fn find(&self, collection: &str, req: FindRequest) -> Result<Vec<Document>> {
        self.record(collection)?;
        self.inner.find(collection, req).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<usize> {
        self.record(collection)?;
        self.inner.count(collection, filter).await
    }

    async fn aggregate(
        &self,
        collection: &str,
        filter: &Filter,
        spec: &AggregateSpec,
    ) -> Result<Vec<Document>> {
        self.record(collection)?;
        self.inner.aggregate(collection, filter, spec).await
    }

    async fn vector_search(
        &self,
        collection: &str,
        req: VectorSearchRequest,
    ) -> Result<Vec<ScoredDocument>> {
        self.record(collection)?;
        self.inner.vector_search(collection, req).await
    }

    async fn text_search(
        &self,
        collection: &str,
        req: TextSearchRequest,
    ) -> Result<Vec<ScoredDocument>> {
        self.record(collection)?;
        self.inner.text_search(collection, req).await
    }
}

pub fn engine_over(store: Arc<dyn DocumentStore>, config: EngineConfig) -> Engine {
    Engine::new(registry(), store, Arc::new(HashingEmbedder::new(32)), config).unwrap()
}

pub fn engine() -> (Engine, CountingStore) {
    let store = CountingStore::new(seeded_store());
    (
        engine_over(Arc::new(store.clone()), EngineConfig::default()),
        store,
    )
}

pub fn ids(docs: &[Document]) -> Vec<String> {
    docs.iter().filter_map(|d| d.id("_id")).collect()
}
