use crate::traits::{DocumentStore, FindRequest, TextSearchRequest, VectorSearchRequest};
use hopgraph_core::util::{cosine_sim, tokenize};
use hopgraph_core::{
    AggregateOp, AggregateSpec, Document, EngineError, Filter, Operator, Result, SchemaRegistry,
    ScoredDocument, SortKey, SortOrder,
};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use prometheus::{register_histogram_vec, HistogramVec};
use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

static VECTOR_QUERY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "hopgraph_store_vector_query_seconds",
        "In-memory vector index latency",
        &["collection"]
    )
    .unwrap()
});

/// Reference driver: every collection is a vector of documents, with an
/// optional cosine vector index and an inverted term index per collection.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    data: HashMap<String, Vec<Document>>,
    // collection -> embedding field
    vector_indexes: HashMap<String, String>,
    // collection -> indexed text fields
    text_fields: HashMap<String, Vec<String>>,
    // (collection, term) -> doc position -> term frequency
    term_index: HashMap<(String, String), BTreeMap<usize, u32>>,
}

impl Inner {
    fn index_terms(&mut self, collection: &str, pos: usize) {
        let Some(fields) = self.text_fields.get(collection).cloned() else {
            return;
        };
        let Some(doc) = self.data.get(collection).and_then(|d| d.get(pos)) else {
            return;
        };
        let mut tf: HashMap<String, u32> = HashMap::new();
        for f in &fields {
            for text in string_values(doc.get(f)) {
                for term in tokenize(text) {
                    *tf.entry(term).or_default() += 1;
                }
            }
        }
        for (term, count) in tf {
            self.term_index
                .entry((collection.to_string(), term))
                .or_default()
                .insert(pos, count);
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, collection: &str, doc: Document) {
        let mut inner = self.inner.write();
        let docs = inner.data.entry(collection.to_string()).or_default();
        docs.push(doc);
        let pos = docs.len() - 1;
        inner.index_terms(collection, pos);
    }

    pub fn insert_many(&self, collection: &str, docs: impl IntoIterator<Item = Document>) {
        for d in docs {
            self.insert(collection, d);
        }
    }

    /// Serve `vector_search` for `collection` from embeddings stored in `field`.
    pub fn enable_vector_index(&self, collection: &str, field: &str) {
        self.inner
            .write()
            .vector_indexes
            .insert(collection.to_string(), field.to_string());
    }

    /// Build the inverted index over `fields`, covering documents already present.
    pub fn enable_text_index(&self, collection: &str, fields: &[String]) {
        let mut inner = self.inner.write();
        inner
            .text_fields
            .insert(collection.to_string(), fields.to_vec());
        inner
            .term_index
            .retain(|(c, _), _| c.as_str() != collection);
        let n = inner.data.get(collection).map(|d| d.len()).unwrap_or(0);
        for pos in 0..n {
            inner.index_terms(collection, pos);
        }
    }

    /// Build the vector and text indexes each collection schema declares.
    /// Text indexes cover the searchable fields, or every string field when none are listed.
    pub fn apply_schema(&self, registry: &SchemaRegistry) {
        for schema in registry.collections() {
            if let (true, Some(field)) = (schema.vector_index, schema.embedding_field.as_deref()) {
                self.enable_vector_index(&schema.name, field);
            }
            if schema.text_index {
                let fields: Vec<String> = if schema.searchable_fields.is_empty() {
                    schema.text_fields().iter().map(|f| f.name.clone()).collect()
                } else {
                    schema.searchable_fields.clone()
                };
                self.enable_text_index(&schema.name, &fields);
            }
            tracing::debug!(
                collection = %schema.name,
                vector = schema.vector_index,
                text = schema.text_index,
                "indexes applied"
            );
        }
    }

    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().data.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self, collection: &str) -> usize {
        self.inner
            .read()
            .data
            .get(collection)
            .map(|d| d.len())
            .unwrap_or(0)
    }

    pub fn all_documents(&self, collection: &str) -> Vec<Document> {
        self.inner
            .read()
            .data
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryStore {
    async fn find(&self, collection: &str, req: FindRequest) -> Result<Vec<Document>> {
        let m = Matcher::compile(&req.filter, collection)?;
        let inner = self.inner.read();
        let mut out: Vec<Document> = inner
            .data
            .get(collection)
            .map(|docs| docs.iter().filter(|d| m.matches(d)).cloned().collect())
            .unwrap_or_default();
        drop(inner);
        if !req.sort.is_empty() {
            out.sort_by(|a, b| compare_docs(a, b, &req.sort));
        }
        let mut out: Vec<Document> = out.into_iter().skip(req.skip).collect();
        if let Some(l) = req.limit {
            out.truncate(l);
        }
        if let Some(fields) = &req.projection {
            out = out.into_iter().map(|d| project(d, fields)).collect();
        }
        Ok(out)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<usize> {
        let m = Matcher::compile(filter, collection)?;
        let inner = self.inner.read();
        Ok(inner
            .data
            .get(collection)
            .map(|docs| docs.iter().filter(|d| m.matches(d)).count())
            .unwrap_or(0))
    }

    async fn aggregate(
        &self,
        collection: &str,
        filter: &Filter,
        spec: &AggregateSpec,
    ) -> Result<Vec<Document>> {
        let rows = self.find(collection, FindRequest::new(filter.clone())).await?;
        // groups keep first-seen order
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, (JsonValue, Vec<&Document>)> = HashMap::new();
        for d in &rows {
            let key_val = match &spec.group_by {
                Some(f) => d.get(f).cloned().unwrap_or(JsonValue::Null),
                None => JsonValue::Null,
            };
            let key = key_val.to_string();
            let entry = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                (key_val, Vec::new())
            });
            entry.1.push(d);
        }
        let mut out = Vec::with_capacity(order.len());
        for key in order {
            let Some((key_val, members)) = groups.remove(&key) else {
                continue;
            };
            let mut row = Document::new();
            row.insert("_id", key_val);
            for metric in &spec.metrics {
                let v = compute_metric(metric.op, metric.field.as_deref(), &members);
                row.insert(metric.alias.clone(), v);
            }
            out.push(row);
        }
        Ok(out)
    }

    async fn vector_search(
        &self,
        collection: &str,
        req: VectorSearchRequest,
    ) -> Result<Vec<ScoredDocument>> {
        let field = self
            .inner
            .read()
            .vector_indexes
            .get(collection)
            .cloned()
            .ok_or_else(|| EngineError::IndexUnavailable {
                collection: collection.to_string(),
                kind: "vector".into(),
            })?;
        if field != req.field {
            return Err(EngineError::search(
                collection,
                format!("vector index is on {field}, not {}", req.field),
            ));
        }
        let _timer = VECTOR_QUERY_SECONDS
            .with_label_values(&[collection])
            .start_timer();
        let m = Matcher::compile(&req.filter, collection)?;
        let inner = self.inner.read();
        let mut scored: Vec<ScoredDocument> = Vec::new();
        for d in inner.data.get(collection).into_iter().flatten() {
            if !m.matches(d) {
                continue;
            }
            if let Some(v) = d.vector(&field) {
                if v.len() == req.embedding.len() {
                    scored.push(ScoredDocument {
                        document: d.clone(),
                        score: cosine_sim(&v, &req.embedding).max(0.0),
                    });
                }
            }
        }
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        scored.truncate(req.top_k);
        Ok(scored)
    }

    async fn text_search(
        &self,
        collection: &str,
        req: TextSearchRequest,
    ) -> Result<Vec<ScoredDocument>> {
        let inner = self.inner.read();
        if !inner.text_fields.contains_key(collection) {
            return Err(EngineError::IndexUnavailable {
                collection: collection.to_string(),
                kind: "text".into(),
            });
        }
        let m = Matcher::compile(&req.filter, collection)?;
        let mut scores: BTreeMap<usize, f32> = BTreeMap::new();
        for term in tokenize(&req.text) {
            if let Some(postings) = inner.term_index.get(&(collection.to_string(), term)) {
                for (pos, tf) in postings {
                    *scores.entry(*pos).or_default() += *tf as f32;
                }
            }
        }
        let docs = inner.data.get(collection);
        let mut scored: Vec<ScoredDocument> = scores
            .into_iter()
            .filter_map(|(pos, score)| {
                let d = docs?.get(pos)?;
                m.matches(d).then(|| ScoredDocument {
                    document: d.clone(),
                    score,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        scored.truncate(req.limit);
        Ok(scored)
    }
}

enum Matcher {
    All,
    And(Vec<Matcher>),
    Or(Vec<Matcher>),
    Field {
        field: String,
        op: Operator,
        value: JsonValue,
        regex: Option<Regex>,
    },
}

impl Matcher {
    fn compile(f: &Filter, collection: &str) -> Result<Self> {
        Ok(match f {
            Filter::All => Matcher::All,
            Filter::And { clauses } => Matcher::And(
                clauses
                    .iter()
                    .map(|c| Self::compile(c, collection))
                    .collect::<Result<_>>()?,
            ),
            Filter::Or { clauses } => Matcher::Or(
                clauses
                    .iter()
                    .map(|c| Self::compile(c, collection))
                    .collect::<Result<_>>()?,
            ),
            Filter::Field { field, op, value } => {
                let regex = if *op == Operator::Regex {
                    let pattern = value.as_str().ok_or_else(|| {
                        EngineError::search(collection, format!("regex on {field} is not a string"))
                    })?;
                    Some(Regex::new(pattern).map_err(|e| EngineError::search(collection, e))?)
                } else {
                    None
                };
                Matcher::Field {
                    field: field.clone(),
                    op: *op,
                    value: value.clone(),
                    regex,
                }
            }
        })
    }

    fn matches(&self, doc: &Document) -> bool {
        match self {
            Matcher::All => true,
            Matcher::And(ms) => ms.iter().all(|m| m.matches(doc)),
            Matcher::Or(ms) => ms.iter().any(|m| m.matches(doc)),
            Matcher::Field {
                field,
                op,
                value,
                regex,
            } => eval(*op, value, regex.as_ref(), doc.get(field)),
        }
    }
}

fn eval(op: Operator, value: &JsonValue, regex: Option<&Regex>, actual: Option<&JsonValue>) -> bool {
    let actual = actual.filter(|a| !a.is_null());
    match op {
        Operator::Exists => actual.is_some() == value.as_bool().unwrap_or(true),
        Operator::Eq => actual.map_or(value.is_null(), |a| eq_or_contains(a, value)),
        Operator::Ne => !actual.map_or(value.is_null(), |a| eq_or_contains(a, value)),
        Operator::In => match (actual, value.as_array()) {
            (Some(a), Some(vs)) => vs.iter().any(|v| eq_or_contains(a, v)),
            _ => false,
        },
        Operator::Nin => match (actual, value.as_array()) {
            (Some(a), Some(vs)) => !vs.iter().any(|v| eq_or_contains(a, v)),
            _ => true,
        },
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            match actual.and_then(|a| compare_json(a, value)) {
                Some(ord) => match op {
                    Operator::Gt => ord == Ordering::Greater,
                    Operator::Gte => ord != Ordering::Less,
                    Operator::Lt => ord == Ordering::Less,
                    _ => ord != Ordering::Greater,
                },
                None => false,
            }
        }
        Operator::Regex => match regex {
            Some(re) => string_values(actual).iter().any(|s| re.is_match(s)),
            None => false,
        },
    }
}

fn json_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

// Array-valued fields match when any element matches.
fn eq_or_contains(actual: &JsonValue, v: &JsonValue) -> bool {
    match actual {
        JsonValue::Array(items) if !v.is_array() => items.iter().any(|i| json_eq(i, v)),
        _ => json_eq(actual, v),
    }
}

fn compare_json(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compare_docs(a: &Document, b: &Document, keys: &[SortKey]) -> Ordering {
    for k in keys {
        let ord = match (a.get(&k.field), b.get(&k.field)) {
            (Some(x), Some(y)) => {
                let o = compare_json(x, y).unwrap_or(Ordering::Equal);
                match k.order {
                    SortOrder::Asc => o,
                    SortOrder::Desc => o.reverse(),
                }
            }
            // missing values sort last in either direction
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn string_values(v: Option<&JsonValue>) -> Vec<&str> {
    match v {
        Some(JsonValue::String(s)) => vec![s.as_str()],
        Some(JsonValue::Array(items)) => items.iter().filter_map(|i| i.as_str()).collect(),
        _ => Vec::new(),
    }
}

fn project(doc: Document, fields: &[String]) -> Document {
    let mut map = Map::new();
    for f in fields {
        if let Some(v) = doc.0.get(f) {
            map.insert(f.clone(), v.clone());
        }
    }
    Document(map)
}

fn compute_metric(op: AggregateOp, field: Option<&str>, members: &[&Document]) -> JsonValue {
    if op == AggregateOp::Count {
        return JsonValue::from(members.len());
    }
    let nums: Vec<f64> = match field {
        Some(f) => members
            .iter()
            .filter_map(|d| d.get(f).and_then(|v| v.as_f64()))
            .collect(),
        None => Vec::new(),
    };
    if nums.is_empty() {
        return JsonValue::Null;
    }
    let v = match op {
        AggregateOp::Sum => nums.iter().sum(),
        AggregateOp::Avg => nums.iter().sum::<f64>() / nums.len() as f64,
        AggregateOp::Min => nums.iter().cloned().fold(f64::INFINITY, f64::min),
        AggregateOp::Max => nums.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        AggregateOp::Count => members.len() as f64,
    };
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: JsonValue) -> Document {
        Document::from(v)
    }

    #[test]
    fn eval_operators() {
        let d = doc(json!({"n": 5, "s": "Acme", "tags": ["a", "b"], "nil": null}));
        let run = |f: Filter| Matcher::compile(&f, "t").unwrap().matches(&d);
        assert!(run(Filter::eq("n", 5.0)));
        assert!(run(Filter::field("n", Operator::Gte, json!(5))));
        assert!(!run(Filter::field("n", Operator::Gt, json!(5))));
        assert!(run(Filter::eq("tags", "b")));
        assert!(run(Filter::is_in("s", ["Acme", "Globex"])));
        assert!(run(Filter::field("missing", Operator::Nin, json!(["x"]))));
        assert!(run(Filter::field("s", Operator::Regex, json!("(?i)^acm"))));
        assert!(!run(Filter::field("nil", Operator::Exists, json!(true))));
        assert!(run(Filter::field("missing", Operator::Ne, json!(1))));
    }

    #[test]
    fn bad_regex_is_search_failure() {
        let err = Matcher::compile(&Filter::field("s", Operator::Regex, json!("(")), "t")
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::SearchExecutionFailure { .. }));
    }

    #[tokio::test]
    async fn find_sorts_skips_and_limits() {
        let store = InMemoryStore::new();
        for (i, n) in [3, 1, 2].iter().enumerate() {
            store.insert("c", doc(json!({"_id": i, "n": n})));
        }
        store.insert("c", doc(json!({"_id": 9})));
        let req = FindRequest {
            sort: vec![SortKey {
                field: "n".into(),
                order: SortOrder::Asc,
            }],
            skip: 1,
            limit: Some(2),
            ..Default::default()
        };
        let out = store.find("c", req).await.unwrap();
        let ns: Vec<_> = out.iter().map(|d| d.get("n").cloned()).collect();
        assert_eq!(ns, vec![Some(json!(2)), Some(json!(3))]);
    }

    #[tokio::test]
    async fn aggregate_groups_in_first_seen_order() {
        let store = InMemoryStore::new();
        store.insert("c", doc(json!({"industry": "saas", "arr": 10})));
        store.insert("c", doc(json!({"industry": "fintech", "arr": 4})));
        store.insert("c", doc(json!({"industry": "saas", "arr": 20})));
        let spec: AggregateSpec = serde_json::from_value(json!({
            "group_by": "industry",
            "metrics": [{"op": "count", "alias": "n"}, {"op": "avg", "field": "arr", "alias": "avg_arr"}]
        }))
        .unwrap();
        let rows = store.aggregate("c", &Filter::All, &spec).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("_id"), Some(&json!("saas")));
        assert_eq!(rows[0].get("n"), Some(&json!(2)));
        assert_eq!(rows[0].get("avg_arr"), Some(&json!(15.0)));
    }

    #[tokio::test]
    async fn indexes_are_optional() {
        let store = InMemoryStore::new();
        store.insert("c", doc(json!({"bio": "rust systems engineer", "emb": [1.0, 0.0]})));
        let vreq = VectorSearchRequest {
            field: "emb".into(),
            embedding: vec![1.0, 0.0],
            filter: Filter::All,
            top_k: 5,
        };
        assert!(matches!(
            store.vector_search("c", vreq.clone()).await,
            Err(EngineError::IndexUnavailable { .. })
        ));
        store.enable_vector_index("c", "emb");
        let hits = store.vector_search("c", vreq).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);

        store.enable_text_index("c", &["bio".to_string()]);
        let treq = TextSearchRequest {
            text: "Rust engineer".into(),
            filter: Filter::All,
            limit: 5,
        };
        let hits = store.text_search("c", treq).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 2.0);
    }

    #[tokio::test]
    async fn declared_indexes_are_built_from_schema() {
        use hopgraph_core::{CollectionSchema, FieldDefinition, FieldType};
        let registry = SchemaRegistry::new(vec![
            CollectionSchema::new("people")
                .field_def(FieldDefinition::new("bio", FieldType::String))
                .embedding("emb", true)
                .with_text_index(),
            CollectionSchema::new("plain"),
        ])
        .unwrap();
        let store = InMemoryStore::new();
        store.insert("people", doc(json!({"bio": "graph databases", "emb": [0.0, 1.0]})));
        store.apply_schema(&registry);

        let treq = TextSearchRequest {
            text: "graph".into(),
            filter: Filter::All,
            limit: 5,
        };
        assert_eq!(store.text_search("people", treq.clone()).await.unwrap().len(), 1);
        assert!(store.text_search("plain", treq).await.is_err());
        let vreq = VectorSearchRequest {
            field: "emb".into(),
            embedding: vec![0.0, 1.0],
            filter: Filter::All,
            top_k: 1,
        };
        assert_eq!(store.vector_search("people", vreq).await.unwrap().len(), 1);
    }
}
