use crate::model::{Document, TenantId};
use crate::schema::Operator;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Raw key-value filter as produced by the planning layer, e.g.
/// `{"industry": "SaaS", "employees": {"$gte": 50}}`. It is compiled into a
/// [`Filter`] only after sanitation against the collection schema.
pub type FilterMap = Map<String, JsonValue>;

/// Typed predicate tree handed to the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Filter {
    #[default]
    All,
    And {
        clauses: Vec<Filter>,
    },
    Or {
        clauses: Vec<Filter>,
    },
    Field {
        field: String,
        op: Operator,
        value: JsonValue,
    },
}

impl Filter {
    pub fn field(field: impl Into<String>, op: Operator, value: JsonValue) -> Self {
        Filter::Field {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::field(field, Operator::Eq, value.into())
    }

    pub fn is_in<I, S>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<JsonValue>,
    {
        Self::field(
            field,
            Operator::In,
            JsonValue::Array(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Conjunction that flattens nested `And`s and drops `All`.
    pub fn and(self, other: Filter) -> Filter {
        let mut clauses = Vec::new();
        for f in [self, other] {
            match f {
                Filter::All => {}
                Filter::And { clauses: inner } => clauses.extend(inner),
                f => clauses.push(f),
            }
        }
        match clauses.len() {
            0 => Filter::All,
            1 => clauses.remove(0),
            _ => Filter::And { clauses },
        }
    }

    pub fn or(clauses: Vec<Filter>) -> Filter {
        match clauses.len() {
            0 => Filter::All,
            _ => Filter::Or { clauses },
        }
    }

    /// Every field name referenced anywhere in the tree.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::All => {}
            Filter::And { clauses } | Filter::Or { clauses } => {
                for c in clauses {
                    c.collect_fields(out);
                }
            }
            Filter::Field { field, .. } => {
                if !out.contains(&field.as_str()) {
                    out.push(field)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SearchQuery {
    pub collection: String,
    /// Empty means "the caller's tenant"; the engine never trusts this field alone.
    #[serde(default)]
    pub tenant_id: TenantId,
    #[serde(default)]
    pub filter: FilterMap,
    #[serde(default)]
    pub vector_query: Option<String>,
    #[serde(default)]
    pub text_query: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub sort: Vec<SortKey>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    Vector,
    Text,
    Metadata,
    Hybrid,
}

impl SearchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMethod::Vector => "vector",
            SearchMethod::Text => "text",
            SearchMethod::Metadata => "metadata",
            SearchMethod::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub documents: Vec<Document>,
    pub total: usize,
    pub method: SearchMethod,
    /// In [0, 1].
    pub confidence: f32,
}

impl SearchResult {
    pub fn empty(method: SearchMethod) -> Self {
        Self {
            documents: Vec::new(),
            total: 0,
            method,
            confidence: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateMetric {
    pub op: AggregateOp,
    #[serde(default)]
    pub field: Option<String>,
    pub alias: String,
}

/// Group-by plus metrics. Output rows carry the group key under `_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AggregateSpec {
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub metrics: Vec<AggregateMetric>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn and_flattens_and_drops_all() {
        let f = Filter::All
            .and(Filter::eq("a", 1))
            .and(Filter::eq("b", 2).and(Filter::eq("c", 3)));
        match &f {
            Filter::And { clauses } => assert_eq!(clauses.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.fields(), vec!["a", "b", "c"]);
        assert_eq!(Filter::All.and(Filter::All), Filter::All);
    }

    #[test]
    fn search_query_defaults() {
        let q: SearchQuery =
            serde_json::from_value(json!({"collection": "companies", "tenant_id": "u1"})).unwrap();
        assert!(q.filter.is_empty());
        assert!(q.sort.is_empty());
        assert_eq!(q.limit, None);
    }
}
