//! Retrieval plans: the ordered, dependency-annotated steps produced by the
//! planning layer and executed by the orchestrator.

use crate::errors::{EngineError, Result};
use crate::query::{AggregateSpec, FilterMap, SortKey};
use crate::schema::Cardinality;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One join step. `cardinality` is always expressed in the `from -> to` direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HoppingPath {
    pub from: String,
    pub to: String,
    /// Field on `from` whose values feed the join.
    #[serde(default = "default_source_field")]
    pub source_field: String,
    /// Field on `to` matched against the source values.
    pub via: String,
    pub cardinality: Cardinality,
}

fn default_source_field() -> String {
    "_id".to_string()
}

impl std::fmt::Display for HoppingPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{} ({})",
            self.from, self.source_field, self.to, self.via, self.cardinality
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Fetch,
    Hop,
    Aggregate,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Fetch => "fetch",
            Action::Hop => "hop",
            Action::Aggregate => "aggregate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalStep {
    pub id: String,
    pub action: Action,
    pub collection: String,
    #[serde(default)]
    pub filter: FilterMap,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub sort: Vec<SortKey>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub hop: Option<HoppingPath>,
    /// Tag naming this step's id output, e.g. `company_ids`.
    #[serde(default)]
    pub produces: Option<String>,
    #[serde(default)]
    pub aggregate: Option<AggregateSpec>,
    #[serde(default)]
    pub vector_query: Option<String>,
    #[serde(default)]
    pub text_query: Option<String>,
}

impl RetrievalStep {
    pub fn new(id: impl Into<String>, action: Action, collection: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action,
            collection: collection.into(),
            filter: FilterMap::new(),
            limit: None,
            sort: Vec::new(),
            depends_on: Vec::new(),
            hop: None,
            produces: None,
            aggregate: None,
            vector_query: None,
            text_query: None,
        }
    }

    pub fn depends_on(mut self, step: &str) -> Self {
        self.depends_on.push(step.to_string());
        self
    }

    pub fn produces(mut self, tag: &str) -> Self {
        self.produces = Some(tag.to_string());
        self
    }

    pub fn with_filter(mut self, filter: FilterMap) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    #[default]
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetrievalPlan {
    pub steps: Vec<RetrievalStep>,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub requires_critique: bool,
}

impl RetrievalPlan {
    pub fn new(steps: Vec<RetrievalStep>) -> Self {
        Self {
            steps,
            complexity: Complexity::default(),
            requires_critique: false,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| EngineError::InvalidPlan(e.to_string()))
    }

    /// Step ids must be unique. Returns the ids of steps whose dependencies
    /// are unknown or not strictly earlier; those steps cannot run.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut unordered = Vec::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(EngineError::InvalidPlan("step with empty id".into()));
            }
            if step.depends_on.iter().any(|d| !seen.contains(d.as_str())) {
                unordered.push(step.id.clone());
            }
            if !seen.insert(&step.id) {
                return Err(EngineError::InvalidPlan(format!(
                    "duplicate step id {}",
                    step.id
                )));
            }
        }
        Ok(unordered)
    }
}

/// Name inside a `{{name}}` placeholder token, if `s` is one.
pub fn placeholder_name(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?.trim();
    if inner.is_empty() {
        None
    } else {
        Some(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_tokens() {
        assert_eq!(placeholder_name("{{company_ids}}"), Some("company_ids"));
        assert_eq!(placeholder_name(" {{ step1 }} "), Some("step1"));
        assert_eq!(placeholder_name("{{}}"), None);
        assert_eq!(placeholder_name("company_ids"), None);
    }

    #[test]
    fn validate_flags_forward_dependencies() {
        let plan = RetrievalPlan::new(vec![
            RetrievalStep::new("a", Action::Fetch, "companies").depends_on("b"),
            RetrievalStep::new("b", Action::Fetch, "companies"),
            RetrievalStep::new("c", Action::Hop, "employees").depends_on("b"),
        ]);
        assert_eq!(plan.validate().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn validate_rejects_duplicates() {
        let plan = RetrievalPlan::new(vec![
            RetrievalStep::new("a", Action::Fetch, "companies"),
            RetrievalStep::new("a", Action::Fetch, "employees"),
        ]);
        assert!(matches!(plan.validate(), Err(EngineError::InvalidPlan(_))));
    }

    #[test]
    fn plan_json_shape() {
        let raw = r#"{
            "steps": [
                {"id": "s1", "action": "fetch", "collection": "companies",
                 "filter": {"industry": "SaaS"}, "produces": "company_ids"},
                {"id": "s2", "action": "hop", "collection": "employees",
                 "depends_on": ["s1"],
                 "hop": {"from": "companies", "to": "employees", "via": "companyId",
                         "cardinality": "one-to-many"}}
            ],
            "complexity": "moderate",
            "requires_critique": true
        }"#;
        let plan = RetrievalPlan::from_json(raw).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.complexity, Complexity::Moderate);
        let hop = plan.steps[1].hop.as_ref().unwrap();
        assert_eq!(hop.source_field, "_id");
        assert_eq!(hop.cardinality, Cardinality::OneToMany);
    }
}
