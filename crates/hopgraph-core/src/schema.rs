//! Collection schemas and the process-wide registry.
//!
//! The registry is built once at startup, validated, and then only read.
//! Lookups return `Option` so that an unknown collection is an ordinary
//! outcome for the caller rather than an error.

use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Date,
    Identifier,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Regex,
    Exists,
}

impl Operator {
    /// Parse a document-store style operator key such as `$gte`.
    pub fn from_key(key: &str) -> Option<Self> {
        Some(match key.trim_start_matches('$') {
            "eq" => Operator::Eq,
            "ne" => Operator::Ne,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "in" => Operator::In,
            "nin" => Operator::Nin,
            "regex" => Operator::Regex,
            "exists" => Operator::Exists,
            _ => return None,
        })
    }

    pub fn as_key(&self) -> &'static str {
        match self {
            Operator::Eq => "$eq",
            Operator::Ne => "$ne",
            Operator::Gt => "$gt",
            Operator::Gte => "$gte",
            Operator::Lt => "$lt",
            Operator::Lte => "$lte",
            Operator::In => "$in",
            Operator::Nin => "$nin",
            Operator::Regex => "$regex",
            Operator::Exists => "$exists",
        }
    }
}

impl FieldType {
    pub fn default_operators(&self) -> &'static [Operator] {
        use Operator::*;
        match self {
            FieldType::String => &[Eq, Ne, In, Nin, Regex, Exists],
            FieldType::Number | FieldType::Date => &[Eq, Ne, Gt, Gte, Lt, Lte, In, Nin, Exists],
            FieldType::Boolean => &[Eq, Ne, Exists],
            FieldType::Identifier => &[Eq, Ne, In, Nin, Exists],
            FieldType::Array => &[Eq, In, Nin, Exists],
            FieldType::Object => &[Exists],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
}

impl Importance {
    pub fn weight(&self) -> f32 {
        match self {
            Importance::Low => 0.5,
            Importance::Normal => 1.0,
            Importance::High => 2.0,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_true")]
    pub filterable: bool,
    #[serde(default)]
    pub sortable: bool,
    // empty means "the defaults for this type"
    #[serde(default)]
    pub operators: Vec<Operator>,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub importance: Importance,
    /// Excluded from substring text search (embeddings, secrets, raw blobs).
    #[serde(default)]
    pub restricted: bool,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            filterable: true,
            sortable: false,
            operators: Vec::new(),
            synonyms: Vec::new(),
            category: None,
            importance: Importance::Normal,
            restricted: false,
        }
    }

    pub fn sortable(mut self) -> Self {
        self.sortable = true;
        self
    }

    pub fn restricted(mut self) -> Self {
        self.restricted = true;
        self.filterable = false;
        self
    }

    pub fn synonyms(mut self, names: &[&str]) -> Self {
        self.synonyms = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    pub fn allows(&self, op: Operator) -> bool {
        if self.operators.is_empty() {
            self.field_type.default_operators().contains(&op)
        } else {
            self.operators.contains(&op)
        }
    }

    fn answers_to(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.synonyms.iter().any(|s| s.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Cardinality {
    #[serde(rename = "one-to-one")]
    OneToOne,
    #[serde(rename = "one-to-many")]
    OneToMany,
    #[serde(rename = "many-to-one")]
    ManyToOne,
    #[serde(rename = "many-to-many")]
    ManyToMany,
}

impl Cardinality {
    /// The same relationship seen from the other side.
    pub fn inverse(&self) -> Self {
        match self {
            Cardinality::OneToMany => Cardinality::ManyToOne,
            Cardinality::ManyToOne => Cardinality::OneToMany,
            other => *other,
        }
    }

    /// Whether traversing in this direction can multiply the number of ids.
    pub fn fans_out(&self) -> bool {
        matches!(self, Cardinality::OneToMany | Cardinality::ManyToMany)
    }
}

impl std::fmt::Display for Cardinality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Cardinality::OneToOne => "one-to-one",
            Cardinality::OneToMany => "one-to-many",
            Cardinality::ManyToOne => "many-to-one",
            Cardinality::ManyToMany => "many-to-many",
        };
        f.write_str(s)
    }
}

/// A join declared on the owning collection: values of `field` here match
/// values of `via` on `target` (the target's id field when `via` is absent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub field: String,
    pub target: String,
    pub cardinality: Cardinality,
    #[serde(default)]
    pub via: Option<String>,
}

fn default_id_field() -> String {
    "_id".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Field holding the tenant id. Its presence makes the collection tenant-scoped.
    #[serde(default)]
    pub owner_field: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub searchable_fields: Vec<String>,
    #[serde(default)]
    pub embedding_field: Option<String>,
    #[serde(default)]
    pub vector_index: bool,
    #[serde(default)]
    pub text_index: bool,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_field: default_id_field(),
            owner_field: None,
            fields: Vec::new(),
            relationships: Vec::new(),
            searchable_fields: Vec::new(),
            embedding_field: None,
            vector_index: false,
            text_index: false,
        }
    }

    pub fn owned_by(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if self.field(&field).is_none() {
            self.fields
                .push(FieldDefinition::new(field.clone(), FieldType::Identifier));
        }
        self.owner_field = Some(field);
        self
    }

    pub fn field_def(mut self, def: FieldDefinition) -> Self {
        self.fields.push(def);
        self
    }

    pub fn relate(
        mut self,
        field: &str,
        target: &str,
        cardinality: Cardinality,
        via: Option<&str>,
    ) -> Self {
        self.relationships.push(Relationship {
            field: field.to_string(),
            target: target.to_string(),
            cardinality,
            via: via.map(str::to_string),
        });
        self
    }

    pub fn searchable(mut self, fields: &[&str]) -> Self {
        self.searchable_fields = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn embedding(mut self, field: &str, indexed: bool) -> Self {
        if self.field(field).is_none() {
            self.fields
                .push(FieldDefinition::new(field, FieldType::Array).restricted());
        }
        self.embedding_field = Some(field.to_string());
        self.vector_index = indexed;
        self
    }

    pub fn with_text_index(mut self) -> Self {
        self.text_index = true;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Exact name first, then case-insensitive name or synonym.
    pub fn resolve_field(&self, name: &str) -> Option<&FieldDefinition> {
        self.field(name)
            .or_else(|| self.fields.iter().find(|f| f.answers_to(name)))
    }

    pub fn is_tenant_scoped(&self) -> bool {
        self.owner_field.is_some()
    }

    /// Whether `name` can be used as a join key on this collection.
    pub fn has_join_field(&self, name: &str) -> bool {
        name == self.id_field || self.field(name).is_some()
    }

    /// String-typed, unrestricted fields: the substring-search surface.
    pub fn text_fields(&self) -> Vec<&FieldDefinition> {
        self.fields
            .iter()
            .filter(|f| f.field_type == FieldType::String && !f.restricted)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    collections: Vec<CollectionSchema>,
}

#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    collections: BTreeMap<String, CollectionSchema>,
}

impl SchemaRegistry {
    /// Build and validate a registry. Inconsistent schemas are configuration errors.
    pub fn new(schemas: Vec<CollectionSchema>) -> Result<Self> {
        let mut collections = BTreeMap::new();
        for s in schemas {
            if collections.contains_key(&s.name) {
                return Err(EngineError::Config(format!(
                    "collection {} declared twice",
                    s.name
                )));
            }
            collections.insert(s.name.clone(), s);
        }
        let reg = Self { collections };
        reg.validate()?;
        Ok(reg)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: RegistryFile =
            serde_json::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))?;
        Self::new(file.collections)
    }

    pub fn get_schema(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    pub fn get_searchable_fields(&self, name: &str) -> Vec<String> {
        self.get_schema(name)
            .map(|s| s.searchable_fields.clone())
            .unwrap_or_default()
    }

    pub fn has_embedding(&self, name: &str) -> bool {
        self.get_schema(name)
            .map(|s| s.embedding_field.is_some())
            .unwrap_or(false)
    }

    /// Collections reachable in one hop, in either declaration direction.
    /// Own relationships come first in declared order, then reverse ones by name.
    pub fn get_related_collections(&self, name: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        if let Some(s) = self.get_schema(name) {
            for r in &s.relationships {
                if !out.contains(&r.target) {
                    out.push(r.target.clone());
                }
            }
        }
        for (other, s) in &self.collections {
            if other == name || out.contains(other) {
                continue;
            }
            if s.relationships.iter().any(|r| r.target == name) {
                out.push(other.clone());
            }
        }
        out
    }

    pub fn collections(&self) -> impl Iterator<Item = &CollectionSchema> {
        self.collections.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    fn validate(&self) -> Result<()> {
        for s in self.collections.values() {
            if let Some(owner) = &s.owner_field {
                if s.field(owner).is_none() {
                    return Err(EngineError::Config(format!(
                        "{}: owner field {} is not declared",
                        s.name, owner
                    )));
                }
            }
            for r in &s.relationships {
                let target = self.collections.get(&r.target).ok_or_else(|| {
                    EngineError::Config(format!(
                        "{}: relationship targets unknown collection {}",
                        s.name, r.target
                    ))
                })?;
                if !s.has_join_field(&r.field) {
                    return Err(EngineError::Config(format!(
                        "{}: relationship field {} is not declared",
                        s.name, r.field
                    )));
                }
                let via = r.via.as_deref().unwrap_or(&target.id_field);
                if !target.has_join_field(via) {
                    return Err(EngineError::Config(format!(
                        "{}: via field {} is not declared on {}",
                        s.name, via, target.name
                    )));
                }
                // a reciprocal declaration over the same fields must agree
                for back in target.relationships.iter().filter(|b| b.target == s.name) {
                    let back_via = back.via.as_deref().unwrap_or(&s.id_field);
                    if back.field == via && back_via == r.field
                        && back.cardinality != r.cardinality.inverse()
                    {
                        return Err(EngineError::Config(format!(
                            "{} -> {} declared {} but reciprocal declares {}",
                            s.name, target.name, r.cardinality, back.cardinality
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(vec![
            CollectionSchema::new("companies")
                .owned_by("userId")
                .field_def(FieldDefinition::new("name", FieldType::String))
                .relate("_id", "employees", Cardinality::OneToMany, Some("companyId")),
            CollectionSchema::new("employees")
                .owned_by("userId")
                .field_def(FieldDefinition::new("companyId", FieldType::Identifier)),
            CollectionSchema::new("notes"),
        ])
        .unwrap()
    }

    #[test]
    fn absent_collection_is_none() {
        let reg = registry();
        assert!(reg.get_schema("nope").is_none());
        assert!(reg.get_searchable_fields("nope").is_empty());
        assert!(!reg.has_embedding("nope"));
        assert!(reg.get_related_collections("nope").is_empty());
    }

    #[test]
    fn related_collections_are_bidirectional() {
        let reg = registry();
        assert_eq!(reg.get_related_collections("companies"), vec!["employees"]);
        assert_eq!(reg.get_related_collections("employees"), vec!["companies"]);
        assert!(reg.get_related_collections("notes").is_empty());
    }

    #[test]
    fn mismatched_reciprocal_is_rejected() {
        let err = SchemaRegistry::new(vec![
            CollectionSchema::new("a").relate("_id", "b", Cardinality::OneToMany, Some("aId")),
            CollectionSchema::new("b")
                .field_def(FieldDefinition::new("aId", FieldType::Identifier))
                .relate("aId", "a", Cardinality::OneToMany, None),
        ])
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn unknown_target_is_rejected() {
        let err = SchemaRegistry::new(vec![CollectionSchema::new("a").relate(
            "_id",
            "ghost",
            Cardinality::OneToOne,
            None,
        )])
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn synonyms_resolve_fields() {
        let s = CollectionSchema::new("companies").field_def(
            FieldDefinition::new("annualRevenue", FieldType::Number).synonyms(&["arr"]),
        );
        assert_eq!(s.resolve_field("ARR").map(|f| f.name.as_str()), Some("annualRevenue"));
        assert_eq!(s.resolve_field("annualrevenue").map(|f| f.name.as_str()), Some("annualRevenue"));
        assert!(s.resolve_field("headcount").is_none());
    }

    #[test]
    fn registry_from_json() {
        let raw = r#"{"collections":[
            {"name":"a","fields":[{"name":"title","type":"string"}],
             "relationships":[{"field":"_id","target":"b","cardinality":"one-to-many","via":"aId"}]},
            {"name":"b","owner_field":"userId","fields":[
                {"name":"aId","type":"identifier"},{"name":"userId","type":"identifier"}]}
        ]}"#;
        let reg = SchemaRegistry::from_json(raw).unwrap();
        assert_eq!(reg.len(), 2);
        assert!(reg.get_schema("b").unwrap().is_tenant_scoped());
        assert_eq!(reg.get_schema("a").unwrap().id_field, "_id");
    }
}
