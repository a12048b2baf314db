//! Filter sanitation.
//!
//! Planner-produced filters are checked against the collection schema before
//! they reach the store. The checks are a declarative table from field type
//! to value validators, so each rule can be exercised on its own. Nothing in
//! here fails a request: offending clauses are dropped, logged and reported.

use crate::config::EngineConfig;
use hopgraph_core::{
    CollectionSchema, EngineError, FieldDefinition, FieldType, Filter, FilterMap, Operator,
    SortKey, TenantId,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Validator {
    /// Empty or whitespace-only strings.
    NonEmpty,
    /// Reserved generic words such as "all" or "revenue".
    NotGenericTerm,
    /// Numbers, or strings that parse as finite numbers (coerced).
    Numeric,
    /// Booleans, or "true"/"false"/"yes"/"no" strings (coerced).
    Boolean,
    /// RFC 3339 timestamps or `YYYY-MM-DD` dates.
    Date,
}

#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: HashMap<FieldType, Vec<Validator>>,
}

impl Default for RuleTable {
    fn default() -> Self {
        use Validator::*;
        let mut rules = HashMap::new();
        rules.insert(FieldType::String, vec![NonEmpty, NotGenericTerm]);
        rules.insert(FieldType::Identifier, vec![NonEmpty, NotGenericTerm]);
        rules.insert(FieldType::Array, vec![NonEmpty, NotGenericTerm]);
        rules.insert(FieldType::Number, vec![NotGenericTerm, Numeric]);
        rules.insert(FieldType::Boolean, vec![Boolean]);
        rules.insert(FieldType::Date, vec![NonEmpty, NotGenericTerm, Date]);
        rules.insert(FieldType::Object, vec![]);
        Self { rules }
    }
}

impl RuleTable {
    pub fn validators(&self, ty: FieldType) -> &[Validator] {
        self.rules.get(&ty).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn set(&mut self, ty: FieldType, validators: Vec<Validator>) {
        self.rules.insert(ty, validators);
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DroppedClause {
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SanitizeReport {
    pub dropped: Vec<DroppedClause>,
}

impl SanitizeReport {
    fn drop_clause(&mut self, collection: &str, field: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(collection, field, %reason, "dropping filter clause");
        self.dropped.push(DroppedClause {
            field: field.to_string(),
            reason,
        });
    }

    fn drop_sort_key(&mut self, collection: &str, field: &str, reason: &str) {
        warn!(collection, field, reason, "dropping sort key");
        self.dropped.push(DroppedClause {
            field: field.to_string(),
            reason: format!("sort: {reason}"),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SanitizedFilter {
    pub filter: Filter,
    pub report: SanitizeReport,
}

#[derive(Debug, Clone)]
pub struct SanitizedSort {
    pub keys: Vec<SortKey>,
    pub report: SanitizeReport,
}

#[derive(Debug, Clone)]
pub struct FilterSanitizer {
    rules: RuleTable,
    generic_terms: HashSet<String>,
}

impl FilterSanitizer {
    pub fn new(rules: RuleTable, generic_terms: &[String]) -> Self {
        Self {
            rules,
            generic_terms: generic_terms.iter().map(|t| t.to_lowercase()).collect(),
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(RuleTable::default(), &cfg.generic_terms)
    }

    /// Compile a raw filter map into a [`Filter`], dropping every clause the
    /// schema cannot support. The owner field is always removed here; tenant
    /// scoping is added separately by [`scope_to_tenant`].
    pub fn sanitize(&self, schema: &CollectionSchema, raw: &FilterMap) -> SanitizedFilter {
        let mut report = SanitizeReport::default();
        let filter = self.compile_map(schema, raw, &mut report);
        SanitizedFilter { filter, report }
    }

    /// Keep sort keys on sortable fields, renamed to their canonical field
    /// names. The id field is always sortable; the owner field never is.
    pub fn sanitize_sort(&self, schema: &CollectionSchema, keys: &[SortKey]) -> SanitizedSort {
        let mut report = SanitizeReport::default();
        let mut out: Vec<SortKey> = Vec::new();
        for key in keys {
            let name = if key.field == schema.id_field {
                key.field.clone()
            } else {
                match schema.resolve_field(&key.field) {
                    None => {
                        report.drop_sort_key(&schema.name, &key.field, "unknown field");
                        continue;
                    }
                    Some(def) if schema.owner_field.as_deref() == Some(def.name.as_str()) => {
                        report.drop_sort_key(&schema.name, &key.field, "owner field is engine-managed");
                        continue;
                    }
                    Some(def) if !def.sortable => {
                        report.drop_sort_key(&schema.name, &key.field, "field is not sortable");
                        continue;
                    }
                    Some(def) => def.name.clone(),
                }
            };
            if out.iter().all(|k| k.field != name) {
                out.push(SortKey {
                    field: name,
                    order: key.order,
                });
            }
        }
        SanitizedSort { keys: out, report }
    }

    fn compile_map(
        &self,
        schema: &CollectionSchema,
        raw: &FilterMap,
        report: &mut SanitizeReport,
    ) -> Filter {
        let mut out = Filter::All;
        for (key, value) in raw {
            let clause = match key.as_str() {
                "$and" | "$or" => self.compile_group(schema, key, value, report),
                _ => self.compile_field(schema, key, value, report),
            };
            if let Some(c) = clause {
                out = out.and(c);
            }
        }
        out
    }

    fn compile_group(
        &self,
        schema: &CollectionSchema,
        key: &str,
        value: &JsonValue,
        report: &mut SanitizeReport,
    ) -> Option<Filter> {
        let Some(items) = value.as_array() else {
            report.drop_clause(&schema.name, key, "logical group is not a list");
            return None;
        };
        let mut clauses: Vec<Filter> = Vec::new();
        let mut vacuous = false;
        for item in items {
            match item.as_object() {
                Some(map) => match self.compile_map(schema, map, report) {
                    Filter::All => vacuous = true,
                    f => clauses.push(f),
                },
                None => {
                    report.drop_clause(&schema.name, key, "logical group member is not a map");
                    vacuous = true;
                }
            }
        }
        if key == "$or" {
            // one member matching everything makes the whole disjunction match everything
            if vacuous && !clauses.is_empty() {
                report.drop_clause(&schema.name, key, "disjunction has a member without usable clauses");
                return None;
            }
            if clauses.is_empty() {
                return None;
            }
            Some(Filter::or(clauses))
        } else {
            if clauses.is_empty() {
                return None;
            }
            Some(clauses.into_iter().fold(Filter::All, Filter::and))
        }
    }

    fn compile_field(
        &self,
        schema: &CollectionSchema,
        key: &str,
        value: &JsonValue,
        report: &mut SanitizeReport,
    ) -> Option<Filter> {
        if schema.owner_field.as_deref() == Some(key) {
            report.drop_clause(&schema.name, key, "owner field is engine-managed");
            return None;
        }
        let id_def;
        let def = if key == schema.id_field && schema.field(key).is_none() {
            id_def = FieldDefinition::new(key, FieldType::Identifier);
            &id_def
        } else {
            match schema.resolve_field(key) {
                Some(d) => d,
                None => {
                    report.drop_clause(&schema.name, key, "unknown field");
                    return None;
                }
            }
        };
        if schema.owner_field.as_deref() == Some(def.name.as_str()) {
            report.drop_clause(&schema.name, key, "owner field is engine-managed");
            return None;
        }
        if !def.filterable {
            report.drop_clause(&schema.name, key, "field is not filterable");
            return None;
        }

        let ops: Vec<(Operator, &JsonValue)> = match value {
            JsonValue::Object(map) if map.keys().all(|k| k.starts_with('$')) && !map.is_empty() => {
                let mut ops = Vec::new();
                for (k, v) in map {
                    match Operator::from_key(k) {
                        Some(op) => ops.push((op, v)),
                        None => report.drop_clause(
                            &schema.name,
                            key,
                            format!("unsupported operator {k}"),
                        ),
                    }
                }
                ops
            }
            JsonValue::Array(_) => vec![(Operator::In, value)],
            other => vec![(Operator::Eq, other)],
        };

        let mut out = Filter::All;
        for (op, v) in ops {
            if !def.allows(op) {
                report.drop_clause(
                    &schema.name,
                    key,
                    format!("operator {} not allowed on {:?} field", op.as_key(), def.field_type),
                );
                continue;
            }
            match self.check_operand(def, op, v) {
                Ok(val) => out = out.and(Filter::field(def.name.clone(), op, val)),
                Err(e) => report.drop_clause(&schema.name, key, e.to_string()),
            }
        }
        match out {
            Filter::All => None,
            f => Some(f),
        }
    }

    fn check_operand(
        &self,
        def: &FieldDefinition,
        op: Operator,
        value: &JsonValue,
    ) -> Result<JsonValue, EngineError> {
        match op {
            Operator::Exists => match value {
                JsonValue::Bool(_) => Ok(value.clone()),
                other => Ok(JsonValue::Bool(truthy(other).ok_or_else(|| invalid(def, "exists needs a boolean"))?)),
            },
            Operator::In | Operator::Nin => {
                let items = value
                    .as_array()
                    .ok_or_else(|| invalid(def, "set operator needs a list"))?;
                // an originally empty list is kept: it legitimately matches nothing
                if items.is_empty() {
                    return Ok(JsonValue::Array(Vec::new()));
                }
                let kept: Vec<JsonValue> = items
                    .iter()
                    .filter_map(|i| self.check_value(def, i).ok())
                    .collect();
                if kept.is_empty() {
                    return Err(invalid(def, "no valid values in list"));
                }
                Ok(JsonValue::Array(kept))
            }
            Operator::Regex => {
                let v = self.check_value(def, value)?;
                let pattern = v
                    .as_str()
                    .ok_or_else(|| invalid(def, "regex needs a string"))?;
                regex::Regex::new(pattern).map_err(|e| invalid(def, &e.to_string()))?;
                Ok(v)
            }
            _ => self.check_value(def, value),
        }
    }

    /// Run the field type's validators over one scalar, returning the
    /// (possibly coerced) value to use.
    pub fn check_value(
        &self,
        def: &FieldDefinition,
        value: &JsonValue,
    ) -> Result<JsonValue, EngineError> {
        let mut v = value.clone();
        for validator in self.rules.validators(def.field_type) {
            v = self.apply(*validator, def, v)?;
        }
        Ok(v)
    }

    fn apply(
        &self,
        validator: Validator,
        def: &FieldDefinition,
        v: JsonValue,
    ) -> Result<JsonValue, EngineError> {
        match validator {
            Validator::NonEmpty => match &v {
                JsonValue::String(s) if s.trim().is_empty() => Err(invalid(def, "empty value")),
                JsonValue::Null => Err(invalid(def, "null value")),
                _ => Ok(v),
            },
            Validator::NotGenericTerm => match &v {
                JsonValue::String(s) if self.generic_terms.contains(&s.trim().to_lowercase()) => {
                    Err(invalid(def, &format!("generic term {s:?}")))
                }
                _ => Ok(v),
            },
            Validator::Numeric => match &v {
                JsonValue::Number(_) => Ok(v),
                JsonValue::String(s) => {
                    let cleaned: String = s.trim().chars().filter(|c| *c != ',' && *c != '_').collect();
                    match cleaned.parse::<f64>() {
                        Ok(n) if n.is_finite() => serde_json::Number::from_f64(n)
                            .map(JsonValue::Number)
                            .ok_or_else(|| invalid(def, "not a finite number")),
                        _ => Err(invalid(def, &format!("{s:?} is not numeric"))),
                    }
                }
                _ => Err(invalid(def, "not numeric")),
            },
            Validator::Boolean => truthy(&v)
                .map(JsonValue::Bool)
                .ok_or_else(|| invalid(def, "not a boolean")),
            Validator::Date => match &v {
                JsonValue::String(s) => {
                    let s = s.trim();
                    if chrono::DateTime::parse_from_rfc3339(s).is_ok()
                        || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
                    {
                        Ok(JsonValue::String(s.to_string()))
                    } else {
                        Err(invalid(def, &format!("{s:?} is not a date")))
                    }
                }
                _ => Err(invalid(def, "date must be a string")),
            },
        }
    }
}

fn truthy(v: &JsonValue) -> Option<bool> {
    match v {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        JsonValue::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn invalid(def: &FieldDefinition, reason: &str) -> EngineError {
    EngineError::InvalidFilterValue {
        field: def.name.clone(),
        reason: reason.to_string(),
    }
}

/// Owner-id clause for tenant-scoped collections, `All` otherwise.
pub fn tenant_filter(schema: &CollectionSchema, tenant: &TenantId) -> Filter {
    match &schema.owner_field {
        Some(owner) => Filter::eq(owner.clone(), tenant.clone()),
        None => Filter::All,
    }
}

pub fn scope_to_tenant(schema: &CollectionSchema, tenant: &TenantId, filter: Filter) -> Filter {
    filter.and(tenant_filter(schema, tenant))
}
