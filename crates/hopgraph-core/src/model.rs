use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub type CollectionName = String;
pub type TenantId = String;
pub type DocumentId = String;

/// A schema-described but dynamically shaped record. Collections are
/// heterogeneous, so documents stay a key -> JSON value map end to end.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(transparent)]
pub struct Document(pub Map<String, JsonValue>);

impl Document {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        lookup_path(&self.0, field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: JsonValue) {
        self.0.insert(field.into(), value);
    }

    /// String form of the document's identifier under `id_field`.
    /// Numeric ids are rendered with their JSON spelling.
    pub fn id(&self, id_field: &str) -> Option<DocumentId> {
        self.get(id_field).and_then(id_string)
    }

    /// Reads a numeric vector stored under `field`, skipping non-numeric entries.
    pub fn vector(&self, field: &str) -> Option<Vec<f32>> {
        let arr = self.get(field)?.as_array()?;
        Some(
            arr.iter()
                .filter_map(|x| x.as_f64().map(|f| f as f32))
                .collect(),
        )
    }
}

impl From<JsonValue> for Document {
    fn from(v: JsonValue) -> Self {
        match v {
            JsonValue::Object(map) => Document(map),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                Document(map)
            }
        }
    }
}

impl From<Document> for JsonValue {
    fn from(d: Document) -> Self {
        JsonValue::Object(d.0)
    }
}

/// Render an identifier-like JSON value as a string key.
pub fn id_string(v: &JsonValue) -> Option<String> {
    match v {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Object(map) => map.get("$oid").and_then(id_string),
        _ => None,
    }
}

// Dotted paths ("address.city") walk nested objects.
fn lookup_path<'a>(map: &'a Map<String, JsonValue>, path: &str) -> Option<&'a JsonValue> {
    if let Some(v) = map.get(path) {
        return Some(v);
    }
    let mut parts = path.split('.');
    let mut cur = map.get(parts.next()?)?;
    for part in parts {
        cur = cur.as_object()?.get(part)?;
    }
    Some(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_and_string_ids() {
        let a = Document::from(json!({"_id": 7}));
        let b = Document::from(json!({"_id": "c-1"}));
        let c = Document::from(json!({"_id": {"$oid": "65ab"}}));
        assert_eq!(a.id("_id").as_deref(), Some("7"));
        assert_eq!(b.id("_id").as_deref(), Some("c-1"));
        assert_eq!(c.id("_id").as_deref(), Some("65ab"));
        assert_eq!(a.id("missing"), None);
    }

    #[test]
    fn dotted_lookup() {
        let d = Document::from(json!({"hq": {"city": "Berlin"}, "a.b": 1}));
        assert_eq!(d.get("hq.city"), Some(&json!("Berlin")));
        assert_eq!(d.get("a.b"), Some(&json!(1)));
        assert_eq!(d.get("hq.country"), None);
    }
}
