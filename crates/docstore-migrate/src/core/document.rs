//! Documents and field-level writes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::path::{DocumentPath, FieldPath};

/// A field write: either a new value or the delete sentinel.
///
/// `Delete` removes the field. It is distinct from `Set(Value::Null)`, which
/// keeps the field with a null value, and from leaving the field untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldWrite {
    Set(Value),
    Delete,
}

/// A document read from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    path: DocumentPath,
    #[serde(default)]
    fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new(path: DocumentPath) -> Self {
        Self {
            path,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_fields(path: DocumentPath, fields: BTreeMap<String, Value>) -> Self {
        Self { path, fields }
    }

    /// Build a document from a JSON object; non-object values yield no fields.
    pub fn from_json(path: DocumentPath, value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        Self { path, fields }
    }

    pub fn path(&self) -> &DocumentPath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.id()
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.fields
    }

    /// Look up a (possibly nested) field.
    pub fn get(&self, field: &FieldPath) -> Option<&Value> {
        let (first, rest) = field.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    pub fn contains(&self, field: &FieldPath) -> bool {
        self.get(field).is_some()
    }

    /// Set a field, creating intermediate maps as needed.
    ///
    /// A non-map value sitting on an intermediate segment is replaced by a map.
    pub fn set(&mut self, field: &FieldPath, value: Value) {
        let Some((last, parents)) = field.segments().split_last() else {
            return;
        };
        let Some((first, middle)) = parents.split_first() else {
            self.fields.insert(last.clone(), value);
            return;
        };

        let mut map = ensure_object(
            self.fields
                .entry(first.clone())
                .or_insert_with(|| Value::Object(Map::new())),
        );
        for segment in middle {
            map = ensure_object(
                map.entry(segment.clone())
                    .or_insert_with(|| Value::Object(Map::new())),
            );
        }
        map.insert(last.clone(), value);
    }

    /// Remove a field, returning its previous value.
    pub fn remove(&mut self, field: &FieldPath) -> Option<Value> {
        let (last, parents) = field.segments().split_last()?;
        let Some((first, middle)) = parents.split_first() else {
            return self.fields.remove(last);
        };

        let mut map = self.fields.get_mut(first)?.as_object_mut()?;
        for segment in middle {
            map = map.get_mut(segment)?.as_object_mut()?;
        }
        map.remove(last)
    }

    /// Apply a field write.
    pub fn apply(&mut self, field: &FieldPath, write: &FieldWrite) {
        match write {
            FieldWrite::Set(value) => self.set(field, value.clone()),
            FieldWrite::Delete => {
                self.remove(field);
            }
        }
    }

    /// Whether applying `write` to `field` would leave the document unchanged.
    pub fn already_satisfies(&self, field: &FieldPath, write: &FieldWrite) -> bool {
        match write {
            FieldWrite::Set(value) => self.get(field) == Some(value),
            FieldWrite::Delete => !self.contains(field),
        }
    }

    /// Fields as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}
