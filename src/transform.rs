use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Rewrites a serialized event before it goes on the wire.
///
/// Implementations receive the top-level JSON object of one event and must
/// be cheap and infallible; they run for every event of every flush.
pub trait FieldResolver: Send + Sync {
    fn resolve(&self, document: Map<String, Value>) -> Map<String, Value>;
}

/// Rename field `original` to `replacement`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldNameOverride {
    pub original: String,
    pub replacement: String,
}

/// Copy the value of field `original` into an extra field `replica`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldValueReplica {
    pub original: String,
    pub replica: String,
}

/// Field name overrides plus value replicas, configured once at activation.
///
/// Replicas are taken from the original field names, then overrides are
/// applied, so a field can be both duplicated and renamed.
#[derive(Debug, Clone, Default)]
pub struct FieldTransform {
    name_overrides: HashMap<String, String>,
    value_replicas: Vec<FieldValueReplica>,
}

impl FieldTransform {
    pub fn new(overrides: &[FieldNameOverride], replicas: &[FieldValueReplica]) -> Self {
        FieldTransform {
            name_overrides: overrides
                .iter()
                .map(|o| (o.original.clone(), o.replacement.clone()))
                .collect(),
            value_replicas: replicas.to_vec(),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.name_overrides.is_empty() && self.value_replicas.is_empty()
    }
}

impl FieldResolver for FieldTransform {
    fn resolve(&self, mut document: Map<String, Value>) -> Map<String, Value> {
        if self.is_identity() {
            return document;
        }

        for rule in &self.value_replicas {
            if let Some(value) = document.get(&rule.original).cloned() {
                document.insert(rule.replica.clone(), value);
            }
        }

        if self.name_overrides.is_empty() {
            return document;
        }

        document
            .into_iter()
            .map(|(key, value)| match self.name_overrides.get(&key) {
                Some(replacement) => (replacement.clone(), value),
                None => (key, value),
            })
            .collect()
    }
}
