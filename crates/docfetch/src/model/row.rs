use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One row of a planar view result.
///
/// Only `id`, `key` and `value` are decoded; everything else the cluster sends
/// is dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub value: Value,
}

/// One row of a spatial view result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpatialViewRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Value>,
}

/// One row of a declarative query result, passed through as JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryRow(pub Value);

impl QueryRow {
    pub const fn value(&self) -> &Value {
        &self.0
    }

    /// Looks up a top-level field of an object row.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}
