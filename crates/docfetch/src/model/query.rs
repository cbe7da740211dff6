//! Query objects for views, spatial views and declarative queries.
//!
//! These are opaque to the retrieval core. They are built by the caller,
//! handed to the [`QueryDispatcher`](crate::QueryDispatcher) unchanged and only
//! interpreted by the cluster. The builders exist so callers do not have to
//! know the wire encoding of each parameter.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A planar view query against `design/view`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewQuery {
    design: String,
    view: String,
    #[serde(default)]
    params: BTreeMap<String, Value>,
}

impl ViewQuery {
    pub fn from(design: impl Into<String>, view: impl Into<String>) -> Self {
        Self {
            design: design.into(),
            view: view.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn design(&self) -> &str {
        &self.design
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    pub const fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    #[must_use]
    pub fn limit(self, limit: usize) -> Self {
        self.with("limit", limit)
    }

    #[must_use]
    pub fn skip(self, skip: usize) -> Self {
        self.with("skip", skip)
    }

    #[must_use]
    pub fn descending(self, descending: bool) -> Self {
        self.with("descending", descending)
    }

    #[must_use]
    pub fn reduce(self, reduce: bool) -> Self {
        self.with("reduce", reduce)
    }

    /// Whether the index may be stale (`true`), must be updated first
    /// (`false`).
    #[must_use]
    pub fn stale(self, stale: bool) -> Self {
        self.with("stale", stale)
    }

    #[must_use]
    pub fn key(self, key: impl Into<Value>) -> Self {
        self.with("key", key.into())
    }

    #[must_use]
    pub fn keys<I>(self, keys: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let keys: Vec<Value> = keys.into_iter().map(Into::into).collect();
        self.with("keys", keys)
    }

    /// Restricts the scan to keys in `[start, end]`.
    #[must_use]
    pub fn range(self, start: impl Into<Value>, end: impl Into<Value>) -> Self {
        self.with("startkey", start.into()).with("endkey", end.into())
    }

    #[must_use]
    pub fn start_key(self, start: impl Into<Value>) -> Self {
        self.with("startkey", start.into())
    }

    #[must_use]
    pub fn end_key(self, end: impl Into<Value>) -> Self {
        self.with("endkey", end.into())
    }

    fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_owned(), value.into());
        self
    }
}

/// A spatial view query against `design/view`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpatialViewQuery {
    design: String,
    view: String,
    #[serde(default)]
    params: BTreeMap<String, Value>,
}

impl SpatialViewQuery {
    pub fn from(design: impl Into<String>, view: impl Into<String>) -> Self {
        Self {
            design: design.into(),
            view: view.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn design(&self) -> &str {
        &self.design
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    pub const fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.params.insert("limit".to_owned(), limit.into());
        self
    }

    #[must_use]
    pub fn skip(mut self, skip: usize) -> Self {
        self.params.insert("skip".to_owned(), skip.into());
        self
    }

    /// Restricts the query to a multidimensional range, one entry per
    /// dimension.
    #[must_use]
    pub fn range(mut self, start: Vec<Value>, end: Vec<Value>) -> Self {
        self.params.insert("start_range".to_owned(), start.into());
        self.params.insert("end_range".to_owned(), end.into());
        self
    }

    /// Restricts the query to a two dimensional bounding box.
    #[must_use]
    pub fn bbox(mut self, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        self.params
            .insert("bbox".to_owned(), vec![min_x, min_y, max_x, max_y].into());
        self
    }

    #[must_use]
    pub fn stale(mut self, stale: bool) -> Self {
        self.params.insert("stale".to_owned(), stale.into());
        self
    }
}

/// A declarative query statement with optional positional or named
/// arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    text: String,
    #[serde(default)]
    positional: Vec<Value>,
    #[serde(default)]
    named: BTreeMap<String, Value>,
    #[serde(default = "default_adhoc")]
    adhoc: bool,
}

const fn default_adhoc() -> bool {
    true
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            positional: Vec::new(),
            named: BTreeMap::new(),
            adhoc: true,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub const fn named(&self) -> &BTreeMap<String, Value> {
        &self.named
    }

    pub const fn is_adhoc(&self) -> bool {
        self.adhoc
    }

    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    #[must_use]
    pub fn named_arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    /// Marks the statement as prepared (`false`) so the cluster may cache its
    /// plan.
    #[must_use]
    pub const fn adhoc(mut self, adhoc: bool) -> Self {
        self.adhoc = adhoc;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn view_builder_records_params() {
        let query = ViewQuery::from("beers", "by_name")
            .limit(10)
            .skip(2)
            .range("a", "m")
            .descending(true);
        assert_eq!(query.design(), "beers");
        assert_eq!(query.view(), "by_name");
        assert_eq!(query.param("limit"), Some(&json!(10)));
        assert_eq!(query.param("skip"), Some(&json!(2)));
        assert_eq!(query.param("startkey"), Some(&json!("a")));
        assert_eq!(query.param("endkey"), Some(&json!("m")));
        assert_eq!(query.param("descending"), Some(&json!(true)));
    }

    #[test]
    fn statement_collects_arguments() {
        let stmt = Statement::new("SELECT * FROM b WHERE x = $1 AND y = $y")
            .arg(5)
            .named_arg("y", "z")
            .adhoc(false);
        assert_eq!(stmt.positional(), [json!(5)]);
        assert_eq!(stmt.named().get("y"), Some(&json!("z")));
        assert!(!stmt.is_adhoc());
    }
}
