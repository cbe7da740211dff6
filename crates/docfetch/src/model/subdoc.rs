use crate::error::PathError;
use bytes::Bytes;
use serde_json::Value;
use std::collections::BTreeMap;

/// Which paths to read out of a single document.
///
/// `get` paths return the value found at the path; `exists` paths only report
/// whether the path is present. Both lists are ordered sets: duplicates are
/// removed and the first occurrence keeps its position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubdocLookupSpec {
    id: String,
    get: Vec<String>,
    exists: Vec<String>,
}

impl SubdocLookupSpec {
    pub fn new<G, E>(id: impl Into<String>, get: G, exists: E) -> Self
    where
        G: IntoIterator,
        G::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            id: id.into(),
            get: dedup(get),
            exists: dedup(exists),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get_paths(&self) -> &[String] {
        &self.get
    }

    pub fn exists_paths(&self) -> &[String] {
        &self.exists
    }
}

fn dedup<I>(paths: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut out: Vec<String> = Vec::new();
    for path in paths {
        let path = path.into();
        if !out.contains(&path) {
            out.push(path);
        }
    }
    out
}

/// Per-path outcome of a lookup as returned by the cluster client, before the
/// path values are decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawLookupResult {
    pub cas: u64,
    pub fields: Vec<(String, Result<Bytes, PathError>)>,
    pub exists: Vec<(String, Result<bool, PathError>)>,
}

/// Overall status of a [`SubdocLookupResult`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupStatus {
    /// Every requested path resolved.
    Success,
    /// The document exists but at least one path carries an error.
    PartialFailure,
    /// The document does not exist; every path carries
    /// [`PathError::DocumentNotFound`].
    DocumentNotFound,
    /// The lookup for this document failed as a whole (e.g. timed out); every
    /// path carries [`PathError::LookupFailed`].
    Failed { reason: String },
}

/// The outcome of one [`SubdocLookupSpec`].
///
/// Exactly one result exists per submitted spec, whatever happened to its
/// paths.
#[derive(Clone, Debug, PartialEq)]
pub struct SubdocLookupResult {
    id: String,
    cas: Option<u64>,
    content: BTreeMap<String, Result<Value, PathError>>,
    exists: BTreeMap<String, Result<bool, PathError>>,
    status: LookupStatus,
}

impl SubdocLookupResult {
    /// Builds a result from decoded per-path outcomes, deriving the status.
    pub fn new(
        id: impl Into<String>,
        cas: u64,
        content: BTreeMap<String, Result<Value, PathError>>,
        exists: BTreeMap<String, Result<bool, PathError>>,
    ) -> Self {
        let failed = content.values().any(Result::is_err) || exists.values().any(Result::is_err);
        Self {
            id: id.into(),
            cas: Some(cas),
            content,
            exists,
            status: if failed {
                LookupStatus::PartialFailure
            } else {
                LookupStatus::Success
            },
        }
    }

    /// A result for a spec whose document does not exist.
    pub fn not_found(spec: &SubdocLookupSpec) -> Self {
        Self::uniform_error(spec, &PathError::DocumentNotFound, LookupStatus::DocumentNotFound)
    }

    /// A result for a spec whose lookup failed as a whole.
    pub fn failed(spec: &SubdocLookupSpec, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::uniform_error(
            spec,
            &PathError::LookupFailed {
                reason: reason.clone(),
            },
            LookupStatus::Failed { reason },
        )
    }

    fn uniform_error(spec: &SubdocLookupSpec, err: &PathError, status: LookupStatus) -> Self {
        Self {
            id: spec.id().to_owned(),
            cas: None,
            content: spec
                .get_paths()
                .iter()
                .map(|p| (p.clone(), Err(err.clone())))
                .collect(),
            exists: spec
                .exists_paths()
                .iter()
                .map(|p| (p.clone(), Err(err.clone())))
                .collect(),
            status,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Content-change token, absent when the document was not read.
    pub const fn cas(&self) -> Option<u64> {
        self.cas
    }

    pub const fn status(&self) -> &LookupStatus {
        &self.status
    }

    /// Value or error for a requested `get` path.
    pub fn value(&self, path: &str) -> Option<&Result<Value, PathError>> {
        self.content.get(path)
    }

    /// Presence or error for a requested `exists` path.
    pub fn exists(&self, path: &str) -> Option<&Result<bool, PathError>> {
        self.exists.get(path)
    }

    pub const fn content(&self) -> &BTreeMap<String, Result<Value, PathError>> {
        &self.content
    }

    pub const fn exists_map(&self) -> &BTreeMap<String, Result<bool, PathError>> {
        &self.exists
    }
}
