//! In-process document cluster.
//!
//! [`MemoryCluster`] implements [`Connector`] over collections held in memory.
//! It behaves like a small cluster from the connector's point of view: it
//! assigns CAS values, answers sub-document lookups, serves canned view and
//! query results, spreads keys over a configurable node list for locality, and
//! can be told to misbehave (slow operations, failing connects, per-key and
//! per-query errors) so partition fault handling can be exercised without a
//! real cluster.

use super::{Connection, Connector, RowStream};
use crate::{
    error::{ClientError, PathError},
    model::{
        QueryRow, RawDocument, RawLookupResult, SpatialViewQuery, SpatialViewRow, Statement,
        SubdocLookupSpec, ViewQuery, ViewRow,
    },
};
use bytes::Bytes;
use core::time::Duration;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

/// Serialized shape of a cluster, as loaded by the CLI.
///
/// ```json
/// {
///   "nodes": ["10.0.0.1", "10.0.0.2"],
///   "collections": {
///     "default": {
///       "documents": { "u1": { "name": "ada" } },
///       "views": { "users/by_name": [{ "id": "u1", "key": "ada", "value": null }] },
///       "spatial_views": {},
///       "queries": { "SELECT name FROM default": [{ "name": "ada" }] }
///     }
///   }
/// }
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClusterFixture {
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionFixture>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CollectionFixture {
    #[serde(default)]
    pub documents: BTreeMap<String, Value>,
    #[serde(default)]
    pub views: BTreeMap<String, Vec<ViewRow>>,
    #[serde(default)]
    pub spatial_views: BTreeMap<String, Vec<SpatialViewRow>>,
    #[serde(default)]
    pub queries: BTreeMap<String, Vec<Value>>,
}

#[derive(Clone, Debug)]
struct StoredDocument {
    content: Bytes,
    cas: u64,
    expiry: Option<u32>,
}

#[derive(Default)]
struct Collection {
    documents: RwLock<BTreeMap<String, StoredDocument>>,
    views: RwLock<HashMap<String, Vec<ViewRow>>>,
    spatial_views: RwLock<HashMap<String, Vec<SpatialViewRow>>>,
    queries: RwLock<HashMap<String, Vec<Value>>>,
}

#[derive(Default)]
struct Faults {
    connect_failures: usize,
    connect_error: Option<ClientError>,
    connect_latency: Option<Duration>,
    op_latency: Option<Duration>,
    key_errors: HashMap<String, ClientError>,
    corrupt_paths: HashSet<(String, String)>,
    query_errors: HashMap<String, ClientError>,
    row_errors: HashMap<String, (usize, ClientError)>,
}

#[derive(Default)]
struct ClusterState {
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    nodes: RwLock<Vec<String>>,
    faults: Mutex<Faults>,
    next_cas: AtomicU64,
    connect_attempts: AtomicUsize,
    connections: AtomicUsize,
    closed: AtomicUsize,
    gets: AtomicUsize,
}

/// An in-memory cluster. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a cluster from a fixture, creating every collection it names.
    pub fn from_fixture(fixture: ClusterFixture) -> Self {
        let cluster = Self::new().with_nodes(fixture.nodes);
        for (name, collection) in fixture.collections {
            cluster.create_collection(&name);
            for (id, content) in collection.documents {
                cluster.insert(&name, &id, &content);
            }
            for (path, rows) in collection.views {
                let (design, view) = split_view_path(&path);
                cluster.add_view_rows(&name, design, view, rows);
            }
            for (path, rows) in collection.spatial_views {
                let (design, view) = split_view_path(&path);
                cluster.add_spatial_view_rows(&name, design, view, rows);
            }
            for (statement, rows) in collection.queries {
                cluster.add_query_rows(&name, &statement, rows);
            }
        }
        cluster
    }

    /// Sets the nodes keys are spread over for [`Connector::locate`].
    #[must_use]
    pub fn with_nodes<I>(self, nodes: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        *self.state.nodes.write() = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn create_collection(&self, name: &str) {
        self.state
            .collections
            .write()
            .entry(name.to_owned())
            .or_default();
    }

    fn collection(&self, name: &str) -> Arc<Collection> {
        Arc::clone(
            self.state
                .collections
                .write()
                .entry(name.to_owned())
                .or_default(),
        )
    }

    /// Stores a JSON document, creating the collection if needed. Returns the
    /// new CAS.
    pub fn insert(&self, collection: &str, id: &str, content: &Value) -> u64 {
        self.insert_raw(collection, id, Bytes::from(content.to_string()), None)
    }

    /// Stores raw content as-is. Returns the new CAS.
    pub fn insert_raw(
        &self,
        collection: &str,
        id: &str,
        content: impl Into<Bytes>,
        expiry: Option<u32>,
    ) -> u64 {
        let cas = self.state.next_cas.fetch_add(1, Ordering::Relaxed) + 1;
        self.collection(collection).documents.write().insert(
            id.to_owned(),
            StoredDocument {
                content: content.into(),
                cas,
                expiry,
            },
        );
        cas
    }

    pub fn remove(&self, collection: &str, id: &str) -> bool {
        self.collection(collection)
            .documents
            .write()
            .remove(id)
            .is_some()
    }

    pub fn add_view_rows(&self, collection: &str, design: &str, view: &str, rows: Vec<ViewRow>) {
        self.collection(collection)
            .views
            .write()
            .entry(view_path(design, view))
            .or_default()
            .extend(rows);
    }

    pub fn add_spatial_view_rows(
        &self,
        collection: &str,
        design: &str,
        view: &str,
        rows: Vec<SpatialViewRow>,
    ) {
        self.collection(collection)
            .spatial_views
            .write()
            .entry(view_path(design, view))
            .or_default()
            .extend(rows);
    }

    pub fn add_query_rows(&self, collection: &str, statement: &str, rows: Vec<Value>) {
        self.collection(collection)
            .queries
            .write()
            .entry(statement.to_owned())
            .or_default()
            .extend(rows);
    }

    /// Makes the next `count` connection attempts fail with `err`.
    pub fn fail_connects(&self, count: usize, err: ClientError) {
        let mut faults = self.state.faults.lock();
        faults.connect_failures = count;
        faults.connect_error = Some(err);
    }

    pub fn set_connect_latency(&self, latency: Duration) {
        self.state.faults.lock().connect_latency = Some(latency);
    }

    /// Delays every key/value and sub-document operation.
    pub fn set_latency(&self, latency: Duration) {
        self.state.faults.lock().op_latency = Some(latency);
    }

    /// Makes every operation on `key` fail with `err`.
    pub fn fail_key(&self, key: &str, err: ClientError) {
        self.state.faults.lock().key_errors.insert(key.to_owned(), err);
    }

    /// Makes lookups of `path` in `key` return bytes that are not JSON.
    pub fn corrupt_path(&self, key: &str, path: &str) {
        self.state
            .faults
            .lock()
            .corrupt_paths
            .insert((key.to_owned(), path.to_owned()));
    }

    /// Makes dispatching `name` fail with `err`. `name` is `design/view` for
    /// views or the statement text for queries.
    pub fn fail_query(&self, name: &str, err: ClientError) {
        self.state
            .faults
            .lock()
            .query_errors
            .insert(name.to_owned(), err);
    }

    /// Makes the row stream of `name` fail with `err` after `rows` rows.
    pub fn fail_rows_after(&self, name: &str, rows: usize, err: ClientError) {
        self.state
            .faults
            .lock()
            .row_errors
            .insert(name.to_owned(), (rows, err));
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::Relaxed)
    }

    /// Number of connections successfully established.
    pub fn connections_established(&self) -> usize {
        self.state.connections.load(Ordering::Relaxed)
    }

    pub fn connections_closed(&self) -> usize {
        self.state.closed.load(Ordering::Relaxed)
    }

    /// Number of key/value gets that reached the cluster.
    pub fn gets_issued(&self) -> usize {
        self.state.gets.load(Ordering::Relaxed)
    }
}

impl Connector for MemoryCluster {
    type Connection = MemoryConnection;

    async fn connect(&self, collection: &str) -> Result<MemoryConnection, ClientError> {
        self.state.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let latency = self.state.faults.lock().connect_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        {
            let mut faults = self.state.faults.lock();
            if faults.connect_failures > 0 {
                faults.connect_failures -= 1;
                return Err(faults.connect_error.clone().unwrap_or(
                    ClientError::TemporaryFailure {
                        reason: "connect refused".into(),
                    },
                ));
            }
        }

        let Some(handle) = self.state.collections.read().get(collection).cloned() else {
            return Err(ClientError::Authentication {
                reason: format!("collection `{collection}` does not exist"),
            });
        };

        self.state.connections.fetch_add(1, Ordering::Relaxed);
        Ok(MemoryConnection {
            name: collection.to_owned(),
            collection: handle,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        })
    }

    fn locate(&self, _collection: &str, key: &str) -> Option<String> {
        let nodes = self.state.nodes.read();
        if nodes.is_empty() {
            return None;
        }
        let idx = (fnv1a(key.as_bytes()) % nodes.len() as u64) as usize;
        Some(nodes[idx].clone())
    }
}

/// A connection to one [`MemoryCluster`] collection.
pub struct MemoryConnection {
    name: String,
    collection: Arc<Collection>,
    state: Arc<ClusterState>,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub fn collection(&self) -> &str {
        &self.name
    }

    async fn enter(&self, key: Option<&str>) -> Result<(), ClientError> {
        let latency = self.state.faults.lock().op_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ConnectionLost {
                reason: format!("connection to `{}` is closed", self.name),
            });
        }
        if let Some(key) = key {
            if let Some(err) = self.state.faults.lock().key_errors.get(key) {
                return Err(err.clone());
            }
        }
        Ok(())
    }

    fn dispatch_rows<T>(&self, name: &str, rows: Vec<T>) -> Result<RowStream<T>, ClientError>
    where
        T: Send + 'static,
    {
        let faults = self.state.faults.lock();
        if let Some(err) = faults.query_errors.get(name) {
            return Err(err.clone());
        }
        let items: Vec<Result<T, ClientError>> = match faults.row_errors.get(name) {
            Some((after, err)) => rows
                .into_iter()
                .take(*after)
                .map(Ok)
                .chain(core::iter::once(Err(err.clone())))
                .collect(),
            None => rows.into_iter().map(Ok).collect(),
        };
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

impl Connection for MemoryConnection {
    async fn get(&self, key: &str) -> Result<Option<RawDocument>, ClientError> {
        self.state.gets.fetch_add(1, Ordering::Relaxed);
        self.enter(Some(key)).await?;

        Ok(self.collection.documents.read().get(key).map(|doc| RawDocument {
            id: key.to_owned(),
            content: doc.content.clone(),
            cas: doc.cas,
            expiry: doc.expiry,
        }))
    }

    async fn lookup_in(&self, spec: &SubdocLookupSpec) -> Result<RawLookupResult, ClientError> {
        self.enter(Some(spec.id())).await?;

        let Some(doc) = self.collection.documents.read().get(spec.id()).cloned() else {
            return Err(ClientError::NotFound);
        };
        let root: Value = serde_json::from_slice(&doc.content).map_err(|e| ClientError::Decode {
            reason: format!("document `{}` is not JSON: {e}", spec.id()),
        })?;

        let corrupt = self.state.faults.lock().corrupt_paths.clone();
        let fields = spec
            .get_paths()
            .iter()
            .map(|path| {
                let value = if corrupt.contains(&(spec.id().to_owned(), path.clone())) {
                    Ok(Bytes::from_static(b"\xff{"))
                } else {
                    resolve_path(&root, path).and_then(|v| {
                        serde_json::to_vec(v)
                            .map(Bytes::from)
                            .map_err(|e| PathError::Decode {
                                reason: e.to_string(),
                            })
                    })
                };
                (path.clone(), value)
            })
            .collect();
        let exists = spec
            .exists_paths()
            .iter()
            .map(|path| {
                let present = match resolve_path(&root, path) {
                    Ok(_) => Ok(true),
                    Err(PathError::PathNotFound) => Ok(false),
                    Err(e) => Err(e),
                };
                (path.clone(), present)
            })
            .collect();

        Ok(RawLookupResult {
            cas: doc.cas,
            fields,
            exists,
        })
    }

    async fn view_query(&self, query: &ViewQuery) -> Result<RowStream<ViewRow>, ClientError> {
        self.enter(None).await?;
        let name = view_path(query.design(), query.view());
        let rows = self
            .collection
            .views
            .read()
            .get(&name)
            .cloned()
            .ok_or_else(|| ClientError::QueryCompilation {
                reason: format!("view `{name}` does not exist"),
            })?;
        let rows = apply_view_params(rows, query.params(), |row| &row.key);
        self.dispatch_rows(&name, rows)
    }

    async fn spatial_view_query(
        &self,
        query: &SpatialViewQuery,
    ) -> Result<RowStream<SpatialViewRow>, ClientError> {
        self.enter(None).await?;
        let name = view_path(query.design(), query.view());
        let rows = self
            .collection
            .spatial_views
            .read()
            .get(&name)
            .cloned()
            .ok_or_else(|| ClientError::QueryCompilation {
                reason: format!("spatial view `{name}` does not exist"),
            })?;
        let rows = apply_spatial_params(rows, query.params());
        self.dispatch_rows(&name, rows)
    }

    async fn query(&self, statement: &Statement) -> Result<RowStream<QueryRow>, ClientError> {
        self.enter(None).await?;
        let rows = self
            .collection
            .queries
            .read()
            .get(statement.text())
            .cloned()
            .ok_or_else(|| ClientError::QueryCompilation {
                reason: format!("cannot plan statement `{}`", statement.text()),
            })?;
        self.dispatch_rows(statement.text(), rows.into_iter().map(QueryRow).collect())
    }

    async fn close(&self) -> Result<(), ClientError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.closed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

fn view_path(design: &str, view: &str) -> String {
    format!("{design}/{view}")
}

fn split_view_path(path: &str) -> (&str, &str) {
    path.split_once('/').unwrap_or(("", path))
}

/// Applies the subset of view parameters the in-memory cluster understands:
/// `key`, `keys`, `startkey`/`endkey` (inclusive, on string or number keys),
/// `descending`, `skip` and `limit`.
fn apply_view_params<T>(
    mut rows: Vec<T>,
    params: &BTreeMap<String, Value>,
    key_of: impl Fn(&T) -> &Value,
) -> Vec<T> {
    if let Some(key) = params.get("key") {
        rows.retain(|row| key_of(row) == key);
    }
    if let Some(Value::Array(keys)) = params.get("keys") {
        rows.retain(|row| keys.contains(key_of(row)));
    }
    if let Some(start) = params.get("startkey") {
        rows.retain(|row| compare_keys(key_of(row), start).is_some_and(|o| o.is_ge()));
    }
    if let Some(end) = params.get("endkey") {
        rows.retain(|row| compare_keys(key_of(row), end).is_some_and(|o| o.is_le()));
    }
    if params.get("descending") == Some(&Value::Bool(true)) {
        rows.reverse();
    }
    let skip = params.get("skip").and_then(Value::as_u64).unwrap_or(0) as usize;
    let limit = params
        .get("limit")
        .and_then(Value::as_u64)
        .map_or(usize::MAX, |l| l as usize);
    rows.into_iter().skip(skip).take(limit).collect()
}

/// Spatial rows are keyed by one number per dimension. `start_range` /
/// `end_range` bound each dimension (a `null` bound is open) and `bbox` is
/// shorthand for a two dimensional range.
fn apply_spatial_params(
    rows: Vec<SpatialViewRow>,
    params: &BTreeMap<String, Value>,
) -> Vec<SpatialViewRow> {
    let as_bounds = |v: Option<&Value>| -> Vec<Option<f64>> {
        v.and_then(Value::as_array)
            .map(|dims| dims.iter().map(Value::as_f64).collect())
            .unwrap_or_default()
    };
    let (mut start, mut end) = (
        as_bounds(params.get("start_range")),
        as_bounds(params.get("end_range")),
    );
    if let [min_x, min_y, max_x, max_y] = as_bounds(params.get("bbox"))[..] {
        start = vec![min_x, min_y];
        end = vec![max_x, max_y];
    }

    let within = |row: &SpatialViewRow| {
        let Some(point) = row.key.as_array() else {
            return start.is_empty() && end.is_empty();
        };
        point.iter().enumerate().all(|(dim, coord)| {
            let Some(coord) = coord.as_f64() else {
                return false;
            };
            let lower = start.get(dim).copied().flatten().is_none_or(|lo| coord >= lo);
            let upper = end.get(dim).copied().flatten().is_none_or(|hi| coord <= hi);
            lower && upper
        })
    };

    let skip = params.get("skip").and_then(Value::as_u64).unwrap_or(0) as usize;
    let limit = params
        .get("limit")
        .and_then(Value::as_u64)
        .map_or(usize::MAX, |l| l as usize);
    rows.into_iter()
        .filter(within)
        .skip(skip)
        .take(limit)
        .collect()
}

fn compare_keys(a: &Value, b: &Value) -> Option<core::cmp::Ordering> {
    match (a, b) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        _ => None,
    }
}

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Field(&'a str),
    Index(usize),
}

/// Parses `a.b[0].c` into field and index segments.
fn parse_path(path: &str) -> Result<Vec<Segment<'_>>, PathError> {
    let invalid = |reason: &str| PathError::InvalidPath {
        reason: format!("`{path}`: {reason}"),
    };

    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return Err(invalid("empty segment"));
        }
        let (name, mut rest) = part.find('[').map_or((part, ""), |i| part.split_at(i));
        if !name.is_empty() {
            segments.push(Segment::Field(name));
        }
        while !rest.is_empty() {
            let Some(inner) = rest.strip_prefix('[') else {
                return Err(invalid("unexpected characters after index"));
            };
            let Some(end) = inner.find(']') else {
                return Err(invalid("unterminated index"));
            };
            let idx = inner[..end]
                .parse::<usize>()
                .map_err(|_| invalid("index is not a number"))?;
            segments.push(Segment::Index(idx));
            rest = &inner[end + 1..];
        }
    }
    Ok(segments)
}

fn resolve_path<'v>(root: &'v Value, path: &str) -> Result<&'v Value, PathError> {
    let mut current = root;
    for segment in parse_path(path)? {
        current = match (segment, current) {
            (Segment::Field(name), Value::Object(map)) => {
                map.get(name).ok_or(PathError::PathNotFound)?
            }
            (Segment::Index(idx), Value::Array(items)) => {
                items.get(idx).ok_or(PathError::PathNotFound)?
            }
            _ => return Err(PathError::PathMismatch),
        };
    }
    Ok(current)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}
