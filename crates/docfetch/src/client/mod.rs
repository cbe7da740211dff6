//! Interfaces to the external document cluster client.
//!
//! The retrieval core never speaks the cluster's wire protocol itself. It
//! drives an implementation of these traits:
//!
//! - [`Connector`] - Establishes a [`Connection`] to a named collection and
//!   answers topology questions used for partition locality.
//! - [`Connection`] - A pooled, authenticated channel supporting key/value
//!   gets, sub-document lookups, view / spatial view / query execution and an
//!   explicit close.
//!
//! Async operations are expressed as `impl Future + Send` in return position
//! so implementations can be plain `async` blocks.
//!
//! [`memory`] provides an in-process cluster used by tests, benches and the
//! CLI.

pub mod memory;

use crate::{
    error::ClientError,
    model::{
        QueryRow, RawDocument, RawLookupResult, SpatialViewQuery, SpatialViewRow, Statement,
        SubdocLookupSpec, ViewQuery, ViewRow,
    },
};
use core::{future::Future, pin::Pin};
use futures::Stream;

/// A stream of rows produced by the cluster for a single query dispatch.
pub type RowStream<T> = Pin<Box<dyn Stream<Item = Result<T, ClientError>> + Send>>;

/// Creates connections to collections of the external cluster.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    /// Opens and authenticates a connection to `collection`.
    fn connect(
        &self,
        collection: &str,
    ) -> impl Future<Output = Result<Self::Connection, ClientError>> + Send;

    /// The cluster node that owns `key` in `collection`, if the topology is
    /// known without connecting. Used as a locality hint for partitions.
    fn locate(&self, _collection: &str, _key: &str) -> Option<String> {
        None
    }
}

/// A live channel to one collection, shared by every partition on the
/// process.
pub trait Connection: Send + Sync + 'static {
    /// Fetches a whole document. `Ok(None)` means the key does not exist.
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<RawDocument>, ClientError>> + Send;

    /// Reads the paths named by `spec` out of a single document.
    ///
    /// A missing document is reported as [`ClientError::NotFound`]; path
    /// level failures are reported inside the [`RawLookupResult`].
    fn lookup_in(
        &self,
        spec: &SubdocLookupSpec,
    ) -> impl Future<Output = Result<RawLookupResult, ClientError>> + Send;

    fn view_query(
        &self,
        query: &ViewQuery,
    ) -> impl Future<Output = Result<RowStream<ViewRow>, ClientError>> + Send;

    fn spatial_view_query(
        &self,
        query: &SpatialViewQuery,
    ) -> impl Future<Output = Result<RowStream<SpatialViewRow>, ClientError>> + Send;

    fn query(
        &self,
        statement: &Statement,
    ) -> impl Future<Output = Result<RowStream<QueryRow>, ClientError>> + Send;

    /// Releases the connection. Only called at registry shutdown, possibly
    /// more than once for the same connection; later calls must be no-ops.
    fn close(&self) -> impl Future<Output = Result<(), ClientError>> + Send;
}
