//! Forwarding view, spatial view and declarative queries to the cluster.
//!
//! Query objects are opaque: the dispatcher never looks inside them. Its job is
//! to pick the client call matching the query kind, label any failure with that
//! kind, and turn the row stream into a partition-level stream in which the
//! first error is terminal.

use crate::{
    client::{Connection, RowStream},
    error::{ClientError, Error, Result},
    model::{QueryRow, SpatialViewQuery, SpatialViewRow, Statement, ViewQuery, ViewRow},
};
use core::future::Future;
use futures::{StreamExt, stream::BoxStream};

/// A query the cluster can execute and the row type it produces.
pub trait QueryObject: Clone + Send + Sync + 'static {
    type Row: Send + 'static;

    /// Human readable kind used to label failures, e.g. `"View query"`.
    const KIND: &'static str;

    fn dispatch<C: Connection>(
        &self,
        conn: &C,
    ) -> impl Future<Output = Result<RowStream<Self::Row>, ClientError>> + Send;
}

impl QueryObject for ViewQuery {
    type Row = ViewRow;
    const KIND: &'static str = "View query";

    fn dispatch<C: Connection>(
        &self,
        conn: &C,
    ) -> impl Future<Output = Result<RowStream<ViewRow>, ClientError>> + Send {
        conn.view_query(self)
    }
}

impl QueryObject for SpatialViewQuery {
    type Row = SpatialViewRow;
    const KIND: &'static str = "Spatial view query";

    fn dispatch<C: Connection>(
        &self,
        conn: &C,
    ) -> impl Future<Output = Result<RowStream<SpatialViewRow>, ClientError>> + Send {
        conn.spatial_view_query(self)
    }
}

impl QueryObject for Statement {
    type Row = QueryRow;
    const KIND: &'static str = "Query";

    fn dispatch<C: Connection>(
        &self,
        conn: &C,
    ) -> impl Future<Output = Result<RowStream<QueryRow>, ClientError>> + Send {
        conn.query(self)
    }
}

/// Executes query objects against a connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryDispatcher;

impl QueryDispatcher {
    pub const fn new() -> Self {
        Self
    }

    /// Dispatches `query` and returns its rows in the order the cluster
    /// produced them.
    ///
    /// A query that matches nothing yields an empty stream, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`] if the cluster rejects the query. A failure
    /// while rows are streaming is yielded as the last item of the stream.
    pub async fn dispatch<Q, C>(
        &self,
        conn: &C,
        query: &Q,
    ) -> Result<BoxStream<'static, Result<Q::Row>>>
    where
        Q: QueryObject,
        C: Connection,
    {
        #[cfg(feature = "tracing")]
        tracing::debug!("Dispatching {}", Q::KIND);

        let rows = query.dispatch(conn).await.map_err(|source| {
            #[cfg(feature = "tracing")]
            tracing::error!("{} rejected: {source}", Q::KIND);
            Error::Query {
                kind: Q::KIND,
                source,
            }
        })?;

        Ok(rows
            .map(|row| {
                row.map_err(|source| Error::Query {
                    kind: Q::KIND,
                    source,
                })
            })
            .boxed())
    }
}
