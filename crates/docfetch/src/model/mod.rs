//! Data carried between the caller, the bulk fetcher and the cluster client.
//!
//! - [`document`] - Raw and decoded key/value documents.
//! - [`subdoc`] - Sub-document lookup specifications and results.
//! - [`row`] - Rows streamed back by views, spatial views and queries.
//! - [`query`] - Opaque query objects passed through to the cluster.

pub mod document;
pub mod query;
pub mod row;
pub mod subdoc;

pub use document::*;
pub use query::*;
pub use row::*;
pub use subdoc::*;
