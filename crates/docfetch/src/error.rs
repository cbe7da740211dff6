//! Error types for bulk retrieval and query dispatch.
//!
//! Errors are split by where they originate and how far they travel:
//!
//! - [`ClientError`]: reported by the external cluster client for a single
//!   operation. Most variants are absorbed per item by the bulk fetcher; the
//!   fatal ones ([`ClientError::is_fatal`]) escalate to the partition.
//! - [`PathError`]: a failure scoped to one sub-document path. Always folded
//!   into the [`SubdocLookupResult`] and never raised.
//! - [`DecodeError`]: a [`Decoder`] rejected a document's content.
//! - [`Error`]: structural failures that end a partition's result sequence and
//!   are surfaced to the host engine (connection, streaming, query, cancel).
//!
//! [`SubdocLookupResult`]: crate::SubdocLookupResult
//! [`Decoder`]: crate::Decoder

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors reported by the external cluster client.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum ClientError {
    /// The requested document does not exist.
    #[error("Document not found")]
    NotFound,

    /// The operation did not complete before the client's deadline.
    #[error("Operation `{operation}` timed out")]
    Timeout { operation: String },

    /// The cluster asked the client to back off and retry.
    #[error("Temporary failure: {reason}")]
    TemporaryFailure { reason: String },

    /// The channel to the cluster went away mid-operation.
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// Credentials were rejected or the collection is not accessible.
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    /// The cluster refused to compile a query or view request.
    #[error("Query compilation failed: {reason}")]
    QueryCompilation { reason: String },

    /// The cluster failed while executing a query or view request.
    #[error("Query execution failed: {reason}")]
    QueryExecution { reason: String },

    /// A payload returned by the cluster could not be decoded.
    #[error("Decode failed: {reason}")]
    Decode { reason: String },

    /// The registry no longer hands out connections.
    #[error("Connection registry is shut down")]
    Shutdown,

    /// Anything else the client could not classify.
    #[error("Client error: {reason}")]
    Other { reason: String },
}

impl ClientError {
    /// Whether the operation may succeed if simply attempted again.
    ///
    /// Only transient errors are retried while a partition is connecting.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::TemporaryFailure { .. } | Self::ConnectionLost { .. }
        )
    }

    /// Whether the error invalidates the whole connection rather than one
    /// item, and must therefore fail the partition.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost { .. } | Self::Authentication { .. } | Self::Shutdown
        )
    }
}

/// A failure scoped to a single sub-document path.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum PathError {
    /// The path does not exist in the document.
    #[error("Path not found")]
    PathNotFound,

    /// The path traverses through a value of the wrong shape (e.g. indexes
    /// into an object or descends into a scalar).
    #[error("Path mismatch")]
    PathMismatch,

    /// The path syntax is not valid.
    #[error("Invalid path: {reason}")]
    InvalidPath { reason: String },

    /// The enclosing document does not exist.
    #[error("Document not found")]
    DocumentNotFound,

    /// The value at the path could not be decoded.
    #[error("Decode failed: {reason}")]
    Decode { reason: String },

    /// The lookup for the enclosing document failed as a whole.
    #[error("Lookup failed: {reason}")]
    LookupFailed { reason: String },
}

/// A [`Decoder`](crate::Decoder) could not turn raw content into its output.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[error("Failed to decode document `{id}`: {reason}")]
pub struct DecodeError {
    pub id: String,
    pub reason: String,
}

impl From<DecodeError> for ClientError {
    fn from(err: DecodeError) -> Self {
        Self::Decode {
            reason: err.to_string(),
        }
    }
}

/// Structural errors that terminate a partition's result sequence.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// A connection to the collection could not be established.
    #[error("Failed to connect to collection `{collection}` after {attempts} attempt(s): {source}")]
    Connection {
        collection: String,
        attempts: u32,
        #[source]
        source: ClientError,
    },

    /// A fatal client error interrupted a partition mid-fetch.
    #[error("Partition {partition} failed: {source}")]
    Partition {
        partition: usize,
        #[source]
        source: ClientError,
    },

    /// A view, spatial view or declarative query failed.
    #[error("{kind} failed: {source}")]
    Query {
        kind: &'static str,
        #[source]
        source: ClientError,
    },

    /// The host engine cancelled the partition.
    #[error("Partition {partition} was cancelled")]
    Cancelled { partition: usize },

    /// Internal channel send/receive failure.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The engine configuration is not usable.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The engine is shutting down and refuses new work.
    #[error("Engine is shutting down")]
    Shutdown,

    /// The async runtime could not be created.
    #[error("Runtime error: {context}")]
    Runtime { context: String },
}

impl Error {
    /// The client error behind this failure, if there is one.
    pub const fn client_error(&self) -> Option<&ClientError> {
        match self {
            Self::Connection { source, .. }
            | Self::Partition { source, .. }
            | Self::Query { source, .. } => Some(source),
            _ => None,
        }
    }
}
