//! Engine-wide settings and per-call retrieval options.
//!
//! [`EngineConfig`] is fixed for the lifetime of a
//! [`RetrievalEngine`](crate::RetrievalEngine). [`RetrieveOptions`] are
//! supplied per call and override the engine defaults where set.

use crate::{
    decoder::JsonDecoder,
    error::{Error, Result},
};
use core::time::Duration;

/// Collection used when a call does not name one.
pub const DEFAULT_COLLECTION: &str = "default";

/// Upper bound on in-flight client operations per partition.
pub const DEFAULT_MAX_CONCURRENCY: usize = 64;

/// Capacity of the channel between a partition's producer and its consumer.
/// Bounds how far fetching runs ahead of the consumer.
pub const DEFAULT_SEQUENCE_BUFFER: usize = 256;

/// Extra connection attempts made after a transient failure.
pub const DEFAULT_CONNECT_RETRIES: u32 = 3;

/// Base delay between connection attempts; attempt `n` waits `n` times this.
pub const DEFAULT_CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Deadline for closing a single connection at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Worker threads of an engine-owned runtime.
pub const DEFAULT_WORKER_THREADS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub default_collection: String,
    /// Partitions per bulk call when the call does not say otherwise.
    pub default_parallelism: usize,
    pub max_concurrency: usize,
    pub sequence_buffer: usize,
    pub connect_retries: u32,
    pub connect_backoff: Duration,
    pub shutdown_timeout: Duration,
    pub worker_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_collection: DEFAULT_COLLECTION.to_owned(),
            default_parallelism: num_cpus::get(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            sequence_buffer: DEFAULT_SEQUENCE_BUFFER,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            connect_backoff: DEFAULT_CONNECT_BACKOFF,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }
}

impl EngineConfig {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first setting that is not
    /// usable.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("default_parallelism", self.default_parallelism),
            ("max_concurrency", self.max_concurrency),
            ("sequence_buffer", self.sequence_buffer),
            ("worker_threads", self.worker_threads),
        ];
        if let Some((name, _)) = checks.iter().find(|(_, v)| *v == 0) {
            return Err(Error::InvalidConfig {
                reason: format!("{name} must be greater than 0"),
            });
        }
        if self.default_collection.is_empty() {
            return Err(Error::InvalidConfig {
                reason: "default_collection must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Per-call options for the bulk and query operations.
///
/// ```
/// use docfetch::{RetrieveOptions, TypedDecoder};
///
/// #[derive(serde::Deserialize)]
/// struct User {
///     name: String,
/// }
///
/// let opts = RetrieveOptions::new()
///     .collection("users")
///     .parallelism(8)
///     .with_decoder(TypedDecoder::<User>::new());
/// assert_eq!(opts.collection.as_deref(), Some("users"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions<D = JsonDecoder> {
    /// Falls back to [`EngineConfig::default_collection`].
    pub collection: Option<String>,
    /// Falls back to [`EngineConfig::default_parallelism`]. Zero means one.
    pub parallelism: Option<usize>,
    pub decoder: D,
}

impl RetrieveOptions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<D> RetrieveOptions<D> {
    #[must_use]
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    #[must_use]
    pub const fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    /// Swaps the decoder, keeping the other options.
    pub fn with_decoder<D2>(self, decoder: D2) -> RetrieveOptions<D2> {
        RetrieveOptions {
            collection: self.collection,
            parallelism: self.parallelism,
            decoder,
        }
    }

    pub(crate) fn resolve_collection(&self, config: &EngineConfig) -> String {
        self.collection
            .clone()
            .unwrap_or_else(|| config.default_collection.clone())
    }

    pub(crate) fn resolve_parallelism(&self, config: &EngineConfig) -> usize {
        self.parallelism.unwrap_or(config.default_parallelism)
    }
}
