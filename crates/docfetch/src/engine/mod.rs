//! The caller-facing composition of planner, registry, fetcher, dispatcher and
//! sequencer.
//!
//! A [`RetrievalEngine`] is created once per process. Each retrieval call
//! validates nothing against the cluster: it only plans partitions and returns
//! a dataset. Connection establishment and fetching happen when the host
//! engine computes a partition.
//!
//! ## Connecting
//!
//! The first thing every partition does is acquire the connection for its
//! collection from the shared [`ConnectionRegistry`]. Transient failures
//! ([`ClientError::is_transient`]) are retried up to
//! [`EngineConfig::connect_retries`] times, waiting `n *
//! connect_backoff` before attempt `n + 1`. Anything else fails the partition
//! immediately with [`Error::Connection`].

#[cfg(test)]
mod tests;

use crate::{
    client::Connector,
    config::{EngineConfig, RetrieveOptions},
    dataset::{KeyValueDataset, QueryDataset, SubdocDataset},
    decoder::Decoder,
    dispatcher::{QueryDispatcher, QueryObject},
    error::{ClientError, Error, Result},
    fetcher::BulkFetcher,
    model::{SpatialViewQuery, Statement, SubdocLookupSpec, ViewQuery},
    planner::{Partition, PartitionPlanner},
    registry::ConnectionRegistry,
    sequencer::{Launch, SequenceStats, TaskContext},
};
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;

/// Shuts an engine-owned runtime down without blocking, so the engine may be
/// dropped from any context.
struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

pub(crate) struct EngineInner<C: Connector> {
    pub(crate) config: EngineConfig,
    pub(crate) registry: ConnectionRegistry<C>,
    pub(crate) fetcher: BulkFetcher,
    pub(crate) dispatcher: QueryDispatcher,
    handle: Handle,
    shutdown: CancellationToken,
    // Declared last so tasks are torn down after everything they reference.
    _runtime: Option<OwnedRuntime>,
}

impl<C: Connector> EngineInner<C> {
    pub(crate) fn launch(&self, ctx: &TaskContext, stats: Arc<SequenceStats>) -> Launch<'_> {
        Launch {
            handle: &self.handle,
            ctx: ctx.clone(),
            shutdown: self.shutdown.clone(),
            buffer: self.config.sequence_buffer,
            stats,
        }
    }

    /// Acquires the shared connection for `collection`, retrying transient
    /// failures with linear backoff.
    pub(crate) async fn connect(&self, collection: &str) -> Result<Arc<C::Connection>> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.registry.acquire(collection).await {
                Ok(conn) => return Ok(conn),
                Err(ClientError::Shutdown) => return Err(Error::Shutdown),
                Err(e) if e.is_transient() && attempts <= self.config.connect_retries => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        "Connect attempt {attempts} to `{collection}` failed, retrying: {e}"
                    );

                    tokio::time::sleep(self.config.connect_backoff * attempts).await;
                }
                Err(source) => {
                    return Err(Error::Connection {
                        collection: collection.to_owned(),
                        attempts,
                        source,
                    });
                }
            }
        }
    }
}

/// Partition-aware bulk retrieval and query execution against a cluster.
///
/// ```
/// use docfetch::{
///     EngineConfig, PartitionedDataset, RetrievalEngine, RetrieveOptions,
///     memory::MemoryCluster,
/// };
/// use serde_json::json;
///
/// let cluster = MemoryCluster::new();
/// cluster.insert("default", "u1", &json!({"name": "ada"}));
/// cluster.insert("default", "u2", &json!({"name": "bob"}));
///
/// let engine = RetrievalEngine::new(EngineConfig::default(), cluster)?;
/// let docs = engine
///     .retrieve_documents(["u1", "u2", "missing"], RetrieveOptions::new())
///     .collect()?;
///
/// assert_eq!(docs.len(), 2);
/// # Ok::<(), docfetch::Error>(())
/// ```
pub struct RetrievalEngine<C: Connector> {
    inner: Arc<EngineInner<C>>,
}

impl<C: Connector> Clone for RetrievalEngine<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> RetrievalEngine<C> {
    /// Creates an engine that owns a multi-threaded runtime with
    /// [`EngineConfig::worker_threads`] workers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an unusable configuration and
    /// [`Error::Runtime`] if the runtime cannot be built.
    pub fn new(config: EngineConfig, connector: C) -> Result<Self> {
        config.validate()?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("docfetch-worker")
            .enable_all()
            .build()
            .map_err(|e| Error::Runtime {
                context: format!("Failed to build runtime: {e}"),
            })?;
        let handle = runtime.handle().clone();
        Ok(Self::from_parts(
            config,
            connector,
            handle,
            Some(OwnedRuntime(Some(runtime))),
        ))
    }

    /// Creates an engine that spawns its work on an existing runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an unusable configuration.
    pub fn with_handle(config: EngineConfig, connector: C, handle: Handle) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, connector, handle, None))
    }

    fn from_parts(
        config: EngineConfig,
        connector: C,
        handle: Handle,
        runtime: Option<OwnedRuntime>,
    ) -> Self {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting retrieval engine (parallelism={}, max_concurrency={}, buffer={})",
            config.default_parallelism,
            config.max_concurrency,
            config.sequence_buffer
        );

        Self {
            inner: Arc::new(EngineInner {
                registry: ConnectionRegistry::new(connector, config.shutdown_timeout),
                fetcher: BulkFetcher::new(config.max_concurrency),
                dispatcher: QueryDispatcher::new(),
                handle,
                shutdown: CancellationToken::new(),
                _runtime: runtime,
                config,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ConnectionRegistry<C> {
        &self.inner.registry
    }

    /// The runtime partitions execute on.
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Plans a bulk get of `keys`.
    ///
    /// Keys that do not exist, or whose fetch or decode fails on its own, are
    /// silently left out of the result; see
    /// [`SequenceStats`] for how many. An empty key list yields a dataset
    /// with no partitions.
    pub fn retrieve_documents<I, D>(
        &self,
        keys: I,
        opts: RetrieveOptions<D>,
    ) -> KeyValueDataset<C, D>
    where
        I: IntoIterator,
        I::Item: Into<String>,
        D: Decoder,
    {
        let keys: Arc<[String]> = keys.into_iter().map(Into::into).collect();
        let collection = opts.resolve_collection(&self.inner.config);
        let parallelism = opts.resolve_parallelism(&self.inner.config);
        let partitions = self.plan(&keys, &collection, parallelism);

        KeyValueDataset::new(
            Arc::clone(&self.inner),
            collection,
            keys,
            partitions,
            opts.decoder,
        )
    }

    /// Plans a sub-document lookup of the same `get` and `exists` paths in
    /// every key.
    pub fn retrieve_subdocs<I, G, E>(
        &self,
        keys: I,
        get: G,
        exists: E,
        opts: RetrieveOptions,
    ) -> SubdocDataset<C>
    where
        I: IntoIterator,
        I::Item: Into<String>,
        G: IntoIterator,
        G::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        let get: Vec<String> = get.into_iter().map(Into::into).collect();
        let exists: Vec<String> = exists.into_iter().map(Into::into).collect();
        let specs = keys
            .into_iter()
            .map(|key| SubdocLookupSpec::new(key, get.iter().cloned(), exists.iter().cloned()));
        self.lookup_subdocs(specs, opts)
    }

    /// Plans sub-document lookups for individually specified documents.
    ///
    /// Every spec produces exactly one [`SubdocLookupResult`], in spec order.
    ///
    /// [`SubdocLookupResult`]: crate::SubdocLookupResult
    pub fn lookup_subdocs<I>(&self, specs: I, opts: RetrieveOptions) -> SubdocDataset<C>
    where
        I: IntoIterator<Item = SubdocLookupSpec>,
    {
        let specs: Arc<[SubdocLookupSpec]> = specs.into_iter().collect();
        let ids: Vec<String> = specs.iter().map(|s| s.id().to_owned()).collect();
        let collection = opts.resolve_collection(&self.inner.config);
        let parallelism = opts.resolve_parallelism(&self.inner.config);
        let partitions = self.plan(&ids, &collection, parallelism);

        SubdocDataset::new(Arc::clone(&self.inner), collection, specs, partitions)
    }

    pub fn run_view(&self, query: ViewQuery, opts: RetrieveOptions) -> QueryDataset<C, ViewQuery> {
        self.run(query, &opts)
    }

    pub fn run_spatial_view(
        &self,
        query: SpatialViewQuery,
        opts: RetrieveOptions,
    ) -> QueryDataset<C, SpatialViewQuery> {
        self.run(query, &opts)
    }

    pub fn run_query(
        &self,
        statement: Statement,
        opts: RetrieveOptions,
    ) -> QueryDataset<C, Statement> {
        self.run(statement, &opts)
    }

    /// Plans any [`QueryObject`] as a single-partition dataset.
    pub fn run<Q, D>(&self, query: Q, opts: &RetrieveOptions<D>) -> QueryDataset<C, Q>
    where
        Q: QueryObject,
    {
        QueryDataset::new(
            Arc::clone(&self.inner),
            opts.resolve_collection(&self.inner.config),
            query,
        )
    }

    fn plan(&self, keys: &[String], collection: &str, parallelism: usize) -> Vec<Partition> {
        let connector = self.inner.registry.connector();
        PartitionPlanner::new(parallelism)
            .plan_with_locality(keys, |key| connector.locate(collection, key))
    }

    /// Fails every running partition with [`Error::Shutdown`] and closes
    /// every cached connection.
    pub async fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        tracing::info!("Shutting down retrieval engine");

        self.inner.shutdown.cancel();
        self.inner.registry.shutdown().await;
    }

    /// Blocking variant of [`shutdown`](Self::shutdown). Must not be called
    /// from inside an async runtime.
    pub fn shutdown_blocking(&self) {
        self.inner.handle.block_on(self.shutdown());
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}
