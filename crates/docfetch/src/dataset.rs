//! Partitioned datasets handed to the host engine.
//!
//! A dataset is a cheap, cloneable description of a retrieval: the caller's
//! input, the partition plan over it, and a handle to the engine that will do
//! the work. Nothing touches the cluster until the host engine calls
//! [`PartitionedDataset::compute`] for a partition, and every call starts from
//! scratch, so a partition can be re-executed after a worker failure and
//! produce the same items.

use crate::{
    client::Connector,
    decoder::Decoder,
    dispatcher::QueryObject,
    engine::EngineInner,
    error::{ClientError, Error, Result},
    model::{SubdocLookupResult, SubdocLookupSpec},
    planner::Partition,
    sequencer::{self, ResultSequence, SequenceStats, TaskContext},
};
use futures::TryStreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What the host engine sees: a set of partitions, where each prefers to
/// run, and how to compute one.
pub trait PartitionedDataset {
    type Item: Send + 'static;

    fn partitions(&self) -> &[Partition];

    /// Nodes on which `partition` would ideally run. Purely advisory.
    fn preferred_locations(&self, partition: &Partition) -> Vec<String> {
        partition
            .preferred_location()
            .map(|l| vec![l.to_owned()])
            .unwrap_or_default()
    }

    /// Starts executing `partition` and returns its lazy result sequence.
    ///
    /// Calling this again for the same partition re-executes it from the
    /// beginning.
    fn compute(&self, partition: &Partition, ctx: &TaskContext) -> ResultSequence<Self::Item>;

    /// Runs every partition on its own thread and concatenates the results in
    /// partition order.
    ///
    /// Blocks the calling thread. Must not be called from inside an async
    /// runtime. The first partition to fail cancels its siblings.
    ///
    /// # Errors
    ///
    /// Returns the error of the partition that failed first in partition
    /// order, preferring a real failure over the cancellations it caused.
    fn collect(&self) -> Result<Vec<Self::Item>>
    where
        Self: Sync,
    {
        let job = CancellationToken::new();

        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .partitions()
                .iter()
                .map(|partition| {
                    let ctx = TaskContext::new(partition.index())
                        .with_cancellation(job.child_token());
                    let job = &job;
                    scope.spawn(move || {
                        let res = self.compute(partition, &ctx).collect::<Result<Vec<_>>>();
                        if res.is_err() {
                            job.cancel();
                        }
                        res
                    })
                })
                .collect();

            let mut items = Vec::new();
            let mut first_err: Option<Error> = None;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(partition_items)) => items.extend(partition_items),
                    Ok(Err(e)) => {
                        let replace = match &first_err {
                            None => true,
                            Some(Error::Cancelled { .. }) => !matches!(e, Error::Cancelled { .. }),
                            Some(_) => false,
                        };
                        if replace {
                            first_err = Some(e);
                        }
                    }
                    Err(panic) => {
                        job.cancel();
                        std::panic::resume_unwind(panic)
                    }
                }
            }
            first_err.map_or(Ok(items), Err)
        })
    }
}

fn partition_error(partition: usize) -> impl Fn(ClientError) -> Error + Clone {
    move |source| Error::Partition { partition, source }
}

/// Documents fetched by key, one partition per contiguous key range.
pub struct KeyValueDataset<C: Connector, D: Decoder> {
    engine: Arc<EngineInner<C>>,
    collection: String,
    keys: Arc<[String]>,
    partitions: Vec<Partition>,
    decoder: Arc<D>,
}

impl<C: Connector, D: Decoder> KeyValueDataset<C, D> {
    pub(crate) fn new(
        engine: Arc<EngineInner<C>>,
        collection: String,
        keys: Arc<[String]>,
        partitions: Vec<Partition>,
        decoder: D,
    ) -> Self {
        Self {
            engine,
            collection,
            keys,
            partitions,
            decoder: Arc::new(decoder),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl<C: Connector, D: Decoder> Clone for KeyValueDataset<C, D> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            collection: self.collection.clone(),
            keys: Arc::clone(&self.keys),
            partitions: self.partitions.clone(),
            decoder: Arc::clone(&self.decoder),
        }
    }
}

impl<C: Connector, D: Decoder> PartitionedDataset for KeyValueDataset<C, D> {
    type Item = D::Output;

    fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    fn compute(&self, partition: &Partition, ctx: &TaskContext) -> ResultSequence<D::Output> {
        let keys = self
            .keys
            .get(partition.range())
            .map(<[String]>::to_vec)
            .unwrap_or_default();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Computing partition {} of `{}` ({} keys, attempt {})",
            partition.index(),
            self.collection,
            keys.len(),
            ctx.attempt()
        );

        let stats = Arc::new(SequenceStats::default());
        let launch = self.engine.launch(ctx, Arc::clone(&stats));

        let engine = Arc::clone(&self.engine);
        let decoder = Arc::clone(&self.decoder);
        let collection = self.collection.clone();
        let index = partition.index();

        sequencer::spawn(launch, async move {
            let conn = engine.connect(&collection).await?;
            Ok(engine
                .fetcher
                .fetch_documents(conn, keys, decoder, stats)
                .map_err(partition_error(index)))
        })
    }
}

/// Sub-document lookups, one result per spec, in spec order.
pub struct SubdocDataset<C: Connector> {
    engine: Arc<EngineInner<C>>,
    collection: String,
    specs: Arc<[SubdocLookupSpec]>,
    partitions: Vec<Partition>,
}

impl<C: Connector> SubdocDataset<C> {
    pub(crate) const fn new(
        engine: Arc<EngineInner<C>>,
        collection: String,
        specs: Arc<[SubdocLookupSpec]>,
        partitions: Vec<Partition>,
    ) -> Self {
        Self {
            engine,
            collection,
            specs,
            partitions,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn specs(&self) -> &[SubdocLookupSpec] {
        &self.specs
    }
}

impl<C: Connector> Clone for SubdocDataset<C> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            collection: self.collection.clone(),
            specs: Arc::clone(&self.specs),
            partitions: self.partitions.clone(),
        }
    }
}

impl<C: Connector> PartitionedDataset for SubdocDataset<C> {
    type Item = SubdocLookupResult;

    fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    fn compute(
        &self,
        partition: &Partition,
        ctx: &TaskContext,
    ) -> ResultSequence<SubdocLookupResult> {
        let specs = self
            .specs
            .get(partition.range())
            .map(<[SubdocLookupSpec]>::to_vec)
            .unwrap_or_default();

        let stats = Arc::new(SequenceStats::default());
        let launch = self.engine.launch(ctx, Arc::clone(&stats));

        let engine = Arc::clone(&self.engine);
        let collection = self.collection.clone();
        let index = partition.index();

        sequencer::spawn(launch, async move {
            let conn = engine.connect(&collection).await?;
            Ok(engine
                .fetcher
                .fetch_subdocs(conn, specs, stats)
                .map_err(partition_error(index)))
        })
    }
}

/// The rows of a single view, spatial view or declarative query.
///
/// Always exactly one partition: the cluster produces one ordered row stream
/// per query.
pub struct QueryDataset<C: Connector, Q: QueryObject> {
    engine: Arc<EngineInner<C>>,
    collection: String,
    query: Q,
    partitions: Vec<Partition>,
}

impl<C: Connector, Q: QueryObject> QueryDataset<C, Q> {
    pub(crate) fn new(engine: Arc<EngineInner<C>>, collection: String, query: Q) -> Self {
        Self {
            engine,
            collection,
            query,
            partitions: vec![Partition::new(0, 0..1)],
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub const fn query(&self) -> &Q {
        &self.query
    }
}

impl<C: Connector, Q: QueryObject> Clone for QueryDataset<C, Q> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            collection: self.collection.clone(),
            query: self.query.clone(),
            partitions: self.partitions.clone(),
        }
    }
}

impl<C: Connector, Q: QueryObject> PartitionedDataset for QueryDataset<C, Q> {
    type Item = Q::Row;

    fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    fn compute(&self, _partition: &Partition, ctx: &TaskContext) -> ResultSequence<Q::Row> {
        let launch = self.engine.launch(ctx, Arc::default());

        let engine = Arc::clone(&self.engine);
        let collection = self.collection.clone();
        let query = self.query.clone();

        sequencer::spawn(launch, async move {
            let conn = engine.connect(&collection).await?;
            engine.dispatcher.dispatch(&*conn, &query).await
        })
    }
}
