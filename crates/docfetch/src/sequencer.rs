//! Lazy, pull-based result sequences backed by a background producer task.
//!
//! The host engine consumes a partition by pulling items one at a time. The
//! fetch work runs as a task on the engine's async runtime and hands items over
//! through a bounded channel, so memory stays proportional to the channel
//! capacity rather than the partition size, and the producer only runs ahead of
//! the consumer by that many items.
//!
//! ## Lifecycle
//!
//! ```text
//! Planned -> Connecting -> Fetching -> Completed
//!                |             |
//!                +-------------+-----> Failed | Cancelled
//! ```
//!
//! - Nothing runs until the sequence is created; creating it spawns the
//!   producer.
//! - The first structural error is yielded once and the sequence then ends.
//! - Cancelling the [`TaskContext`] stops the producer at its next await point
//!   and the next pull yields [`Error::Cancelled`]. Dropping the sequence
//!   cancels the producer too.

use crate::error::{Error, Result};
use core::{
    future::Future,
    pin::{Pin, pin},
    sync::atomic::{AtomicU8, AtomicU64, Ordering},
    task::{Context, Poll, ready},
};
use futures::{Stream, StreamExt};
use pin_project_lite::pin_project;
use std::sync::Arc;
use tokio::{runtime::Handle, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Per-attempt execution context supplied by the host engine.
///
/// Clones share the same cancellation signal.
#[derive(Clone, Debug)]
pub struct TaskContext {
    partition: usize,
    attempt: u32,
    token: CancellationToken,
}

impl TaskContext {
    pub fn new(partition: usize) -> Self {
        Self {
            partition,
            attempt: 0,
            token: CancellationToken::new(),
        }
    }

    /// Marks this context as a re-execution of an earlier attempt.
    #[must_use]
    pub const fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Ties this context to `token`, typically a child of a token shared by
    /// every partition of a job so one failure can stop the rest.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub const fn partition(&self) -> usize {
        self.partition
    }

    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Requests cancellation of every sequence computed with this context.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    fn cancelled_error(&self) -> Error {
        Error::Cancelled {
            partition: self.partition,
        }
    }
}

/// Where a partition is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PartitionState {
    Planned = 0,
    Connecting = 1,
    Fetching = 2,
    Completed = 3,
    Failed = 4,
    Cancelled = 5,
}

impl PartitionState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Planned,
            1 => Self::Connecting,
            2 => Self::Fetching,
            3 => Self::Completed,
            4 => Self::Failed,
            _ => Self::Cancelled,
        }
    }

    /// Whether the partition has stopped doing work.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Live counters for one partition execution.
///
/// Keys that are missing or that failed individually never show up in the
/// result sequence. These counters are the side channel that makes them
/// observable.
#[derive(Debug)]
pub struct SequenceStats {
    state: AtomicU8,
    yielded: AtomicU64,
    not_found: AtomicU64,
    failed: AtomicU64,
}

impl Default for SequenceStats {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(PartitionState::Planned as u8),
            yielded: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }
}

impl SequenceStats {
    pub fn state(&self) -> PartitionState {
        PartitionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Items handed to the consumer.
    pub fn yielded(&self) -> u64 {
        self.yielded.load(Ordering::Relaxed)
    }

    /// Keys that did not exist.
    pub fn not_found(&self) -> u64 {
        self.not_found.load(Ordering::Relaxed)
    }

    /// Keys whose fetch or decode failed without failing the partition.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn set_state(&self, state: PartitionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn record_yielded(&self) {
        self.yielded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Consumer-side bookkeeping shared by the blocking and async views.
#[derive(Debug)]
struct Tail {
    ctx: TaskContext,
    stats: Arc<SequenceStats>,
    done: bool,
    _guard: DropGuard,
}

impl Tail {
    /// Checked before every pull so a cancelled sequence stops promptly even
    /// when items are already buffered.
    fn precheck<T>(&mut self) -> Option<Option<Result<T>>> {
        if self.done {
            return Some(None);
        }
        if self.ctx.is_cancelled() {
            self.done = true;
            return Some(Some(Err(self.ctx.cancelled_error())));
        }
        None
    }

    fn settle<T>(&mut self, item: Option<Result<T>>) -> Option<Result<T>> {
        match item {
            Some(Ok(_)) if self.ctx.is_cancelled() => {
                self.done = true;
                Some(Err(self.ctx.cancelled_error()))
            }
            Some(Ok(item)) => {
                self.stats.record_yielded();
                Some(Ok(item))
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                if self.stats.state().is_terminal() {
                    return None;
                }
                // The producer went away without settling the partition: it
                // panicked, or its runtime shut down before it could run.
                self.stats.set_state(PartitionState::Failed);
                Some(Err(Error::ChannelError {
                    context: format!(
                        "partition {} producer exited without completing",
                        self.ctx.partition
                    ),
                }))
            }
        }
    }
}

/// The lazy result sequence of one partition, consumed by blocking pulls.
///
/// Implements [`Iterator`]. Each call to `next` blocks the calling thread
/// until the producer has an item ready, so it must not be driven from inside
/// an async runtime; use [`into_stream`](Self::into_stream) there.
#[derive(Debug)]
pub struct ResultSequence<T> {
    rx: mpsc::Receiver<Result<T>>,
    tail: Tail,
}

impl<T> ResultSequence<T> {
    /// Index of the partition this sequence was computed for.
    pub const fn partition_index(&self) -> usize {
        self.tail.ctx.partition
    }

    pub fn state(&self) -> PartitionState {
        self.tail.stats.state()
    }

    pub fn stats(&self) -> &SequenceStats {
        &self.tail.stats
    }

    /// A shared handle to the counters that outlives the sequence.
    pub fn stats_handle(&self) -> Arc<SequenceStats> {
        Arc::clone(&self.tail.stats)
    }

    /// Converts into an async [`Stream`] with the same items and termination
    /// rules.
    pub fn into_stream(self) -> ResultStream<T> {
        ResultStream {
            inner: ReceiverStream::new(self.rx),
            tail: self.tail,
        }
    }
}

impl<T> Iterator for ResultSequence<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(early) = self.tail.precheck() {
            return early;
        }
        let item = self.rx.blocking_recv();
        self.tail.settle(item)
    }
}

pin_project! {
    /// Async view of a [`ResultSequence`].
    #[derive(Debug)]
    pub struct ResultStream<T> {
        #[pin]
        inner: ReceiverStream<Result<T>>,
        tail: Tail,
    }
}

impl<T> ResultStream<T> {
    pub fn stats(&self) -> &SequenceStats {
        &self.tail.stats
    }
}

impl<T> Stream for ResultStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if let Some(early) = this.tail.precheck() {
            return Poll::Ready(early);
        }
        let item = ready!(this.inner.poll_next(cx));
        Poll::Ready(this.tail.settle(item))
    }
}

/// Everything needed to start a partition's producer.
pub(crate) struct Launch<'a> {
    pub handle: &'a Handle,
    pub ctx: TaskContext,
    pub shutdown: CancellationToken,
    pub buffer: usize,
    pub stats: Arc<SequenceStats>,
}

/// Spawns the producer for one partition and returns the consumer side.
///
/// `open` performs the connecting phase and resolves to the item stream; the
/// first `Err` it or the stream produces ends the partition.
pub(crate) fn spawn<T, S, F>(launch: Launch<'_>, open: F) -> ResultSequence<T>
where
    T: Send + 'static,
    S: Stream<Item = Result<T>> + Send + 'static,
    F: Future<Output = Result<S>> + Send + 'static,
{
    let Launch {
        handle,
        ctx,
        shutdown,
        buffer,
        stats,
    } = launch;

    let (tx, rx) = mpsc::channel(buffer.max(1));
    let producer_token = ctx.token.child_token();
    let guard = producer_token.clone().drop_guard();

    let task = produce(
        ctx.partition,
        tx,
        Arc::clone(&stats),
        producer_token,
        shutdown,
        open,
    );

    #[cfg(feature = "tracing")]
    let task = {
        use tracing::Instrument;
        let span = tracing::info_span!("partition", index = ctx.partition, attempt = ctx.attempt);
        task.instrument(span)
    };

    handle.spawn(task);

    ResultSequence {
        rx,
        tail: Tail {
            ctx,
            stats,
            done: false,
            _guard: guard,
        },
    }
}

async fn produce<T, S, F>(
    partition: usize,
    tx: mpsc::Sender<Result<T>>,
    stats: Arc<SequenceStats>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    open: F,
) where
    S: Stream<Item = Result<T>> + Send,
    F: Future<Output = Result<S>> + Send,
{
    stats.set_state(PartitionState::Connecting);

    let body = async {
        let stream = open.await?;
        stats.set_state(PartitionState::Fetching);
        let mut stream = pin!(stream);
        while let Some(item) = stream.next().await {
            let item = item?;
            if tx.send(Ok(item)).await.is_err() {
                return Ok(false);
            }
        }
        Ok::<bool, Error>(true)
    };

    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled { partition }),
        () = shutdown.cancelled() => Err(Error::Shutdown),
        result = body => result,
    };

    match outcome {
        Ok(true) => {
            stats.set_state(PartitionState::Completed);
            #[cfg(feature = "tracing")]
            tracing::debug!("Partition {partition} completed");
        }
        Ok(false) => {
            stats.set_state(PartitionState::Cancelled);
            #[cfg(feature = "tracing")]
            tracing::debug!("Consumer went away, stopped partition {partition}");
        }
        Err(e) => {
            stats.set_state(match e {
                Error::Cancelled { .. } => PartitionState::Cancelled,
                _ => PartitionState::Failed,
            });

            #[cfg(feature = "tracing")]
            tracing::warn!("Partition {partition} ended: {e}");

            // The consumer may already be gone; nothing left to report to.
            if let Err(_e) = tx.send(Err(e)).await {
                #[cfg(feature = "tracing")]
                tracing::debug!("Failed to forward err: {_e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use core::time::Duration;
    use futures::stream;
    use tokio::runtime::{Builder, Runtime};

    fn runtime() -> Runtime {
        Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn launch<'a>(handle: &'a Handle, ctx: TaskContext, buffer: usize) -> Launch<'a> {
        Launch {
            handle,
            ctx,
            shutdown: CancellationToken::new(),
            buffer,
            stats: Arc::default(),
        }
    }

    fn numbers(n: u32) -> impl Future<Output = Result<impl Stream<Item = Result<u32>>>> {
        async move { Ok(stream::iter((0..n).map(Ok::<u32, Error>))) }
    }

    #[test]
    fn yields_all_items_then_completes() {
        let rt = runtime();
        let seq = spawn(launch(rt.handle(), TaskContext::new(3), 4), numbers(100));
        let stats = seq.stats_handle();
        assert_eq!(seq.partition_index(), 3);

        let items: Vec<u32> = seq.map(Result::unwrap).collect();
        assert_eq!(items, (0..100).collect::<Vec<_>>());
        assert_eq!(stats.yielded(), 100);
        assert_eq!(stats.state(), PartitionState::Completed);
    }

    #[test]
    fn open_failure_is_yielded_once() {
        let rt = runtime();
        let open = async {
            Err::<stream::Empty<Result<u32>>, _>(Error::Connection {
                collection: "c".into(),
                attempts: 3,
                source: ClientError::Timeout {
                    operation: "connect".into(),
                },
            })
        };
        let mut seq = spawn(launch(rt.handle(), TaskContext::new(2), 4), open);

        assert!(matches!(seq.next(), Some(Err(Error::Connection { .. }))));
        assert!(seq.next().is_none());
        assert_eq!(seq.state(), PartitionState::Failed);
    }

    #[test]
    fn mid_stream_error_is_terminal() {
        let rt = runtime();
        let open = async {
            let items = vec![
                Ok(1),
                Ok(2),
                Err(Error::Partition {
                    partition: 0,
                    source: ClientError::ConnectionLost {
                        reason: "reset".into(),
                    },
                }),
                Ok(3),
            ];
            Ok(stream::iter(items))
        };
        let results: Vec<_> = spawn(launch(rt.handle(), TaskContext::new(0), 1), open).collect();

        assert_eq!(results.len(), 3);
        assert!(matches!(results[2], Err(Error::Partition { .. })));
    }

    #[test]
    fn cancellation_stops_the_producer() {
        let rt = runtime();
        let ctx = TaskContext::new(7);
        let open = async {
            Ok(stream::iter(0..).then(|i| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, Error>(i)
            }))
        };
        let mut seq = spawn(launch(rt.handle(), ctx.clone(), 2), open);

        assert_eq!(seq.next().unwrap().unwrap(), 0);
        ctx.cancel();

        assert!(matches!(
            seq.next(),
            Some(Err(Error::Cancelled { partition: 7 }))
        ));
        assert!(seq.next().is_none());

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(seq.state(), PartitionState::Cancelled);
    }

    #[test]
    fn engine_shutdown_fails_open_sequences() {
        let rt = runtime();
        let shutdown = CancellationToken::new();
        let open = async { Ok(stream::pending::<Result<u32>>()) };
        let mut seq = spawn(
            Launch {
                shutdown: shutdown.clone(),
                ..launch(rt.handle(), TaskContext::new(0), 1)
            },
            open,
        );

        shutdown.cancel();
        assert!(matches!(seq.next(), Some(Err(Error::Shutdown))));
        assert!(seq.next().is_none());
    }

    #[test]
    fn producer_stays_within_buffer() {
        let rt = runtime();
        let pulled = Arc::new(AtomicU64::new(0));
        let open = {
            let pulled = Arc::clone(&pulled);
            async move {
                Ok(stream::iter(0..1_000u32)
                    .inspect(move |_| {
                        pulled.fetch_add(1, Ordering::SeqCst);
                    })
                    .map(Ok::<u32, Error>))
            }
        };
        let mut seq = spawn(launch(rt.handle(), TaskContext::new(0), 8), open);

        seq.next().unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        // One taken, eight buffered, one held by the blocked send.
        assert!(pulled.load(Ordering::SeqCst) <= 10);
    }

    #[test]
    fn producer_panic_fails_the_sequence() {
        let rt = runtime();
        let open = async {
            Ok(stream::iter(0..5u32).map(|i| {
                assert!(i < 2, "decoder blew up");
                Ok::<u32, Error>(i)
            }))
        };
        let seq = spawn(launch(rt.handle(), TaskContext::new(3), 1), open);
        let stats = seq.stats_handle();

        let results: Vec<_> = seq.collect();
        assert_eq!(results.len(), 3);
        assert!(results[..2].iter().all(Result::is_ok));
        assert!(matches!(results[2], Err(Error::ChannelError { .. })));
        assert_eq!(stats.state(), PartitionState::Failed);
    }

    #[test]
    fn producer_never_started_is_an_error() {
        let rt = runtime();
        let handle = rt.handle().clone();
        drop(rt);

        let mut seq = spawn(launch(&handle, TaskContext::new(0), 1), numbers(3));
        assert!(matches!(seq.next(), Some(Err(Error::ChannelError { .. }))));
        assert!(seq.next().is_none());
        assert_eq!(seq.state(), PartitionState::Failed);
    }

    #[test]
    fn dropped_consumer_is_not_completed() {
        let rt = runtime();
        let open = async { Ok(stream::iter(0..1_000u32).map(Ok::<u32, Error>)) };
        let mut seq = spawn(launch(rt.handle(), TaskContext::new(0), 1), open);
        let stats = seq.stats_handle();

        seq.next().unwrap().unwrap();
        drop(seq);

        for _ in 0..100 {
            if stats.state().is_terminal() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stats.state(), PartitionState::Cancelled);
    }

    #[test]
    fn stream_view_matches_iterator() {
        let rt = runtime();
        let seq = spawn(launch(rt.handle(), TaskContext::new(0), 4), numbers(10));
        let items: Vec<u32> = rt.block_on(seq.into_stream().map(Result::unwrap).collect());
        assert_eq!(items, (0..10).collect::<Vec<_>>());
    }
}
