//! The producing half of the client: callers enqueue messages onto a
//! bounded queue while a worker task behind it chunks the queue into
//! batches and dispatches them to the stream service with bounded
//! concurrency and per-record retry bookkeeping. Delivery is
//! at-least-once until a record's attempt budget runs out.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use exponential_backoff::Backoff;
use log::{debug, error, trace, warn};
use metrics::increment_counter;
use rand::Rng;
use tokio::time;
use tokio_stream::StreamExt;

use crate::chunker::{self, ChunkingPolicy};
use crate::concurrency::map_concurrently;
use crate::queue::{BoundedQueue, MessageQueue, WriteOutcome};
use crate::stream_service::{
    PartitionKey, PutRecordRequest, PutRecordsRequest, PutRecordsRequestEntry, StreamName,
    StreamService,
};

/// The maximum number of characters accepted for a single message.
pub const MAX_MESSAGE_SIZE: usize = 51_000;

const PARTITION_KEY_LEN: usize = 25;
const DISPATCH_STAGGER: Duration = Duration::from_millis(100);
const SEND_RETRY_BACKOFF: Duration = Duration::from_secs(5);
const MAX_WORKER_RESPAWNS: u32 = 5;
const RESPAWN_BACKOFF_FLOOR: Duration = Duration::from_millis(500);
const RESPAWN_BACKOFF_CEILING: Duration = Duration::from_secs(10);

/// A message waiting to be dispatched, together with its retry budget.
/// An item whose budget has reached zero is no longer eligible and is
/// silently dropped by the dispatch sinks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageQueueItem {
    pub payload: String,
    pub partition_key: PartitionKey,
    pub remaining_attempts: u32,
}

impl MessageQueueItem {
    pub fn is_eligible(&self) -> bool {
        self.remaining_attempts >= 1
    }

    fn decrement(mut self) -> Self {
        self.remaining_attempts = self.remaining_attempts.saturating_sub(1);
        self
    }
}

/// Which stream service endpoint the dispatch sink drives.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Endpoint {
    /// One request per record.
    Single,
    /// Batched requests of up to [BatchPolicy::batch_size] records.
    Batch,
}

/// How records are grouped onto the wire. The batch size is honoured only
/// by the batch endpoint.
#[derive(Clone, Debug)]
pub struct BatchPolicy {
    pub batch_size: usize,
    pub endpoint: Endpoint,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            batch_size: 200,
            endpoint: Endpoint::Batch,
        }
    }
}

/// How often a record is offered to the service. A freshly enqueued record
/// carries `retry_count + 1` attempts as the initial attempt counts too.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub retry_count: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { retry_count: 5 }
    }
}

/// Everything needed to run a producer. Immutable once handed to
/// [with_producer].
pub struct ProducerKit<S> {
    pub service: S,
    pub stream_name: StreamName,
    pub batch_policy: BatchPolicy,
    pub retry_policy: RetryPolicy,
    pub queue_bounds: usize,
    pub max_concurrency: usize,
    pub cleanup_timeout: Option<Duration>,
}

impl<S> ProducerKit<S> {
    pub fn new(service: S, stream_name: impl Into<StreamName>) -> Self {
        Self {
            service,
            stream_name: stream_name.into(),
            batch_policy: BatchPolicy::default(),
            retry_policy: RetryPolicy::default(),
            queue_bounds: 10_000,
            max_concurrency: 3,
            cleanup_timeout: None,
        }
    }

    pub fn with_batch_policy(mut self, batch_policy: BatchPolicy) -> Self {
        self.batch_policy = batch_policy;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_queue_bounds(mut self, queue_bounds: usize) -> Self {
        self.queue_bounds = queue_bounds;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_cleanup_timeout(mut self, cleanup_timeout: Duration) -> Self {
        self.cleanup_timeout = Some(cleanup_timeout);
        self
    }
}

/// A message was not accepted onto the producer queue.
#[derive(Debug, Eq, PartialEq)]
pub enum WriteError {
    /// The message exceeds [MAX_MESSAGE_SIZE] characters.
    MessageTooLarge,
    /// The queue is at capacity; the worker has fallen behind.
    QueueFull,
    /// The producer has begun shutting down.
    QueueClosed,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageTooLarge => f.write_str("The message exceeds the maximum size"),
            Self::QueueFull => f.write_str("The producer queue is full"),
            Self::QueueClosed => f.write_str("The producer queue is closed"),
        }
    }
}

impl Error for WriteError {}

/// The producer could not be run to completion.
#[derive(Debug)]
pub enum ProducerError {
    /// The kit's maximum concurrency is zero.
    InvalidConcurrency,
    /// The worker task ended while the caller still held the producer, or
    /// failed while draining.
    WorkerDied(Option<String>),
    /// The worker did not drain within the configured cleanup timeout and
    /// has been abandoned.
    CleanupTimedOut,
}

impl fmt::Display for ProducerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConcurrency => {
                f.write_str("The maximum concurrency must be at least one")
            }
            Self::WorkerDied(Some(cause)) => write!(f, "The producer worker died: {cause}"),
            Self::WorkerDied(None) => f.write_str("The producer worker died unexpectedly"),
            Self::CleanupTimedOut => {
                f.write_str("Timed out waiting for the producer worker to drain")
            }
        }
    }
}

impl Error for ProducerError {}

/// The handle callers write messages through. Cheap to clone; writes are
/// non-blocking and may come from any number of tasks.
#[derive(Clone)]
pub struct StreamProducer {
    queue: Arc<dyn MessageQueue<MessageQueueItem>>,
    initial_attempts: u32,
}

impl StreamProducer {
    /// Enqueue a message for delivery under a fresh random partition key.
    pub fn write(&self, message: &str) -> Result<(), WriteError> {
        if message.chars().count() > MAX_MESSAGE_SIZE {
            return Err(WriteError::MessageTooLarge);
        }
        let item = MessageQueueItem {
            payload: message.to_string(),
            partition_key: random_partition_key(),
            remaining_attempts: self.initial_attempts,
        };
        match self.queue.try_write(item) {
            WriteOutcome::Written => Ok(()),
            WriteOutcome::Full(_) => Err(WriteError::QueueFull),
            WriteOutcome::Closed(_) => Err(WriteError::QueueClosed),
        }
    }
}

// Randomised keys spread records evenly over shards; cross-shard ordering
// is deliberately given up.
fn random_partition_key() -> PartitionKey {
    let mut rng = rand::thread_rng();
    (0..PARTITION_KEY_LEN)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect()
}

/// Run `inner` with a producer whose worker dispatches in the background.
///
/// When `inner` returns, the queue is closed and the worker is waited on
/// to drain what remains, bounded by the kit's cleanup timeout when one is
/// set. The worker ending while `inner` still runs is unexpected and
/// surfaces as [ProducerError::WorkerDied].
pub async fn with_producer<S, F, Fut, A>(kit: ProducerKit<S>, inner: F) -> Result<A, ProducerError>
where
    S: StreamService + 'static,
    F: FnOnce(StreamProducer) -> Fut,
    Fut: Future<Output = A>,
{
    if kit.max_concurrency < 1 {
        return Err(ProducerError::InvalidConcurrency);
    }

    let queue: Arc<dyn MessageQueue<MessageQueueItem>> =
        Arc::new(BoundedQueue::new(kit.queue_bounds));
    let producer = StreamProducer {
        queue: queue.clone(),
        initial_attempts: kit.retry_policy.retry_count + 1,
    };
    let policy = ChunkingPolicy::for_dispatch(kit.batch_policy.batch_size, kit.max_concurrency);
    let sink = DispatchSink {
        service: kit.service,
        stream_name: kit.stream_name,
        batch_policy: kit.batch_policy,
        max_concurrency: kit.max_concurrency,
    };

    let mut worker = tokio::spawn(worker_loop(queue.clone(), sink, policy));
    let inner_fut = inner(producer);
    tokio::pin!(inner_fut);

    tokio::select! {
        result = &mut inner_fut => {
            queue.close();
            match kit.cleanup_timeout {
                Some(limit) => match time::timeout(limit, &mut worker).await {
                    Err(_) => {
                        worker.abort();
                        Err(ProducerError::CleanupTimedOut)
                    }
                    Ok(Ok(Ok(()))) => Ok(result),
                    Ok(Ok(Err(cause))) => Err(ProducerError::WorkerDied(Some(cause))),
                    Ok(Err(e)) => Err(ProducerError::WorkerDied(Some(e.to_string()))),
                },
                None => match (&mut worker).await {
                    Ok(Ok(())) => Ok(result),
                    Ok(Err(cause)) => Err(ProducerError::WorkerDied(Some(cause))),
                    Err(e) => Err(ProducerError::WorkerDied(Some(e.to_string()))),
                },
            }
        }
        exit = &mut worker => {
            queue.close();
            match exit {
                Ok(Ok(())) => Err(ProducerError::WorkerDied(None)),
                Ok(Err(cause)) => Err(ProducerError::WorkerDied(Some(cause))),
                Err(e) => Err(ProducerError::WorkerDied(Some(e.to_string()))),
            }
        }
    }
}

/// Supervises the dispatch task, respawning it a bounded number of times
/// if it dies. Respawn `n` is paced by the `n`th backoff step; the budget
/// is small enough that the table never runs dry.
async fn worker_loop<S>(
    queue: Arc<dyn MessageQueue<MessageQueueItem>>,
    sink: DispatchSink<S>,
    policy: ChunkingPolicy,
) -> Result<(), String>
where
    S: StreamService + 'static,
{
    let respawn_backoff = Backoff::new(
        MAX_WORKER_RESPAWNS,
        RESPAWN_BACKOFF_FLOOR,
        RESPAWN_BACKOFF_CEILING,
    );
    for respawn in 0..=MAX_WORKER_RESPAWNS {
        if respawn > 0 {
            warn!("Restarting the producer dispatch task. Attempt {respawn} of {MAX_WORKER_RESPAWNS}");
            let pause = respawn_backoff
                .next(respawn - 1)
                .unwrap_or(RESPAWN_BACKOFF_CEILING);
            time::sleep(pause).await;
        }
        match tokio::spawn(dispatch_rounds(queue.clone(), sink.clone(), policy)).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                error!("The producer dispatch task died: {e}");
                increment_counter!("producer_dispatch_task_failures");
            }
        }
    }
    Err("the dispatch task respawn budget is exhausted".to_string())
}

/// One life of the dispatch task: drive the chunked reader into the sink
/// until the queue is closed and drained, looping each round's leftovers
/// into the front of the next chunk. Once the chunk stream has ended,
/// rounds that still produce leftovers are paced by the retry backoff.
async fn dispatch_rounds<S>(
    queue: Arc<dyn MessageQueue<MessageQueueItem>>,
    sink: DispatchSink<S>,
    policy: ChunkingPolicy,
) where
    S: StreamService + 'static,
{
    let mut chunks = chunker::chunks(queue, policy);
    let mut pending: Vec<MessageQueueItem> = Vec::new();
    let mut draining = false;
    loop {
        let batch = match chunks.next().await {
            Some(mut chunk) => {
                chunk.splice(0..0, pending.drain(..));
                chunk
            }
            None => {
                if pending.is_empty() {
                    break;
                }
                if draining {
                    time::sleep(SEND_RETRY_BACKOFF).await;
                }
                draining = true;
                pending.drain(..).collect()
            }
        };
        pending = sink.dispatch(batch).await;
    }
}

/// The network-facing end of the producer pipeline. Takes a chunk of
/// items and returns the leftovers that must be offered again.
#[derive(Clone)]
struct DispatchSink<S> {
    service: S,
    stream_name: StreamName,
    batch_policy: BatchPolicy,
    max_concurrency: usize,
}

impl<S> DispatchSink<S>
where
    S: StreamService + 'static,
{
    async fn dispatch(&self, items: Vec<MessageQueueItem>) -> Vec<MessageQueueItem> {
        match self.batch_policy.endpoint {
            Endpoint::Single => self.dispatch_each(items).await,
            Endpoint::Batch => self.dispatch_batched(items).await,
        }
    }

    async fn dispatch_each(&self, items: Vec<MessageQueueItem>) -> Vec<MessageQueueItem> {
        let sink = self.clone();
        let leftovers = map_concurrently(
            self.max_concurrency,
            DISPATCH_STAGGER,
            move |item| {
                let sink = sink.clone();
                async move { sink.dispatch_one(item).await }
            },
            items,
        )
        .await;
        leftovers.into_iter().flatten().collect()
    }

    /// Send one record. An ineligible item is dropped; a failed send backs
    /// off and yields the item with one fewer attempt.
    async fn dispatch_one(&self, item: MessageQueueItem) -> Option<MessageQueueItem> {
        if !item.is_eligible() {
            trace!("Dropping a record whose attempts are exhausted");
            increment_counter!("producer_drops");
            return None;
        }
        let request = PutRecordRequest {
            stream_name: self.stream_name.clone(),
            partition_key: item.partition_key.clone(),
            data: item.payload.clone().into_bytes(),
        };
        match self.service.put_record(request).await {
            Ok(_) => {
                trace!("Produced a record");
                increment_counter!("producer_replies");
                None
            }
            Err(e) => {
                debug!("The stream service is unavailable while sending a record. Error: {e}");
                increment_counter!("producer_unavailables");
                time::sleep(SEND_RETRY_BACKOFF).await;
                Some(item.decrement())
            }
        }
    }

    async fn dispatch_batched(&self, items: Vec<MessageQueueItem>) -> Vec<MessageQueueItem> {
        let batch_size = self.batch_policy.batch_size.max(1);
        let mut items = items;
        let mut batches = Vec::with_capacity((items.len() + batch_size - 1) / batch_size);
        while !items.is_empty() {
            let rest = items.split_off(batch_size.min(items.len()));
            batches.push(items);
            items = rest;
        }
        let sink = self.clone();
        let leftovers = map_concurrently(
            self.max_concurrency,
            DISPATCH_STAGGER,
            move |batch| {
                let sink = sink.clone();
                async move { sink.dispatch_batch(batch).await }
            },
            batches,
        )
        .await;
        leftovers.into_iter().flatten().collect()
    }

    /// Send one batch. When the call itself fails, every eligible item is
    /// yielded back untouched; the decrement happens only for per-record
    /// errors reported by an otherwise successful call.
    async fn dispatch_batch(&self, batch: Vec<MessageQueueItem>) -> Vec<MessageQueueItem> {
        let eligible: Vec<MessageQueueItem> =
            batch.into_iter().filter(MessageQueueItem::is_eligible).collect();
        if eligible.is_empty() {
            return Vec::new();
        }
        let request = PutRecordsRequest {
            stream_name: self.stream_name.clone(),
            records: eligible
                .iter()
                .map(|item| PutRecordsRequestEntry {
                    partition_key: item.partition_key.clone(),
                    data: item.payload.clone().into_bytes(),
                })
                .collect(),
        };
        match self.service.put_records(request).await {
            Err(e) => {
                debug!("The stream service is unavailable while sending a batch. Error: {e}");
                increment_counter!("producer_unavailables");
                eligible
            }
            Ok(response) => {
                increment_counter!("producer_replies");
                let leftovers: Vec<MessageQueueItem> = eligible
                    .into_iter()
                    .zip(response.records)
                    .filter(|(_, entry)| {
                        entry
                            .error_code
                            .as_deref()
                            .map_or(false, |code| !code.is_empty())
                    })
                    .map(|(item, _)| item.decrement())
                    .filter(MessageQueueItem::is_eligible)
                    .collect();
                if !leftovers.is_empty() {
                    debug!(
                        "{} records of a batch were rejected and will be retried",
                        leftovers.len()
                    );
                    increment_counter!("producer_record_errors");
                }
                leftovers
            }
        }
    }
}
