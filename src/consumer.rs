//! The consuming half of the client: a background resharding loop keeps a
//! carousel of shard cursors current while a pull loop fetches records
//! from the shard under the cursor, one back-pressured batch at a time.
//! Callers read records off a bounded buffer and can snapshot per-shard
//! progress for resumption after a restart.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::stream;
use log::{debug, trace};
use metrics::increment_counter;
use tokio::time;
use tokio_stream::Stream;

use crate::carousel::Carousel;
use crate::queue::{BoundedQueue, MessageQueue, WriteOutcome};
use crate::stream_service::{
    GetRecordsRequest, GetShardIteratorRequest, Record, SequenceNumber, ServiceError, ShardId,
    ShardIterator, ShardIteratorType, StreamName, StreamService,
};

// The reshard and pull cadences are calibrated to stay clear of the
// stream service's rate limits while keeping retrieval prompt.
const RESHARD_SUCCESS_INTERVAL: Duration = Duration::from_secs(10);
const RESHARD_FAILURE_INTERVAL: Duration = Duration::from_secs(3);
const PULL_ACTIVE_INTERVAL: Duration = Duration::from_millis(70);
const PULL_IDLE_INTERVAL: Duration = Duration::from_secs(5);
const PULL_FAILURE_INTERVAL: Duration = Duration::from_secs(2);
const REPLENISH_POLL: Duration = Duration::from_millis(10);
const READ_IDLE_POLL: Duration = Duration::from_secs(5);

/// The last sequence number read from each shard, keyed by shard id.
/// Serialisable, so callers can persist it and resume a later consumer
/// just after the records they have already seen.
pub type SavedStreamState = HashMap<ShardId, SequenceNumber>;

/// A shard the consumer is following: its identity plus two cells that
/// change as the stream is read. States compare equal by shard id alone,
/// which is what lets the carousel deduplicate rediscovered shards.
#[derive(Debug)]
pub struct ShardState {
    shard_id: ShardId,
    iterator: Mutex<Option<ShardIterator>>,
    last_sequence_number: Mutex<Option<SequenceNumber>>,
}

impl ShardState {
    pub fn new(shard_id: ShardId, iterator: Option<ShardIterator>) -> Self {
        Self {
            shard_id,
            iterator: Mutex::new(iterator),
            last_sequence_number: Mutex::new(None),
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// The current fetch position, if the shard still has one. A shard
    /// whose iterator has been consumed to the end of a closed shard no
    /// longer yields records.
    pub fn iterator(&self) -> Option<ShardIterator> {
        let Ok(iterator) = self.iterator.lock() else {
            return None;
        };
        iterator.clone()
    }

    fn replace_iterator(&self, next: Option<ShardIterator>) {
        if let Ok(mut iterator) = self.iterator.lock() {
            *iterator = next;
        }
    }

    /// The sequence number of the last record a caller has read from this
    /// shard.
    pub fn last_sequence_number(&self) -> Option<SequenceNumber> {
        let Ok(last) = self.last_sequence_number.lock() else {
            return None;
        };
        last.clone()
    }

    fn record_read(&self, sequence_number: &str) {
        if let Ok(mut last) = self.last_sequence_number.lock() {
            *last = Some(sequence_number.to_string());
        }
    }
}

impl PartialEq for ShardState {
    fn eq(&self, other: &Self) -> bool {
        self.shard_id == other.shard_id
    }
}

impl Eq for ShardState {}

/// Everything needed to run a consumer. Immutable once handed to
/// [with_consumer].
pub struct ConsumerKit<S> {
    pub service: S,
    pub stream_name: StreamName,
    /// The records fetch limit, and also the capacity of the read buffer.
    pub batch_size: u32,
    /// Where to start on shards that the saved state knows nothing about.
    pub iterator_type: ShardIteratorType,
    pub saved_state: SavedStreamState,
}

impl<S> ConsumerKit<S> {
    pub fn new(service: S, stream_name: impl Into<StreamName>) -> Self {
        Self {
            service,
            stream_name: stream_name.into(),
            batch_size: 200,
            iterator_type: ShardIteratorType::TrimHorizon,
            saved_state: SavedStreamState::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_iterator_type(mut self, iterator_type: ShardIteratorType) -> Self {
        self.iterator_type = iterator_type;
        self
    }

    pub fn with_saved_state(mut self, saved_state: SavedStreamState) -> Self {
        self.saved_state = saved_state;
        self
    }
}

/// Reconcile the carousel with the stream's open shards. Shards not yet
/// followed get an iterator: after the saved sequence number when the
/// saved state has one for them, at the kit's configured position
/// otherwise. Returns how many new shards were adopted. Shards already in
/// the carousel keep their position and cursor untouched.
pub async fn update_stream_state<S>(
    kit: &ConsumerKit<S>,
    carousel: &Mutex<Carousel<Arc<ShardState>>>,
) -> Result<usize, ServiceError>
where
    S: StreamService,
{
    let shards = kit.service.list_open_shards(&kit.stream_name).await?;
    let known: Vec<ShardId> = {
        let Ok(locked) = carousel.lock() else {
            return Ok(0);
        };
        locked
            .list()
            .iter()
            .map(|state| state.shard_id().to_string())
            .collect()
    };

    let mut discovered = Vec::new();
    for shard in shards {
        if known.iter().any(|id| *id == shard.shard_id) {
            continue;
        }
        let saved = kit.saved_state.get(&shard.shard_id);
        let request = GetShardIteratorRequest {
            stream_name: kit.stream_name.clone(),
            shard_id: shard.shard_id.clone(),
            shard_iterator_type: if saved.is_some() {
                ShardIteratorType::AfterSequenceNumber
            } else {
                kit.iterator_type
            },
            starting_sequence_number: saved.cloned(),
        };
        let response = kit.service.get_shard_iterator(request).await?;
        trace!("Following a new shard: {}", shard.shard_id);
        discovered.push(Arc::new(ShardState::new(
            shard.shard_id,
            Some(response.shard_iterator),
        )));
    }

    let adopted = discovered.len();
    if adopted > 0 {
        let Ok(mut locked) = carousel.lock() else {
            return Ok(0);
        };
        locked.append(discovered);
        locked.nub();
    }
    Ok(adopted)
}

/// Fetch the next batch from the shard under the carousel cursor and
/// buffer it for readers. Waits first for the buffer to drain — the
/// consumer's back-pressure point — and then for a shard with an iterator
/// to be available. The iterator replacement, the buffering of records and
/// the cursor advance happen under one lock of the carousel; the fetch
/// itself does not. Returns the number of records fetched.
pub async fn replenish_messages<S>(
    kit: &ConsumerKit<S>,
    carousel: &Mutex<Carousel<Arc<ShardState>>>,
    buffer: &BoundedQueue<(Arc<ShardState>, Record)>,
) -> Result<usize, ServiceError>
where
    S: StreamService,
{
    while !buffer.is_empty() {
        time::sleep(REPLENISH_POLL).await;
    }

    let (shard, iterator) = loop {
        let current = match carousel.lock() {
            Ok(locked) => locked.cursor().cloned(),
            Err(_) => None,
        };
        if let Some(shard) = current {
            if let Some(iterator) = shard.iterator() {
                break (shard, iterator);
            }
        }
        time::sleep(REPLENISH_POLL).await;
    };

    let response = kit
        .service
        .get_records(GetRecordsRequest {
            shard_iterator: iterator,
            limit: Some(kit.batch_size),
        })
        .await?;

    let Ok(mut locked) = carousel.lock() else {
        return Ok(0);
    };
    shard.replace_iterator(response.next_shard_iterator);
    let fetched = response.records.len();
    for record in response.records {
        if !matches!(
            buffer.try_write((shard.clone(), record)),
            WriteOutcome::Written
        ) {
            debug!("Discarding a fetched record: the read buffer is unexpectedly full");
        }
    }
    locked.move_right();
    drop(locked);

    if fetched > 0 {
        trace!("Fetched {fetched} records from shard {}", shard.shard_id());
    }
    Ok(fetched)
}

/// The handle callers read records through. Cheap to clone; reads may come
/// from any number of tasks.
#[derive(Clone)]
pub struct StreamConsumer {
    carousel: Arc<Mutex<Carousel<Arc<ShardState>>>>,
    buffer: Arc<BoundedQueue<(Arc<ShardState>, Record)>>,
}

impl StreamConsumer {
    /// Take the next record, waiting for one to arrive. The shard's last
    /// read sequence number is updated before the record is handed over.
    pub async fn read(&self) -> Record {
        loop {
            if let Some((shard, record)) = self.buffer.take_batch(1, READ_IDLE_POLL).await.pop() {
                shard.record_read(&record.sequence_number);
                return record;
            }
            if self.buffer.is_closed_and_empty() {
                time::sleep(READ_IDLE_POLL).await;
            }
        }
    }

    /// Take the next record if one is already buffered.
    pub fn try_read(&self) -> Option<Record> {
        let (shard, record) = self.buffer.try_take()?;
        shard.record_read(&record.sequence_number);
        Some(record)
    }

    /// An endless stream of records, produced by repeated reads. Records
    /// are not replayable; a second stream simply continues where reads so
    /// far have left off.
    pub fn source(&self) -> Pin<Box<dyn Stream<Item = Record> + Send + '_>> {
        Box::pin(stream!({
            loop {
                yield self.read().await;
            }
        }))
    }

    /// The last sequence number read from every shard that has delivered
    /// at least one record, suitable for persisting and resuming from.
    pub fn stream_state(&self) -> SavedStreamState {
        let Ok(locked) = self.carousel.lock() else {
            return SavedStreamState::new();
        };
        locked
            .list()
            .iter()
            .filter_map(|shard| {
                shard
                    .last_sequence_number()
                    .map(|sequence_number| (shard.shard_id().to_string(), sequence_number))
            })
            .collect()
    }
}

/// Run `inner` with a consumer whose resharding and pull loops run in the
/// background. Both loops swallow service errors and retry on their own
/// cadence; they are cancelled, along with any in-flight fetch, when
/// `inner` returns.
pub async fn with_consumer<S, F, Fut, A>(kit: ConsumerKit<S>, inner: F) -> A
where
    S: StreamService + 'static,
    F: FnOnce(StreamConsumer) -> Fut,
    Fut: Future<Output = A>,
{
    let carousel = Arc::new(Mutex::new(Carousel::new()));
    let buffer = Arc::new(BoundedQueue::new(kit.batch_size as usize));
    let kit = Arc::new(kit);

    let reshard_kit = kit.clone();
    let reshard_carousel = carousel.clone();
    let resharder = tokio::spawn(async move {
        loop {
            match update_stream_state(&reshard_kit, &reshard_carousel).await {
                Ok(adopted) => {
                    if adopted > 0 {
                        debug!("Adopted {adopted} newly discovered shards");
                    }
                    increment_counter!("consumer_reshard_rounds");
                    time::sleep(RESHARD_SUCCESS_INTERVAL).await;
                }
                Err(e) => {
                    debug!("The stream service is unavailable while resharding. Error: {e}");
                    increment_counter!("consumer_reshard_failures");
                    time::sleep(RESHARD_FAILURE_INTERVAL).await;
                }
            }
        }
    });

    let pull_kit = kit.clone();
    let pull_carousel = carousel.clone();
    let pull_buffer = buffer.clone();
    let puller = tokio::spawn(async move {
        loop {
            match replenish_messages(&pull_kit, &pull_carousel, &pull_buffer).await {
                Ok(0) => time::sleep(PULL_IDLE_INTERVAL).await,
                Ok(_) => {
                    increment_counter!("consumer_replenishments");
                    time::sleep(PULL_ACTIVE_INTERVAL).await;
                }
                Err(e) => {
                    debug!("The stream service is unavailable while fetching records. Error: {e}");
                    increment_counter!("consumer_pull_failures");
                    time::sleep(PULL_FAILURE_INTERVAL).await;
                }
            }
        }
    });

    let consumer = StreamConsumer { carousel, buffer };
    let result = inner(consumer).await;

    resharder.abort();
    puller.abort();
    result
}
