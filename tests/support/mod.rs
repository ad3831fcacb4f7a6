// An in-process stream service for tests: it records every request it is
// asked to perform and replays scripted replies, falling back to benign
// defaults once the script for an operation has run dry. Not every test
// binary exercises every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use shardflow::stream_service::*;

/// A request the service has seen, in arrival order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SeenRequest {
    PutRecord(PutRecordRequest),
    PutRecords(PutRecordsRequest),
    GetShardIterator(GetShardIteratorRequest),
    GetRecords(GetRecordsRequest),
    ListShards(String),
}

#[derive(Clone, Default)]
pub struct ScriptedService {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    seen: Mutex<Vec<SeenRequest>>,
    put_record_replies: Mutex<VecDeque<Result<PutRecordResponse, ServiceError>>>,
    put_records_replies: Mutex<VecDeque<Result<PutRecordsResponse, ServiceError>>>,
    get_shard_iterator_replies: Mutex<VecDeque<Result<GetShardIteratorResponse, ServiceError>>>,
    get_records_replies: Mutex<VecDeque<Result<GetRecordsResponse, ServiceError>>>,
    list_shards_replies: Mutex<VecDeque<Result<Vec<Shard>, ServiceError>>>,
    hang_sends: AtomicBool,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_put_record(&self, reply: Result<PutRecordResponse, ServiceError>) {
        self.inner.put_record_replies.lock().unwrap().push_back(reply);
    }

    pub fn script_put_records(&self, reply: Result<PutRecordsResponse, ServiceError>) {
        self.inner.put_records_replies.lock().unwrap().push_back(reply);
    }

    pub fn script_get_shard_iterator(&self, reply: Result<GetShardIteratorResponse, ServiceError>) {
        self.inner
            .get_shard_iterator_replies
            .lock()
            .unwrap()
            .push_back(reply);
    }

    pub fn script_get_records(&self, reply: Result<GetRecordsResponse, ServiceError>) {
        self.inner.get_records_replies.lock().unwrap().push_back(reply);
    }

    pub fn script_list_shards(&self, reply: Result<Vec<Shard>, ServiceError>) {
        self.inner.list_shards_replies.lock().unwrap().push_back(reply);
    }

    /// Make every subsequent append hang forever, as a dead transport would.
    pub fn hang_sends(&self) {
        self.inner.hang_sends.store(true, Ordering::SeqCst);
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.inner.seen.lock().unwrap().clone()
    }

    pub fn seen_put_records(&self) -> Vec<PutRecordsRequest> {
        self.seen()
            .into_iter()
            .filter_map(|request| match request {
                SeenRequest::PutRecords(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn seen_put_record(&self) -> Vec<PutRecordRequest> {
        self.seen()
            .into_iter()
            .filter_map(|request| match request {
                SeenRequest::PutRecord(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn seen_get_shard_iterators(&self) -> Vec<GetShardIteratorRequest> {
        self.seen()
            .into_iter()
            .filter_map(|request| match request {
                SeenRequest::GetShardIterator(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn seen_get_records(&self) -> Vec<GetRecordsRequest> {
        self.seen()
            .into_iter()
            .filter_map(|request| match request {
                SeenRequest::GetRecords(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn push_seen(&self, request: SeenRequest) {
        self.inner.seen.lock().unwrap().push(request);
    }

    fn pop<T>(&self, replies: &Mutex<VecDeque<T>>) -> Option<T> {
        replies.lock().unwrap().pop_front()
    }

    async fn maybe_hang(&self) {
        if self.inner.hang_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl StreamService for ScriptedService {
    async fn put_record(
        &self,
        request: PutRecordRequest,
    ) -> Result<PutRecordResponse, ServiceError> {
        self.push_seen(SeenRequest::PutRecord(request));
        self.maybe_hang().await;
        self.pop(&self.inner.put_record_replies).unwrap_or_else(|| {
            Ok(PutRecordResponse {
                shard_id: "shardId-000000000000".to_string(),
                sequence_number: "0".to_string(),
            })
        })
    }

    async fn put_records(
        &self,
        request: PutRecordsRequest,
    ) -> Result<PutRecordsResponse, ServiceError> {
        let record_count = request.records.len();
        self.push_seen(SeenRequest::PutRecords(request));
        self.maybe_hang().await;
        self.pop(&self.inner.put_records_replies).unwrap_or_else(|| {
            Ok(PutRecordsResponse {
                records: (0..record_count).map(|i| ok_entry(&i.to_string())).collect(),
                failed_record_count: Some(0),
            })
        })
    }

    async fn get_shard_iterator(
        &self,
        request: GetShardIteratorRequest,
    ) -> Result<GetShardIteratorResponse, ServiceError> {
        let shard_id = request.shard_id.clone();
        self.push_seen(SeenRequest::GetShardIterator(request));
        self.pop(&self.inner.get_shard_iterator_replies)
            .unwrap_or_else(|| {
                Ok(GetShardIteratorResponse {
                    shard_iterator: format!("{shard_id}/iterator-0"),
                })
            })
    }

    async fn get_records(
        &self,
        request: GetRecordsRequest,
    ) -> Result<GetRecordsResponse, ServiceError> {
        let shard_iterator = request.shard_iterator.clone();
        self.push_seen(SeenRequest::GetRecords(request));
        self.pop(&self.inner.get_records_replies).unwrap_or_else(|| {
            Ok(GetRecordsResponse {
                records: vec![],
                next_shard_iterator: Some(shard_iterator),
                millis_behind_latest: Some(0),
            })
        })
    }

    async fn list_open_shards(&self, stream_name: &str) -> Result<Vec<Shard>, ServiceError> {
        self.push_seen(SeenRequest::ListShards(stream_name.to_string()));
        self.pop(&self.inner.list_shards_replies)
            .unwrap_or_else(|| Ok(vec![]))
    }
}

pub fn shard(shard_id: &str) -> Shard {
    Shard {
        shard_id: shard_id.to_string(),
    }
}

pub fn record(sequence_number: &str) -> Record {
    Record {
        data: b"some-value".to_vec(),
        partition_key: "abcdefghijklmnopqrstuvwxy".to_string(),
        sequence_number: sequence_number.to_string(),
        approximate_arrival_timestamp: None,
    }
}

pub fn ok_entry(sequence_number: &str) -> PutRecordsResultEntry {
    PutRecordsResultEntry {
        error_code: None,
        error_message: None,
        sequence_number: Some(sequence_number.to_string()),
        shard_id: Some("shardId-000000000000".to_string()),
    }
}

pub fn err_entry() -> PutRecordsResultEntry {
    PutRecordsResultEntry {
        error_code: Some("ProvisionedThroughputExceededException".to_string()),
        error_message: Some("Rate exceeded for the shard".to_string()),
        sequence_number: None,
        shard_id: None,
    }
}
