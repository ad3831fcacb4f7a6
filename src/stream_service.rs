//! Value types and the transport seam for a shard-partitioned log stream
//! service, modelled on the Amazon Kinesis wire API. The operations the
//! coordination core needs are expressed by the [StreamService] trait;
//! request signing, HTTP transport and credential loading belong to
//! implementations of that trait.

use std::error::Error;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as, TimestampSecondsWithFrac};

/// The name of a stream as registered with the stream service.
pub type StreamName = String;

/// An identifier of a shard. Shards are independently ordered partitions
/// of a stream.
pub type ShardId = String;

/// An opaque token ordering a record within its shard. Tokens for the
/// same shard compare in arrival order, but the core never inspects them.
pub type SequenceNumber = String;

/// An opaque, short-lived token addressing a position in a shard. Every
/// records fetch returns the token to use for the following fetch.
pub type ShardIterator = String;

/// A client-chosen string that the service hashes to select the shard a
/// record lands on.
pub type PartitionKey = String;

/// A request to append a single record to a stream.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutRecordRequest {
    pub stream_name: StreamName,
    pub partition_key: PartitionKey,
    #[serde_as(as = "Base64")]
    pub data: Vec<u8>,
}

/// The reply to appending a single record. The placement fields are
/// informational only.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutRecordResponse {
    pub shard_id: ShardId,
    pub sequence_number: SequenceNumber,
}

/// One record of a batched append.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutRecordsRequestEntry {
    pub partition_key: PartitionKey,
    #[serde_as(as = "Base64")]
    pub data: Vec<u8>,
}

/// A request to append a batch of records to a stream.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutRecordsRequest {
    pub stream_name: StreamName,
    pub records: Vec<PutRecordsRequestEntry>,
}

/// The outcome of one record within a batched append. A present, non-empty
/// error code means the record was rejected and may be retried.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutRecordsResultEntry {
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub sequence_number: Option<SequenceNumber>,
    #[serde(default)]
    pub shard_id: Option<ShardId>,
}

/// The reply to a batched append. Entries appear in the same order as the
/// records of the request.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutRecordsResponse {
    pub records: Vec<PutRecordsResultEntry>,
    #[serde(default)]
    pub failed_record_count: Option<u32>,
}

/// Where in a shard an iterator should start.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardIteratorType {
    /// The oldest record still retained by the shard.
    TrimHorizon,
    /// Just after the most recent record, so only new arrivals are seen.
    Latest,
    /// Exactly at the given sequence number.
    AtSequenceNumber,
    /// Just after the given sequence number.
    AfterSequenceNumber,
}

/// A request for an iterator addressing a position within a shard.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetShardIteratorRequest {
    pub stream_name: StreamName,
    pub shard_id: ShardId,
    pub shard_iterator_type: ShardIteratorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_sequence_number: Option<SequenceNumber>,
}

/// The reply to a shard iterator request.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetShardIteratorResponse {
    pub shard_iterator: ShardIterator,
}

/// A request for the next batch of records at a shard position.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetRecordsRequest {
    pub shard_iterator: ShardIterator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// A record as delivered by a records fetch.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Record {
    #[serde_as(as = "Base64")]
    pub data: Vec<u8>,
    pub partition_key: PartitionKey,
    pub sequence_number: SequenceNumber,
    #[serde_as(as = "Option<TimestampSecondsWithFrac>")]
    #[serde(default)]
    pub approximate_arrival_timestamp: Option<DateTime<Utc>>,
}

/// The reply to a records fetch. An absent next iterator means the shard
/// has been closed and fully read.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetRecordsResponse {
    pub records: Vec<Record>,
    #[serde(default)]
    pub next_shard_iterator: Option<ShardIterator>,
    #[serde(default)]
    pub millis_behind_latest: Option<u64>,
}

/// A shard as reported by a shard listing.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Shard {
    pub shard_id: ShardId,
}

/// The stream service could not process a request. The code, when present,
/// is the service's machine-readable error class e.g.
/// "ProvisionedThroughputExceededException".
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceError {
    pub code: Option<String>,
    pub message: String,
}

impl ServiceError {
    /// An error with no service-assigned class, as raised when the service
    /// cannot be reached at all.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl Error for ServiceError {}

/// The operations the coordination core requires of a stream service
/// transport. Any error an implementation returns is treated as a failed
/// attempt by the core's retry bookkeeping.
#[async_trait]
pub trait StreamService: Clone + Send + Sync {
    /// Append one record to the stream.
    async fn put_record(
        &self,
        request: PutRecordRequest,
    ) -> Result<PutRecordResponse, ServiceError>;

    /// Append a batch of records. The reply carries one entry per request
    /// record, in request order; entries bearing an error code identify
    /// the records that were not accepted.
    async fn put_records(
        &self,
        request: PutRecordsRequest,
    ) -> Result<PutRecordsResponse, ServiceError>;

    /// Obtain an iterator addressing a position within a shard.
    async fn get_shard_iterator(
        &self,
        request: GetShardIteratorRequest,
    ) -> Result<GetShardIteratorResponse, ServiceError>;

    /// Fetch the next batch of records at a shard position.
    async fn get_records(
        &self,
        request: GetRecordsRequest,
    ) -> Result<GetRecordsResponse, ServiceError>;

    /// List the currently open shards of a stream.
    async fn list_open_shards(&self, stream_name: &str) -> Result<Vec<Shard>, ServiceError>;
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_iterator_type_wire_casing() {
        assert_eq!(
            serde_json::to_string(&ShardIteratorType::AfterSequenceNumber).unwrap(),
            r#""AFTER_SEQUENCE_NUMBER""#
        );
        assert_eq!(
            serde_json::from_str::<ShardIteratorType>(r#""TRIM_HORIZON""#).unwrap(),
            ShardIteratorType::TrimHorizon
        );
    }

    #[test]
    fn test_record_decodes_base64_and_timestamp() {
        let json = r#"
        {
            "Data": "aGkgdGhlcmU=",
            "PartitionKey": "abcdefghijklmnopqrstuvwxy",
            "SequenceNumber": "49590338271490256608559692538361571095921575989136588898",
            "ApproximateArrivalTimestamp": 1.5
        }
        "#;
        assert_eq!(
            serde_json::from_str::<Record>(json).unwrap(),
            Record {
                data: b"hi there".to_vec(),
                partition_key: "abcdefghijklmnopqrstuvwxy".to_string(),
                sequence_number: "49590338271490256608559692538361571095921575989136588898"
                    .to_string(),
                approximate_arrival_timestamp: Some(
                    Utc.timestamp_opt(1, 500_000_000).unwrap()
                ),
            }
        );
    }

    #[test]
    fn test_iterator_request_omits_absent_sequence_number() {
        let request = GetShardIteratorRequest {
            stream_name: "my-stream".to_string(),
            shard_id: "shardId-000000000000".to_string(),
            shard_iterator_type: ShardIteratorType::TrimHorizon,
            starting_sequence_number: None,
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"StreamName":"my-stream","ShardId":"shardId-000000000000","ShardIteratorType":"TRIM_HORIZON"}"#
        );
    }
}
