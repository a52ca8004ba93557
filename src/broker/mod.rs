//! Boundary between the processing engine and a Kafka-style broker client.
//!
//! # Broker Module
//!
//! The engine never speaks a wire protocol itself. Everything it needs from a
//! cluster is expressed by [`BrokerClient`]:
//!
//! - a stream of raw records per topic-partition, starting at a position,
//! - an asynchronous producer: a bounded channel of records to send and an
//!   unbounded channel reporting one [`Completion`] per submitted record,
//! - a consumer group offset store (read and write the next offset to consume),
//! - earliest and newest offset queries for a topic-partition.
//!
//! Each partition processor asks a [`BrokerConnector`] for its own client, so
//! partitions never share producer or consumer resources.
//!
//! Completions may arrive in any order relative to submission. Every
//! completion carries the [`Correlation`] the engine attached to the record,
//! which is how it finds the in-flight group the record belongs to.

use std::{fmt, pin::Pin, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc::{Sender, UnboundedReceiver};

use crate::{
    config::RequiredAcks,
    error::{Error, Result},
    types::{Offset, Partition, Topic},
};

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

/// Record as read from a topic-partition, before decoding.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumedRecord {
    pub topic: Topic,
    pub partition: Partition,
    pub offset: Offset,
    pub key: Bytes,
    pub value: Bytes,
    pub timestamp: i64,
}

/// Ties a produced record back to the incoming message that caused it.
///
/// `topic` is the *input* topic of the originating message, `sequence` the
/// per-partition number of its in-flight group and `slot` the position of the
/// record among the group's sends.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Correlation {
    pub topic: Topic,
    pub sequence: u64,
    pub slot: usize,
}

/// Encoded record handed to the producer.
#[derive(Clone, Debug, PartialEq)]
pub struct ProducerRecord {
    pub topic: Topic,
    pub partition: Partition,
    pub key: Bytes,
    pub value: Bytes,
    pub correlation: Correlation,
}

/// Outcome of one submitted record.
#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    pub record: ProducerRecord,
    /// The offset the record was written at, or why it was not written.
    pub result: std::result::Result<Offset, Error>,
}

impl Completion {
    pub fn success(record: ProducerRecord, offset: Offset) -> Self {
        Self {
            record,
            result: Ok(offset),
        }
    }

    pub fn failure(record: ProducerRecord, error: Error) -> Self {
        Self {
            record,
            result: Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Where a consumer stream starts reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOffset {
    At(Offset),
    /// Only records produced after the stream is opened.
    Newest,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProducerConfig {
    pub client_id: String,
    pub required_acks: RequiredAcks,
    /// Capacity of the producer input channel.
    pub buffer_size: usize,
}

/// The two halves of an asynchronous producer.
///
/// Dropping `sender` tells the producer no more records are coming; the
/// completion channel closes once every submitted record has completed.
pub struct ProducerChannels {
    pub sender: Sender<ProducerRecord>,
    pub completions: UnboundedReceiver<Completion>,
}

impl fmt::Debug for ProducerChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerChannels")
            .field("capacity", &self.sender.capacity())
            .finish()
    }
}

pub type RecordStream = Pin<Box<dyn Stream<Item = Result<ConsumedRecord>> + Send>>;

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Stream the records of a topic-partition starting at `start`.
    async fn consume_partition(
        &self,
        topic: &str,
        partition: Partition,
        start: StartOffset,
    ) -> Result<RecordStream>;

    async fn producer(&self, config: &ProducerConfig) -> Result<ProducerChannels>;

    /// The next offset the group should consume, if it ever committed one.
    async fn fetch_offset(
        &self,
        group_id: &str,
        topic: &str,
        partition: Partition,
    ) -> Result<Option<Offset>>;

    /// Store `next_offset` as the next offset the group should consume.
    async fn commit_offset(
        &self,
        group_id: &str,
        topic: &str,
        partition: Partition,
        next_offset: Offset,
    ) -> Result<()>;

    /// Offset of the oldest record still retained.
    async fn earliest_offset(&self, topic: &str, partition: Partition) -> Result<Offset>;

    /// Offset the next produced record will get.
    async fn newest_offset(&self, topic: &str, partition: Partition) -> Result<Offset>;

    /// Release whatever this client holds on the broker side.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, broker_list: &[String], client_id: &str)
        -> Result<Arc<dyn BrokerClient>>;
}
