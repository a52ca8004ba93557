//! In-process broker.
//!
//! Keeps partitioned append-only logs and consumer group offsets in memory and
//! implements [`BrokerClient`] on top of them. Consumer streams wait for
//! appends, the producer runs as a background task that writes each record
//! and reports a [`Completion`], like a networked client would.
//!
//! Useful for tests, demos and for running a topology inside one process.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tracing::instrument;

use super::{
    BrokerClient, BrokerConnector, Completion, ConsumedRecord, ProducerChannels, ProducerConfig,
    ProducerRecord, RecordStream, StartOffset,
};
use crate::{
    error::{Error, Result},
    types::{Offset, Partition, Topic},
};

/// Record as stored in a partition log.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredRecord {
    pub offset: Offset,
    pub key: Bytes,
    pub value: Bytes,
    pub timestamp: i64,
}

#[derive(Debug, Default)]
struct PartitionLog {
    /// Offset of `records[0]`. Moves forward when old records are truncated.
    start_offset: Offset,
    records: Vec<StoredRecord>,
}

impl PartitionLog {
    fn end_offset(&self) -> Offset {
        self.start_offset + self.records.len() as Offset
    }

    fn append(&mut self, key: Bytes, value: Bytes) -> Offset {
        let offset = self.end_offset();
        self.records.push(StoredRecord {
            offset,
            key,
            value,
            timestamp: now(),
        });
        offset
    }

    fn truncate_before(&mut self, offset: Offset) {
        let offset = offset.min(self.end_offset());
        if offset <= self.start_offset {
            return;
        }
        let removed = (offset - self.start_offset) as usize;
        self.records.drain(..removed);
        self.start_offset = offset;
    }
}

#[derive(Debug, Default)]
struct State {
    logs: HashMap<(Topic, Partition), PartitionLog>,
    group_offsets: HashMap<(String, Topic, Partition), Offset>,
    failing_topics: HashSet<Topic>,
    connections: usize,
    closed_clients: usize,
}

impl State {
    fn log(&self, topic: &str, partition: Partition) -> Result<&PartitionLog> {
        self.logs
            .get(&(topic.to_owned(), partition))
            .ok_or_else(|| Error::UnknownTopicOrPartition(topic.to_owned(), partition))
    }

    fn log_mut(&mut self, topic: &str, partition: Partition) -> Result<&mut PartitionLog> {
        self.logs
            .get_mut(&(topic.to_owned(), partition))
            .ok_or_else(|| Error::UnknownTopicOrPartition(topic.to_owned(), partition))
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    appended: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, topic: &str, partition: Partition, key: Bytes, value: Bytes) -> Result<Offset> {
        let offset = {
            let mut state = self.state();
            if state.failing_topics.contains(topic) {
                return Err(Error::SendFailed {
                    topic: topic.to_owned(),
                    partition,
                    reason: "topic is rejecting writes".to_string(),
                });
            }
            state.log_mut(topic, partition)?.append(key, value)
        };
        self.appended.notify_waiters();
        Ok(offset)
    }

    fn read_from(&self, topic: &str, partition: Partition, offset: Offset) -> Result<Vec<StoredRecord>> {
        let state = self.state();
        let log = state.log(topic, partition)?;
        if offset < log.start_offset {
            return Err(Error::OffsetOutOfRange {
                topic: topic.to_owned(),
                partition,
                offset,
            });
        }
        let skip = (offset - log.start_offset) as usize;
        Ok(log.records.iter().skip(skip).cloned().collect())
    }
}

/// Shared handle to an in-memory cluster. Clones see the same logs.
///
/// ### Example
/// ```rust
/// use kasper::prelude::InMemoryBroker;
///
/// let broker = InMemoryBroker::new();
/// broker.create_topic("hello", 2);
/// let offset = broker.produce("hello", 1, "key", "value").unwrap();
/// assert_eq!(offset, 0);
/// assert_eq!(broker.records("hello", 1).len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic with partitions `0..partitions`. Existing partitions are
    /// left untouched.
    pub fn create_topic(&self, topic: &str, partitions: Partition) {
        let mut state = self.shared.state();
        for partition in 0..partitions {
            state
                .logs
                .entry((topic.to_owned(), partition))
                .or_default();
        }
        tracing::debug!("Created topic {} with {} partitions", topic, partitions);
    }

    /// Append a record directly, bypassing any producer.
    pub fn produce(
        &self,
        topic: &str,
        partition: Partition,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<Offset> {
        self.shared.append(topic, partition, key.into(), value.into())
    }

    /// Everything currently retained in a topic-partition.
    pub fn records(&self, topic: &str, partition: Partition) -> Vec<StoredRecord> {
        self.shared
            .state()
            .log(topic, partition)
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Drop every record below `offset`, as retention would.
    pub fn truncate_before(&self, topic: &str, partition: Partition, offset: Offset) -> Result<()> {
        self.shared
            .state()
            .log_mut(topic, partition)?
            .truncate_before(offset);
        Ok(())
    }

    /// The next offset `group_id` would resume from, if any was committed.
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: Partition) -> Option<Offset> {
        self.shared
            .state()
            .group_offsets
            .get(&(group_id.to_owned(), topic.to_owned(), partition))
            .copied()
    }

    /// Make every subsequent write to `topic` fail.
    pub fn reject_writes_to(&self, topic: &str) {
        self.shared.state().failing_topics.insert(topic.to_owned());
    }

    pub fn accept_writes_to(&self, topic: &str) {
        self.shared.state().failing_topics.remove(topic);
    }

    /// Number of clients handed out by [`BrokerConnector::connect`].
    pub fn connections(&self) -> usize {
        self.shared.state().connections
    }

    /// Number of [`BrokerClient::close`] calls received.
    pub fn closed_clients(&self) -> usize {
        self.shared.state().closed_clients
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    #[instrument(level = "debug", skip(self))]
    async fn consume_partition(
        &self,
        topic: &str,
        partition: Partition,
        start: StartOffset,
    ) -> Result<RecordStream> {
        let position = {
            let state = self.shared.state();
            let log = state.log(topic, partition)?;
            match start {
                StartOffset::Newest => log.end_offset(),
                StartOffset::At(offset) if offset < log.start_offset || offset > log.end_offset() => {
                    return Err(Error::OffsetOutOfRange {
                        topic: topic.to_owned(),
                        partition,
                        offset,
                    });
                }
                StartOffset::At(offset) => offset,
            }
        };
        tracing::debug!(
            "Consuming topic {} partition {} from offset {}",
            topic,
            partition,
            position
        );

        let shared = Arc::clone(&self.shared);
        let topic = topic.to_owned();
        Ok(Box::pin(async_stream::stream! {
            let mut position = position;
            loop {
                // register interest before reading so an append in between is not missed
                let appended = shared.appended.notified();
                match shared.read_from(&topic, partition, position) {
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                    Ok(batch) if batch.is_empty() => appended.await,
                    Ok(batch) => {
                        for record in batch {
                            position = record.offset + 1;
                            yield Ok(ConsumedRecord {
                                topic: topic.clone(),
                                partition,
                                offset: record.offset,
                                key: record.key,
                                value: record.value,
                                timestamp: record.timestamp,
                            });
                        }
                    }
                }
            }
        }))
    }

    #[instrument(level = "debug", skip(self))]
    async fn producer(&self, config: &ProducerConfig) -> Result<ProducerChannels> {
        let (sender, mut receiver) = mpsc::channel::<ProducerRecord>(config.buffer_size.max(1));
        // unbounded because the producer must never wait on the engine
        let (completion_sender, completions) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        let client_id = config.client_id.clone();
        tracing::debug!(
            "Starting producer {} with required acks {}",
            client_id,
            config.required_acks.as_i16()
        );

        tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                let completion = match shared.append(
                    &record.topic,
                    record.partition,
                    record.key.clone(),
                    record.value.clone(),
                ) {
                    Ok(offset) => Completion::success(record, offset),
                    Err(err) => {
                        tracing::warn!("Producer {} could not write record: {}", client_id, err);
                        Completion::failure(record, err)
                    }
                };
                if completion_sender.send(completion).is_err() {
                    tracing::warn!("Producer {} lost its completion receiver", client_id);
                    break;
                }
            }
            tracing::debug!("Producer {} finished", client_id);
        });

        Ok(ProducerChannels {
            sender,
            completions,
        })
    }

    async fn fetch_offset(
        &self,
        group_id: &str,
        topic: &str,
        partition: Partition,
    ) -> Result<Option<Offset>> {
        Ok(self.committed_offset(group_id, topic, partition))
    }

    #[instrument(level = "debug", skip(self))]
    async fn commit_offset(
        &self,
        group_id: &str,
        topic: &str,
        partition: Partition,
        next_offset: Offset,
    ) -> Result<()> {
        let mut state = self.shared.state();
        state.log(topic, partition)?;
        state
            .group_offsets
            .insert((group_id.to_owned(), topic.to_owned(), partition), next_offset);
        Ok(())
    }

    async fn earliest_offset(&self, topic: &str, partition: Partition) -> Result<Offset> {
        Ok(self.shared.state().log(topic, partition)?.start_offset)
    }

    async fn newest_offset(&self, topic: &str, partition: Partition) -> Result<Offset> {
        Ok(self.shared.state().log(topic, partition)?.end_offset())
    }

    async fn close(&self) -> Result<()> {
        self.shared.state().closed_clients += 1;
        Ok(())
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(
        &self,
        broker_list: &[String],
        client_id: &str,
    ) -> Result<Arc<dyn BrokerClient>> {
        tracing::debug!(
            "Client {} connecting to in-memory cluster (ignoring {:?})",
            client_id,
            broker_list
        );
        self.shared.state().connections += 1;
        Ok(Arc::new(self.clone()))
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
