//! [`BrokerClient`] for a real Kafka/Redpanda cluster, built on `samsa`.
//!
//! Enabled with the `kafka` feature.
//!
//! Every partition processor gets its own [`KafkaClient`]. The consumer stream
//! and the producer task open their own broker connections, and offset
//! requests on the shared ones run one at a time, so a request and its
//! response never interleave with another on the same socket.
//!
//! ### Example
//! ```rust,ignore
//! let connector = Arc::new(KafkaConnector::new().timeout_ms(5000));
//! let mut topic_processor = TopicProcessor::new(config, make_processor, 0, connector)?;
//! topic_processor.start().await?;
//! ```

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use samsa::prelude::{
    commit_offset, fetch_offset, list_offsets, protocol, BrokerConnection, ClusterMetadata,
    ConsumeMessage, ConsumerBuilder, KafkaCode, TopicPartitions,
};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::StreamExt;
use tracing::instrument;

use super::{
    BrokerClient, BrokerConnector, Completion, ConsumedRecord, ProducerChannels, ProducerConfig,
    ProducerRecord, RecordStream, StartOffset,
};
use crate::{
    config::RequiredAcks,
    error::{Error, Result},
    types::{Offset, Partition, Topic},
};

const DEFAULT_TIMEOUT_MS: i32 = 1000;
const LATEST_TIMESTAMP: i64 = -1;
const EARLIEST_TIMESTAMP: i64 = -2;
/// The group offset store answers -1 for a partition the group never committed.
const NO_COMMITTED_OFFSET: i64 = -1;
/// Standalone commits carry no group generation.
const NO_GENERATION: i32 = -1;
/// Keep committed offsets for the broker's configured retention.
const DEFAULT_RETENTION_MS: i64 = -1;
/// Reported as the written offset when the producer does not wait for acks.
pub const UNKNOWN_OFFSET: Offset = -1;

impl From<samsa::prelude::Error> for Error {
    fn from(err: samsa::prelude::Error) -> Self {
        Error::BrokerError(format!("{:?}", err))
    }
}

fn check(code: KafkaCode, request: &str) -> Result<()> {
    if code == KafkaCode::None {
        Ok(())
    } else {
        Err(Error::BrokerError(format!("{} failed with {:?}", request, code)))
    }
}

/// Opens a [`KafkaClient`] per partition processor.
#[derive(Clone, Debug)]
pub struct KafkaConnector {
    timeout_ms: i32,
}

impl Default for KafkaConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl KafkaConnector {
    pub fn new() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// How long the broker may wait for replicas before answering a produce.
    pub fn timeout_ms(mut self, timeout_ms: i32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

#[async_trait]
impl BrokerConnector for KafkaConnector {
    #[instrument(level = "debug", skip(self))]
    async fn connect(
        &self,
        broker_list: &[String],
        client_id: &str,
    ) -> Result<Arc<dyn BrokerClient>> {
        let client = KafkaClient::connect(broker_list, client_id, self.timeout_ms).await?;
        Ok(Arc::new(client))
    }
}

pub struct KafkaClient {
    bootstrap_addrs: Vec<String>,
    client_id: String,
    timeout_ms: i32,
    bootstrap: BrokerConnection,
    correlation_id: Arc<AtomicI32>,
    /// Held for the length of one offset request and its response.
    requests: Mutex<()>,
    leaders: Mutex<HashMap<(Topic, Partition), BrokerConnection>>,
    coordinators: Mutex<HashMap<String, BrokerConnection>>,
}

impl KafkaClient {
    pub async fn connect(broker_list: &[String], client_id: &str, timeout_ms: i32) -> Result<Self> {
        if broker_list.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one bootstrap broker is required".to_string(),
            ));
        }
        tracing::info!(
            "Client {} connecting to cluster at {}",
            client_id,
            broker_list.join(",")
        );
        let bootstrap = BrokerConnection::new(broker_list.to_vec()).await?;
        Ok(Self {
            bootstrap_addrs: broker_list.to_vec(),
            client_id: client_id.to_owned(),
            timeout_ms,
            bootstrap,
            correlation_id: Arc::new(AtomicI32::new(1)),
            requests: Mutex::new(()),
            leaders: Mutex::new(HashMap::new()),
            coordinators: Mutex::new(HashMap::new()),
        })
    }

    fn next_correlation_id(&self) -> i32 {
        self.correlation_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn leader(&self, topic: &str, partition: Partition) -> Result<BrokerConnection> {
        let mut leaders = self.leaders.lock().await;
        let key = (topic.to_owned(), partition);
        if let Some(conn) = leaders.get(&key) {
            return Ok(conn.clone());
        }
        let conn = leader_connection(&self.bootstrap_addrs, &self.client_id, topic, partition).await?;
        leaders.insert(key, conn.clone());
        Ok(conn)
    }

    async fn coordinator(&self, group_id: &str) -> Result<BrokerConnection> {
        let mut coordinators = self.coordinators.lock().await;
        if let Some(conn) = coordinators.get(group_id) {
            return Ok(conn.clone());
        }
        let request = protocol::FindCoordinatorRequest::new(
            self.next_correlation_id(),
            &self.client_id,
            group_id,
        );
        self.bootstrap.send_request(&request).await?;
        let response =
            protocol::FindCoordinatorResponse::try_from(self.bootstrap.receive_response().await?.freeze())?;
        check(response.error_code, "find coordinator")?;

        let addr = coordinator_address(&response.host, response.port)?;
        tracing::debug!("Group {} is coordinated by {}", group_id, addr);
        let conn = BrokerConnection::new(vec![addr]).await?;
        coordinators.insert(group_id.to_owned(), conn.clone());
        Ok(conn)
    }

    async fn list_offset(&self, topic: &str, partition: Partition, timestamp: i64) -> Result<Offset> {
        let _request = self.requests.lock().await;
        let conn = self.leader(topic, partition).await?;
        let response = list_offsets(
            &conn,
            self.next_correlation_id(),
            &self.client_id,
            &assignment(topic, partition),
            timestamp,
        )
        .await?;
        let found = response
            .into_box_iter()
            .find(|(_, found)| found.partition_index == partition)
            .map(|(_, found)| found)
            .ok_or_else(|| Error::UnknownTopicOrPartition(topic.to_owned(), partition))?;
        check(found.error_code, "list offsets")?;
        Ok(found.offset)
    }
}

#[async_trait]
impl BrokerClient for KafkaClient {
    #[instrument(level = "debug", skip(self), fields(client_id = %self.client_id))]
    async fn consume_partition(
        &self,
        topic: &str,
        partition: Partition,
        start: StartOffset,
    ) -> Result<RecordStream> {
        let newest = self.newest_offset(topic, partition).await?;
        let position = match start {
            StartOffset::Newest => newest,
            StartOffset::At(offset) => {
                let earliest = self.earliest_offset(topic, partition).await?;
                if offset < earliest || offset > newest {
                    return Err(Error::OffsetOutOfRange {
                        topic: topic.to_owned(),
                        partition,
                        offset,
                    });
                }
                offset
            }
        };
        tracing::debug!(
            "Consuming topic {} partition {} from offset {}",
            topic,
            partition,
            position
        );

        let consumer = ConsumerBuilder::new(self.bootstrap_addrs.clone(), assignment(topic, partition))
            .await?
            .client_id(self.client_id.clone())
            .seek(&HashMap::from([((topic.to_owned(), partition), position)]))
            .build();
        let mut batches = Box::pin(consumer.into_stream());
        let topic = topic.to_owned();

        Ok(Box::pin(async_stream::stream! {
            let mut position = position;
            while let Some(batch) = batches.next().await {
                match batch {
                    Err(err) => {
                        yield Err(Error::from(err));
                        break;
                    }
                    Ok((messages, _)) => {
                        for record in records_from(&topic, position, messages) {
                            position = record.offset + 1;
                            yield Ok(record);
                        }
                    }
                }
            }
        }))
    }

    #[instrument(level = "debug", skip(self), fields(client_id = %self.client_id))]
    async fn producer(&self, config: &ProducerConfig) -> Result<ProducerChannels> {
        let (sender, mut receiver) = mpsc::channel::<ProducerRecord>(config.buffer_size.max(1));
        let (completion_sender, completions) = mpsc::unbounded_channel();
        let bootstrap_addrs = self.bootstrap_addrs.clone();
        let client_id = config.client_id.clone();
        let required_acks = config.required_acks;
        let timeout_ms = self.timeout_ms;
        let correlation_id = Arc::clone(&self.correlation_id);
        tracing::debug!(
            "Starting producer {} with required acks {}",
            client_id,
            required_acks.as_i16()
        );

        tokio::spawn(async move {
            let mut leaders: HashMap<(Topic, Partition), BrokerConnection> = HashMap::new();
            while let Some(record) = receiver.recv().await {
                let key = (record.topic.clone(), record.partition);
                let leader = match leaders.get(&key).cloned() {
                    Some(conn) => Ok(conn),
                    None => {
                        leader_connection(&bootstrap_addrs, &client_id, &record.topic, record.partition)
                            .await
                    }
                };
                let written = match leader {
                    Ok(conn) => {
                        leaders.insert(key.clone(), conn.clone());
                        let id = correlation_id.fetch_add(1, Ordering::Relaxed);
                        produce_one(&conn, id, &client_id, required_acks, timeout_ms, &record).await
                    }
                    Err(err) => Err(err),
                };
                let completion = match written {
                    Ok(offset) => Completion::success(record, offset),
                    Err(err) => {
                        tracing::warn!("Producer {} could not write record: {}", client_id, err);
                        // the next record looks the leader up again
                        leaders.remove(&key);
                        let reason = err.to_string();
                        let (topic, partition) = key;
                        Completion::failure(record, Error::SendFailed { topic, partition, reason })
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
        let _request = self.requests.lock().await;
        let conn = self.coordinator(group_id).await?;
        let response = fetch_offset(
            self.next_correlation_id(),
            &self.client_id,
            group_id,
            conn,
            &assignment(topic, partition),
        )
        .await?;
        check(response.error_code, "offset fetch")?;

        let found = response
            .into_box_iter()
            .find(|(_, found)| found.partition_index == partition)
            .map(|(_, found)| found)
            .ok_or_else(|| Error::UnknownTopicOrPartition(topic.to_owned(), partition))?;
        check(found.error_code, "offset fetch")?;
        Ok(committed(found.committed_offset))
    }

    #[instrument(level = "debug", skip(self), fields(client_id = %self.client_id))]
    async fn commit_offset(
        &self,
        group_id: &str,
        topic: &str,
        partition: Partition,
        next_offset: Offset,
    ) -> Result<()> {
        let _request = self.requests.lock().await;
        let conn = self.coordinator(group_id).await?;
        commit_offset(
            self.next_correlation_id(),
            &self.client_id,
            group_id,
            conn,
            NO_GENERATION,
            Bytes::new(),
            HashMap::from([((topic.to_owned(), partition), next_offset)]),
            DEFAULT_RETENTION_MS,
        )
        .await?;
        Ok(())
    }

    async fn earliest_offset(&self, topic: &str, partition: Partition) -> Result<Offset> {
        self.list_offset(topic, partition, EARLIEST_TIMESTAMP).await
    }

    async fn newest_offset(&self, topic: &str, partition: Partition) -> Result<Offset> {
        self.list_offset(topic, partition, LATEST_TIMESTAMP).await
    }

    async fn close(&self) -> Result<()> {
        tracing::debug!("Client {} closing broker connections", self.client_id);
        self.leaders.lock().await.clear();
        self.coordinators.lock().await.clear();
        Ok(())
    }
}

async fn leader_connection(
    bootstrap_addrs: &[String],
    client_id: &str,
    topic: &str,
    partition: Partition,
) -> Result<BrokerConnection> {
    let metadata = ClusterMetadata::new(
        bootstrap_addrs.to_vec(),
        client_id.to_owned(),
        vec![topic.to_owned()],
    )
    .await?;
    let conn = metadata.get_connection_for_broker(topic, partition)?;
    Ok(conn.clone())
}

/// Write a single record and return the offset the leader assigned to it.
async fn produce_one(
    conn: &BrokerConnection,
    correlation_id: i32,
    client_id: &str,
    required_acks: RequiredAcks,
    timeout_ms: i32,
    record: &ProducerRecord,
) -> Result<Offset> {
    let mut request = protocol::ProduceRequest::new(
        required_acks.as_i16(),
        timeout_ms,
        correlation_id,
        client_id,
    );
    request.add(
        &record.topic,
        record.partition,
        Some(record.key.clone()),
        Some(record.value.clone()),
    );
    conn.send_request(&request).await?;
    if !awaits_response(required_acks) {
        return Ok(UNKNOWN_OFFSET);
    }

    let response = protocol::ProduceResponse::try_from(conn.receive_response().await?.freeze())?;
    let written = response
        .responses
        .iter()
        .flat_map(|topic| topic.partition_responses.iter())
        .find(|written| written.index == record.partition)
        .ok_or_else(|| Error::UnknownTopicOrPartition(record.topic.clone(), record.partition))?;
    check(written.error_code, "produce")?;
    Ok(written.base_offset)
}

/// The broker answers a produce request unless no acknowledgement was asked for.
fn awaits_response(required_acks: RequiredAcks) -> bool {
    required_acks.as_i16() != 0
}

fn committed(offset: i64) -> Option<Offset> {
    if offset == NO_COMMITTED_OFFSET {
        None
    } else {
        Some(offset)
    }
}

fn assignment(topic: &str, partition: Partition) -> TopicPartitions {
    HashMap::from([(topic.to_owned(), vec![partition])])
}

fn coordinator_address(host: &Bytes, port: i32) -> Result<String> {
    let host = std::str::from_utf8(host)
        .map_err(|err| Error::BrokerError(format!("coordinator host is not UTF-8: {}", err)))?;
    Ok(format!("{}:{}", host, port))
}

/// A fetch returns whole record batches, which may start before the
/// requested offset.
fn records_from(topic: &str, position: Offset, messages: Vec<ConsumeMessage>) -> Vec<ConsumedRecord> {
    messages
        .into_iter()
        .filter(|message| message.offset as Offset >= position)
        .map(|message| ConsumedRecord {
            topic: topic.to_owned(),
            partition: message.partition_index,
            offset: message.offset as Offset,
            key: message.key,
            value: message.value,
            timestamp: message.timestamp as i64,
        })
        .collect()
}
