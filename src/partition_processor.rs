//! Engine for a single assigned partition.
//!
//! A [`PartitionProcessor`] owns everything about one partition of the input
//! topics: the consumer streams, the producer, the user logic instance and the
//! per-topic [`CommitQueue`]s. [`run`](PartitionProcessor::run) drives it as a
//! single task that handles, one at a time,
//!
//! - records arriving from any input topic,
//! - completions of records sent by the user logic,
//! - the periodic offset commit,
//! - the shutdown signal.
//!
//! Since only that task touches the commit queues, they need no locking.
//! Offsets are committed strictly in consumption order and never past a
//! message whose output has not been acknowledged.

use std::{collections::HashMap, sync::Arc};

use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_stream::{StreamExt, StreamMap};
use tracing::instrument;

use crate::{
    broker::{
        BrokerClient, Completion, ConsumedRecord, ProducerConfig, ProducerRecord, RecordStream,
        StartOffset,
    },
    config::{SendFailurePolicy, TopicProcessorConfig},
    error::{Error, Result},
    in_flight::CommitQueue,
    processor::{Coordinator, MessageProcessor, PartitionProcessorContext},
    sender::OutgoingMessageSender,
    types::{IncomingMessage, Offset, Partition, Topic},
};

enum Event {
    Shutdown,
    Completion(Completion),
    MarkOffsets,
    Record(Option<(Topic, Result<ConsumedRecord>)>),
}

/// Where to resume a topic-partition.
///
/// Resumes at the committed offset unless retention has already removed it,
/// in which case the earliest retained record is next. A committed offset
/// beyond the end of the log (the log was recreated or truncated) resumes at
/// the newest offset instead of failing.
pub fn resolve_start_offset(committed: Option<Offset>, earliest: Offset, newest: Offset) -> StartOffset {
    let next = committed.map_or(earliest, |committed| committed.max(earliest));
    if next > newest {
        StartOffset::Newest
    } else {
        StartOffset::At(next)
    }
}

async fn resume_position(
    client: &dyn BrokerClient,
    group_id: &str,
    topic: &str,
    partition: Partition,
) -> Result<StartOffset> {
    let committed = client.fetch_offset(group_id, topic, partition).await?;
    let earliest = client.earliest_offset(topic, partition).await?;
    let newest = client.newest_offset(topic, partition).await?;

    let start = resolve_start_offset(committed, earliest, newest);
    if start == StartOffset::Newest {
        tracing::warn!(
            "Partition {} | committed offset {:?} for topic {} is past the newest offset {}, resuming from newest",
            partition,
            committed,
            topic,
            newest
        );
    } else {
        tracing::debug!(
            "Partition {} | resuming topic {} at {:?} (committed {:?}, earliest {})",
            partition,
            topic,
            start,
            committed,
            earliest
        );
    }
    Ok(start)
}

pub struct PartitionProcessor<K, V> {
    config: Arc<TopicProcessorConfig<K, V>>,
    context: PartitionProcessorContext,
    client: Arc<dyn BrokerClient>,
    processor: Box<dyn MessageProcessor<K, V>>,
    coordinator: Arc<dyn Coordinator>,
    consumers: StreamMap<Topic, RecordStream>,
    /// `None` once shutdown has begun.
    producer: Option<mpsc::Sender<ProducerRecord>>,
    completions: mpsc::UnboundedReceiver<Completion>,
    commit_queues: HashMap<Topic, CommitQueue>,
    /// Next offsets that were safe to commit but could not be written yet.
    pending_commits: HashMap<Topic, Offset>,
    next_sequence: u64,
}

impl<K, V> PartitionProcessor<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Open consumers and a producer for the partition and initialize the
    /// user logic.
    #[instrument(name = "partition-start", skip_all, fields(partition = context.partition))]
    pub async fn start(
        config: Arc<TopicProcessorConfig<K, V>>,
        context: PartitionProcessorContext,
        client: Arc<dyn BrokerClient>,
        processor: Box<dyn MessageProcessor<K, V>>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Result<Self> {
        let partition = context.partition;
        let mut consumers = StreamMap::new();
        let mut commit_queues = HashMap::new();
        for topic in config.input_topics.iter() {
            let start =
                resume_position(client.as_ref(), config.group_id(), topic, partition).await?;
            let stream = client.consume_partition(topic, partition, start).await?;
            consumers.insert(topic.to_owned(), stream);
            commit_queues.insert(topic.to_owned(), CommitQueue::new(topic.to_owned()));
        }

        let channels = client
            .producer(&ProducerConfig {
                client_id: config.producer_client_id(context.container_id),
                required_acks: config.kasper_config.required_acks,
                buffer_size: config.kasper_config.producer_buffer_size,
            })
            .await?;

        let mut partition_processor = Self {
            config,
            context,
            client,
            processor,
            coordinator,
            consumers,
            producer: Some(channels.sender),
            completions: channels.completions,
            commit_queues,
            pending_commits: HashMap::new(),
            next_sequence: 0,
        };
        partition_processor
            .processor
            .initialize(&partition_processor.config, &partition_processor.context)
            .await;

        tracing::info!(
            "Partition {} | started for topics {:?}",
            partition,
            partition_processor.config.input_topics
        );
        Ok(partition_processor)
    }

    pub fn partition(&self) -> Partition {
        self.context.partition
    }

    pub fn commit_queue(&self, topic: &str) -> Option<&CommitQueue> {
        self.commit_queues.get(topic)
    }

    /// Process messages until `shutdown` is set to `true` or a fatal error
    /// occurs. Dropping every sender of `shutdown` also stops the partition;
    /// setting it back to `false` does not.
    ///
    /// A clean stop drains outstanding completions and commits what is safe
    /// to commit. A fatal error only releases broker resources and is
    /// returned as is.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let partition = self.context.partition;
        match self.event_loop(&mut shutdown).await {
            Ok(()) => self.shutdown().await,
            Err(err) => {
                tracing::error!("Partition {} | stopping: {}", partition, err);
                if let Err(release_err) = self.release().await {
                    tracing::warn!(
                        "Partition {} | could not release broker resources: {}",
                        partition,
                        release_err
                    );
                }
                Err(err)
            }
        }
    }

    async fn event_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        if *shutdown.borrow_and_update() {
            return Ok(());
        }
        let partition = self.context.partition;
        let interval = self.config.mark_offsets_interval;
        let mut mark_offsets = time::interval_at(Instant::now() + interval, interval);
        mark_offsets.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                biased;
                changed = shutdown.changed() => match changed {
                    Ok(()) if *shutdown.borrow_and_update() => Event::Shutdown,
                    Ok(()) => continue,
                    Err(_) => Event::Shutdown,
                },
                Some(completion) = self.completions.recv() => Event::Completion(completion),
                _ = mark_offsets.tick() => Event::MarkOffsets,
                record = self.consumers.next(), if !self.consumers.is_empty() => Event::Record(record),
            };

            match event {
                Event::Shutdown => return Ok(()),
                Event::Completion(completion) => self.on_send_completion(completion)?,
                Event::MarkOffsets => self.mark_offsets().await,
                Event::Record(Some((_, Ok(record)))) => {
                    self.process_consumer_message(record).await?
                }
                Event::Record(Some((topic, Err(err)))) => {
                    tracing::error!(
                        "Partition {} | consumer for topic {} failed: {}",
                        partition,
                        topic,
                        err
                    );
                    return Err(err);
                }
                Event::Record(None) => {
                    tracing::warn!("Partition {} | every consumer stream has ended", partition)
                }
            }
        }
    }

    /// Decode a record, hand it to the user logic and track what it sent.
    #[instrument(level = "trace", skip_all, fields(topic = %record.topic, offset = record.offset))]
    pub async fn process_consumer_message(&mut self, record: ConsumedRecord) -> Result<()> {
        let codec = self
            .config
            .topic_codecs
            .get(&record.topic)
            .ok_or_else(|| Error::MissingCodec(record.topic.clone()))?;
        let message = IncomingMessage {
            key: codec.key.deserialize(&record.key)?,
            value: codec.value.deserialize(&record.value)?,
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
            timestamp: record.timestamp,
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let producer = self.producer.as_ref().ok_or(Error::ProducerClosed)?;
        let mut sender = OutgoingMessageSender::new(
            &self.config.topic_codecs,
            producer,
            &message.topic,
            sequence,
        );
        self.processor
            .process(&message, &mut sender, self.coordinator.as_ref())
            .await;
        let group = sender.into_in_flight_group(message.offset)?;
        tracing::trace!(
            "Partition {} | offset {} of topic {} sent {} records",
            self.context.partition,
            message.offset,
            message.topic,
            group.messages().len()
        );

        self.commit_queues
            .entry(message.topic.clone())
            .or_insert_with(|| CommitQueue::new(message.topic.clone()))
            .push(group)?;

        for queue in self.commit_queues.values_mut() {
            queue.compact();
        }
        Ok(())
    }

    /// Record the outcome of one sent record.
    pub fn on_send_completion(&mut self, completion: Completion) -> Result<()> {
        let Completion { record, result } = completion;
        let correlation = record.correlation;
        let queue = self
            .commit_queues
            .get_mut(&correlation.topic)
            .ok_or_else(|| Error::UnknownGroup {
                topic: correlation.topic.clone(),
                sequence: correlation.sequence,
            })?;

        match result {
            Ok(offset) => {
                tracing::trace!(
                    "Partition {} | record for group {} slot {} written to topic {} at offset {}",
                    self.context.partition,
                    correlation.sequence,
                    correlation.slot,
                    record.topic,
                    offset
                );
                queue.acknowledge(correlation.sequence, correlation.slot)
            }
            Err(err) => {
                queue.fail(correlation.sequence, correlation.slot)?;
                tracing::error!(
                    "Partition {} | record for topic {} partition {} (from topic {} group {}) was not written: {}",
                    self.context.partition,
                    record.topic,
                    record.partition,
                    correlation.topic,
                    correlation.sequence,
                    err
                );
                match self.config.kasper_config.send_failure_policy {
                    SendFailurePolicy::Halt => Err(Error::SendFailed {
                        topic: record.topic,
                        partition: record.partition,
                        reason: err.to_string(),
                    }),
                    SendFailurePolicy::Stall => {
                        tracing::warn!(
                            "Partition {} | offsets for topic {} will not advance past group {}",
                            self.context.partition,
                            correlation.topic,
                            correlation.sequence
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    /// Commit, per input topic, the offset after the acknowledged prefix of
    /// its commit queue.
    ///
    /// A failed write is logged and retried on the next call.
    pub async fn mark_offsets(&mut self) {
        let config = Arc::clone(&self.config);
        let partition = self.context.partition;
        for topic in config.input_topics.iter() {
            let drained = self
                .commit_queues
                .get_mut(topic)
                .and_then(CommitQueue::drain_acknowledged)
                .map(|offset| offset + 1);
            let next_offset = match drained
                .into_iter()
                .chain(self.pending_commits.remove(topic))
                .max()
            {
                Some(next_offset) => next_offset,
                None => continue,
            };

            match self
                .client
                .commit_offset(config.group_id(), topic, partition, next_offset)
                .await
            {
                Ok(()) => tracing::debug!(
                    "Partition {} | committed next offset {} for topic {}",
                    partition,
                    next_offset,
                    topic
                ),
                Err(err) => {
                    tracing::warn!(
                        "Partition {} | could not commit next offset {} for topic {}, retrying later: {}",
                        partition,
                        next_offset,
                        topic,
                        err
                    );
                    self.pending_commits.insert(topic.to_owned(), next_offset);
                }
            }
        }
    }

    /// Stop consuming, wait a bounded time for outstanding completions,
    /// commit what is safe and release broker resources.
    ///
    /// Records still unacknowledged when the drain timeout expires are left
    /// uncommitted and will be reprocessed by the next owner of the partition.
    #[instrument(name = "partition-shutdown", skip_all, fields(partition = self.context.partition))]
    pub async fn shutdown(&mut self) -> Result<()> {
        let partition = self.context.partition;
        tracing::info!("Partition {} | shutting down", partition);
        self.consumers.clear();
        // the producer hangs up the completions channel once its input is gone
        self.producer.take();

        let drain_timeout = self.config.kasper_config.shutdown_drain_timeout;
        match time::timeout(drain_timeout, self.drain_completions()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.release().await?;
                return Err(err);
            }
            Err(_) => tracing::warn!(
                "Partition {} | gave up waiting for completions after {:?}",
                partition,
                drain_timeout
            ),
        }

        self.mark_offsets().await;
        self.release().await
    }

    async fn drain_completions(&mut self) -> Result<()> {
        while let Some(completion) = self.completions.recv().await {
            self.on_send_completion(completion)?;
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        self.consumers.clear();
        self.producer.take();
        self.completions.close();
        self.client.close().await
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::watch;

    use super::{resolve_start_offset, PartitionProcessor};
    use crate::{
        broker::{
            memory::InMemoryBroker, BrokerClient, Completion, ConsumedRecord, Correlation,
            ProducerChannels, ProducerConfig, ProducerRecord, RecordStream, StartOffset,
        },
        codec::{StringCodec, TopicCodec},
        config::{SendFailurePolicy, TopicProcessorConfig, TopicProcessorConfigBuilder},
        error::{Error, ErrorKind, Result},
        processor::{Coordinator, MessageProcessor, NoopCoordinator, PartitionProcessorContext},
        sender::Sender,
        types::{IncomingMessage, Offset, OutgoingMessage, Partition},
    };

    const GROUP: &str = "shipping";
    const INPUT: &str = "orders";
    const OUTPUT: &str = "shipments";

    /// Sends as many records as the incoming value says.
    struct Fanout;

    #[async_trait]
    impl MessageProcessor<String, String> for Fanout {
        async fn process(
            &mut self,
            message: &IncomingMessage<String, String>,
            sender: &mut dyn Sender<String, String>,
            _coordinator: &dyn Coordinator,
        ) {
            let count: usize = message.value.parse().unwrap_or(0);
            for i in 0..count {
                let outgoing = OutgoingMessage::new(
                    OUTPUT,
                    0,
                    message.key.clone(),
                    format!("{}-{}", message.offset, i),
                );
                if sender.send(outgoing).await.is_err() {
                    return;
                }
            }
        }
    }

    struct Recording {
        contexts: Arc<Mutex<Vec<PartitionProcessorContext>>>,
    }

    #[async_trait]
    impl MessageProcessor<String, String> for Recording {
        async fn initialize(
            &mut self,
            config: &TopicProcessorConfig<String, String>,
            context: &PartitionProcessorContext,
        ) {
            assert_eq!(config.group_id(), GROUP);
            self.contexts.lock().unwrap().push(context.clone());
        }

        async fn process(
            &mut self,
            _message: &IncomingMessage<String, String>,
            _sender: &mut dyn Sender<String, String>,
            _coordinator: &dyn Coordinator,
        ) {
        }
    }

    fn config(policy: SendFailurePolicy) -> Arc<TopicProcessorConfig<String, String>> {
        Arc::new(
            TopicProcessorConfigBuilder::new(GROUP)
                .input_topic(INPUT)
                .topic_codec(INPUT, TopicCodec::new(StringCodec, StringCodec))
                .topic_codec(OUTPUT, TopicCodec::new(StringCodec, StringCodec))
                .assign(0, 0)
                .mark_offsets_interval(Duration::from_millis(10))
                .send_failure_policy(policy)
                .build()
                .unwrap(),
        )
    }

    fn broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.create_topic(INPUT, 1);
        broker.create_topic(OUTPUT, 1);
        broker
    }

    fn context() -> PartitionProcessorContext {
        PartitionProcessorContext {
            container_id: 0,
            partition: 0,
            input_topics: vec![INPUT.to_string()],
        }
    }

    async fn start_with(
        broker: &InMemoryBroker,
        policy: SendFailurePolicy,
        processor: Box<dyn MessageProcessor<String, String>>,
    ) -> PartitionProcessor<String, String> {
        PartitionProcessor::start(
            config(policy),
            context(),
            Arc::new(broker.clone()),
            processor,
            Arc::new(NoopCoordinator),
        )
        .await
        .unwrap()
    }

    async fn start(broker: &InMemoryBroker) -> PartitionProcessor<String, String> {
        start_with(broker, SendFailurePolicy::Halt, Box::new(Fanout)).await
    }

    fn record(offset: i64, sends: usize) -> ConsumedRecord {
        ConsumedRecord {
            topic: INPUT.to_string(),
            partition: 0,
            offset,
            key: Bytes::from_static(b"customer"),
            value: Bytes::from(sends.to_string()),
            timestamp: 0,
        }
    }

    async fn completions(
        processor: &mut PartitionProcessor<String, String>,
        count: usize,
    ) -> Vec<Completion> {
        let mut completions = vec![];
        for _ in 0..count {
            completions.push(processor.completions.recv().await.unwrap());
        }
        completions
    }

    fn committed(broker: &InMemoryBroker) -> Option<i64> {
        broker.committed_offset(GROUP, INPUT, 0)
    }

    /// Rejects the next `failures` offset commits, everything else goes to
    /// the in-memory broker.
    struct FlakyCommits {
        inner: InMemoryBroker,
        failures: Mutex<usize>,
    }

    impl FlakyCommits {
        fn fail_next_commit(&self) {
            *self.failures.lock().unwrap() += 1;
        }
    }

    #[async_trait]
    impl BrokerClient for FlakyCommits {
        async fn consume_partition(
            &self,
            topic: &str,
            partition: Partition,
            start: StartOffset,
        ) -> Result<RecordStream> {
            self.inner.consume_partition(topic, partition, start).await
        }

        async fn producer(&self, config: &ProducerConfig) -> Result<ProducerChannels> {
            self.inner.producer(config).await
        }

        async fn fetch_offset(
            &self,
            group_id: &str,
            topic: &str,
            partition: Partition,
        ) -> Result<Option<Offset>> {
            self.inner.fetch_offset(group_id, topic, partition).await
        }

        async fn commit_offset(
            &self,
            group_id: &str,
            topic: &str,
            partition: Partition,
            next_offset: Offset,
        ) -> Result<()> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(Error::BrokerError("coordinator unavailable".to_string()));
                }
            }
            self.inner
                .commit_offset(group_id, topic, partition, next_offset)
                .await
        }

        async fn earliest_offset(&self, topic: &str, partition: Partition) -> Result<Offset> {
            self.inner.earliest_offset(topic, partition).await
        }

        async fn newest_offset(&self, topic: &str, partition: Partition) -> Result<Offset> {
            self.inner.newest_offset(topic, partition).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[test]
    fn start_offset_resolution() {
        assert_eq!(resolve_start_offset(None, 4, 9), StartOffset::At(4));
        assert_eq!(resolve_start_offset(Some(6), 4, 9), StartOffset::At(6));
        assert_eq!(resolve_start_offset(Some(2), 4, 9), StartOffset::At(4));
        assert_eq!(resolve_start_offset(Some(9), 4, 9), StartOffset::At(9));
        assert_eq!(resolve_start_offset(Some(12), 4, 9), StartOffset::Newest);
    }

    #[tokio::test]
    async fn acknowledged_prefix_is_committed() {
        let broker = broker();
        let mut processor = start(&broker).await;

        processor.process_consumer_message(record(10, 2)).await.unwrap();
        processor.process_consumer_message(record(11, 0)).await.unwrap();
        processor.process_consumer_message(record(12, 1)).await.unwrap();

        let mut completions = completions(&mut processor, 3).await;
        let last = completions.pop().unwrap();
        for completion in completions {
            processor.on_send_completion(completion).unwrap();
        }
        processor.mark_offsets().await;
        assert_eq!(committed(&broker), Some(12));

        processor.on_send_completion(last).unwrap();
        processor.mark_offsets().await;
        assert_eq!(committed(&broker), Some(13));
        assert_eq!(broker.records(OUTPUT, 0).len(), 3);
    }

    #[tokio::test]
    async fn later_ack_waits_for_earlier_group() {
        let broker = broker();
        let mut processor = start(&broker).await;

        processor.process_consumer_message(record(0, 2)).await.unwrap();
        processor.process_consumer_message(record(1, 1)).await.unwrap();
        let mut completions = completions(&mut processor, 3).await;
        let b = completions.pop().unwrap();
        let a1 = completions.pop().unwrap();
        let a0 = completions.pop().unwrap();

        processor.on_send_completion(b).unwrap();
        processor.mark_offsets().await;
        assert_eq!(committed(&broker), None);

        processor.on_send_completion(a1).unwrap();
        processor.mark_offsets().await;
        assert_eq!(committed(&broker), None);

        processor.on_send_completion(a0).unwrap();
        processor.mark_offsets().await;
        assert_eq!(committed(&broker), Some(2));
    }

    #[tokio::test]
    async fn message_without_output_is_committed_at_once() {
        let broker = broker();
        let mut processor = start(&broker).await;

        processor.process_consumer_message(record(0, 0)).await.unwrap();
        processor.mark_offsets().await;
        assert_eq!(committed(&broker), Some(1));

        // nothing new to commit
        processor.mark_offsets().await;
        assert_eq!(committed(&broker), Some(1));
    }

    #[tokio::test]
    async fn acknowledged_run_is_compacted_after_each_message() {
        let broker = broker();
        let mut processor = start(&broker).await;

        for offset in 0..5 {
            processor
                .process_consumer_message(record(offset, 0))
                .await
                .unwrap();
            assert_eq!(processor.commit_queue(INPUT).unwrap().len(), 1);
        }
        processor.mark_offsets().await;
        assert_eq!(committed(&broker), Some(5));
        assert!(processor.commit_queue(INPUT).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmatched_completion_is_fatal() {
        let broker = broker();
        let mut processor = start(&broker).await;
        processor.process_consumer_message(record(0, 1)).await.unwrap();

        let stray = Completion::success(
            ProducerRecord {
                topic: OUTPUT.to_string(),
                partition: 0,
                key: Bytes::new(),
                value: Bytes::new(),
                correlation: Correlation {
                    topic: INPUT.to_string(),
                    sequence: 99,
                    slot: 0,
                },
            },
            0,
        );
        assert_eq!(
            processor.on_send_completion(stray),
            Err(Error::UnknownGroup {
                topic: INPUT.to_string(),
                sequence: 99
            })
        );

        let mut completions = completions(&mut processor, 1).await;
        let completion = completions.pop().unwrap();
        processor.on_send_completion(completion.clone()).unwrap();
        assert!(matches!(
            processor.on_send_completion(completion),
            Err(Error::DuplicateCompletion { .. })
        ));
    }

    #[tokio::test]
    async fn failed_send_halts_by_default() {
        let broker = broker();
        broker.reject_writes_to(OUTPUT);
        let mut processor = start(&broker).await;

        processor.process_consumer_message(record(0, 1)).await.unwrap();
        let completion = completions(&mut processor, 1).await.pop().unwrap();
        assert!(matches!(
            processor.on_send_completion(completion),
            Err(Error::SendFailed { .. })
        ));
        processor.mark_offsets().await;
        assert_eq!(committed(&broker), None);
    }

    #[tokio::test]
    async fn failed_send_stalls_commits_when_configured() {
        let broker = broker();
        let mut processor =
            start_with(&broker, SendFailurePolicy::Stall, Box::new(Fanout)).await;

        processor.process_consumer_message(record(0, 0)).await.unwrap();
        broker.reject_writes_to(OUTPUT);
        processor.process_consumer_message(record(1, 1)).await.unwrap();
        let failed = completions(&mut processor, 1).await.pop().unwrap();
        processor.on_send_completion(failed).unwrap();

        broker.accept_writes_to(OUTPUT);
        processor.process_consumer_message(record(2, 1)).await.unwrap();
        let written = completions(&mut processor, 1).await.pop().unwrap();
        processor.on_send_completion(written).unwrap();

        processor.mark_offsets().await;
        assert_eq!(committed(&broker), Some(1));
    }

    #[tokio::test]
    async fn record_from_unknown_topic_is_a_configuration_error() {
        let broker = broker();
        let mut processor = start(&broker).await;
        let mut stray = record(0, 0);
        stray.topic = "unexpected".to_string();
        assert_eq!(
            processor.process_consumer_message(stray).await,
            Err(Error::MissingCodec("unexpected".to_string()))
        );
    }

    #[tokio::test]
    async fn initialize_runs_once_before_processing() {
        let broker = broker();
        let contexts = Arc::new(Mutex::new(vec![]));
        let mut processor = start_with(
            &broker,
            SendFailurePolicy::Halt,
            Box::new(Recording {
                contexts: Arc::clone(&contexts),
            }),
        )
        .await;
        processor.process_consumer_message(record(0, 0)).await.unwrap();
        assert_eq!(*contexts.lock().unwrap(), vec![context()]);
    }

    #[tokio::test]
    async fn resumes_from_committed_offset() {
        let broker = broker();
        for value in ["0", "0", "0", "0"] {
            broker.produce(INPUT, 0, "k", value).unwrap();
        }
        broker.commit_offset(GROUP, INPUT, 0, 3).await.unwrap();

        let mut processor = start(&broker).await;
        let (_, record) = tokio_stream::StreamExt::next(&mut processor.consumers)
            .await
            .unwrap();
        assert_eq!(record.unwrap().offset, 3);
    }

    #[tokio::test]
    async fn resumes_from_newest_when_committed_offset_is_gone() {
        let broker = broker();
        broker.produce(INPUT, 0, "k", "0").unwrap();
        broker.commit_offset(GROUP, INPUT, 0, 40).await.unwrap();

        let mut processor = start(&broker).await;
        broker.produce(INPUT, 0, "k", "0").unwrap();
        let (_, record) = tokio_stream::StreamExt::next(&mut processor.consumers)
            .await
            .unwrap();
        assert_eq!(record.unwrap().offset, 1);
    }

    #[tokio::test]
    async fn run_commits_and_releases_on_shutdown() {
        let broker = broker();
        for value in ["2", "0", "1"] {
            broker.produce(INPUT, 0, "k", value).unwrap();
        }
        let processor = start(&broker).await;
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(processor.run(shutdown));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while committed(&broker) != Some(3) {
            assert!(tokio::time::Instant::now() < deadline, "offsets never committed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(broker.records(OUTPUT, 0).len(), 3);
        assert_eq!(broker.closed_clients(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_failed_send() {
        let broker = broker();
        broker.reject_writes_to(OUTPUT);
        broker.produce(INPUT, 0, "k", "1").unwrap();
        let processor = start(&broker).await;
        let (_stop, shutdown) = watch::channel(false);

        let result = tokio::time::timeout(Duration::from_secs(5), processor.run(shutdown))
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::SendFailed { .. })));
        assert_eq!(committed(&broker), None);
        assert_eq!(broker.closed_clients(), 1);
    }

    #[tokio::test]
    async fn failed_commit_is_retried_on_the_next_tick() {
        let broker = broker();
        let client = Arc::new(FlakyCommits {
            inner: broker.clone(),
            failures: Mutex::new(0),
        });
        let mut processor = PartitionProcessor::start(
            config(SendFailurePolicy::Halt),
            context(),
            Arc::clone(&client) as Arc<dyn BrokerClient>,
            Box::new(Fanout),
            Arc::new(NoopCoordinator),
        )
        .await
        .unwrap();

        client.fail_next_commit();
        processor.process_consumer_message(record(0, 0)).await.unwrap();
        processor.mark_offsets().await;
        assert_eq!(committed(&broker), None);
        // drained from the queue, only the retry still knows the offset
        assert!(processor.commit_queue(INPUT).unwrap().is_empty());

        processor.mark_offsets().await;
        assert_eq!(committed(&broker), Some(1));

        client.fail_next_commit();
        processor.process_consumer_message(record(1, 0)).await.unwrap();
        processor.mark_offsets().await;
        assert_eq!(committed(&broker), Some(1));

        processor.process_consumer_message(record(2, 0)).await.unwrap();
        processor.mark_offsets().await;
        assert_eq!(committed(&broker), Some(3));
    }

    #[tokio::test]
    async fn undecodable_record_is_rejected_before_tracking() {
        let broker = broker();
        let mut processor = start(&broker).await;
        let mut garbled = record(0, 1);
        garbled.value = Bytes::from_static(&[0xff, 0xfe, 0xfd]);

        let err = processor.process_consumer_message(garbled).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Codec);
        assert!(matches!(err, Error::DecodingError(_)));
        assert!(processor.commit_queue(INPUT).unwrap().is_empty());

        processor.mark_offsets().await;
        assert_eq!(committed(&broker), None);
        assert!(broker.records(OUTPUT, 0).is_empty());
    }

    #[tokio::test]
    async fn run_ignores_shutdown_reset_and_stops_when_sender_is_dropped() {
        let broker = broker();
        broker.produce(INPUT, 0, "k", "1").unwrap();
        let processor = start(&broker).await;
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(processor.run(shutdown));

        stop.send(false).unwrap();
        broker.produce(INPUT, 0, "k", "1").unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while committed(&broker) != Some(2) {
            assert!(tokio::time::Instant::now() < deadline, "partition stopped early");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!handle.is_finished());

        drop(stop);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(broker.records(OUTPUT, 0).len(), 2);
        assert_eq!(broker.closed_clients(), 1);
    }
}
