use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use kasper::prelude::{
    BrokerClient, BrokerConnector, Completion, Coordinator, Error, InMemoryBroker,
    IncomingMessage, MessageProcessor, Offset, OutgoingMessage, Partition, ProducerChannels,
    ProducerConfig, ProducerRecord, RecordStream, Sender, StartOffset, StringCodec, TopicCodec,
    TopicProcessorConfigBuilder,
};
use tokio::sync::mpsc;

pub const GROUP: &str = "shipping";
pub const ORDERS: &str = "orders";
pub const SHIPMENTS: &str = "shipments";

#[allow(dead_code)]
pub const WAIT: Duration = Duration::from_secs(5);

/// Emits as many shipments as the order value says.
pub struct Fanout;

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
            let shipment = OutgoingMessage::new(
                SHIPMENTS,
                message.partition,
                message.key.clone(),
                format!("{}-{}", message.offset, i),
            );
            if let Err(err) = sender.send(shipment).await {
                tracing::error!("Could not ship order {}: {}", message.offset, err);
                return;
            }
        }
    }
}

#[allow(dead_code)]
pub fn fanout() -> Box<dyn MessageProcessor<String, String>> {
    Box::new(Fanout)
}

pub fn broker(partitions: Partition) -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.create_topic(ORDERS, partitions);
    broker.create_topic(SHIPMENTS, partitions);
    broker
}

pub fn config_builder() -> TopicProcessorConfigBuilder<String, String> {
    TopicProcessorConfigBuilder::new(GROUP)
        .broker_list(vec!["in-memory:9092".to_string()])
        .input_topic(ORDERS)
        .topic_codec(ORDERS, TopicCodec::new(StringCodec, StringCodec))
        .topic_codec(SHIPMENTS, TopicCodec::new(StringCodec, StringCodec))
        .mark_offsets_interval(Duration::from_millis(10))
        .shutdown_drain_timeout(Duration::from_millis(200))
}

/// Poll until `group` has committed `expected` for the partition.
#[allow(dead_code)]
pub async fn wait_for_commit(
    broker: &InMemoryBroker,
    partition: Partition,
    expected: Offset,
) -> Result<(), Error> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let committed = broker.committed_offset(GROUP, ORDERS, partition);
        if committed == Some(expected) {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            return Err(Error::BrokerError(format!(
                "partition {} committed {:?}, expected {}",
                partition, committed, expected
            )));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

type Held = (ProducerRecord, mpsc::UnboundedSender<Completion>);

/// Broker whose producers hold every record until the test releases it.
///
/// Consumption and offsets go to the wrapped [`InMemoryBroker`].
#[derive(Clone)]
#[allow(dead_code)]
pub struct GatedBroker {
    pub inner: InMemoryBroker,
    held: Arc<Mutex<Vec<Held>>>,
}

#[allow(dead_code)]
impl GatedBroker {
    pub fn new(inner: InMemoryBroker) -> Self {
        Self {
            inner,
            held: Arc::new(Mutex::new(vec![])),
        }
    }

    pub fn held_values(&self) -> Vec<String> {
        self.held
            .lock()
            .unwrap()
            .iter()
            .map(|(record, _)| String::from_utf8_lossy(&record.value).into_owned())
            .collect()
    }

    pub async fn wait_for_held(&self, count: usize) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.held.lock().unwrap().len() < count {
            if tokio::time::Instant::now() > deadline {
                return Err(Error::BrokerError(format!(
                    "only {:?} records were sent",
                    self.held_values()
                )));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    /// Write the held record with `value` and acknowledge it.
    pub fn release(&self, value: &str) -> Result<(), Error> {
        let (record, completions) = {
            let mut held = self.held.lock().unwrap();
            let index = held
                .iter()
                .position(|(record, _)| record.value == value.as_bytes())
                .ok_or_else(|| Error::BrokerError(format!("{} is not held", value)))?;
            held.remove(index)
        };
        let offset = self.inner.produce(
            &record.topic,
            record.partition,
            record.key.clone(),
            record.value.clone(),
        )?;
        completions
            .send(Completion::success(record, offset))
            .map_err(|_| Error::ProducerClosed)
    }
}

#[async_trait]
impl BrokerClient for GatedBroker {
    async fn consume_partition(
        &self,
        topic: &str,
        partition: Partition,
        start: StartOffset,
    ) -> Result<RecordStream, Error> {
        self.inner.consume_partition(topic, partition, start).await
    }

    async fn producer(&self, config: &ProducerConfig) -> Result<ProducerChannels, Error> {
        let (sender, mut receiver) = mpsc::channel::<ProducerRecord>(config.buffer_size);
        let (completion_sender, completions) = mpsc::unbounded_channel();
        let held = Arc::clone(&self.held);
        tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                held.lock().unwrap().push((record, completion_sender.clone()));
            }
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
    ) -> Result<Option<Offset>, Error> {
        self.inner.fetch_offset(group_id, topic, partition).await
    }

    async fn commit_offset(
        &self,
        group_id: &str,
        topic: &str,
        partition: Partition,
        next_offset: Offset,
    ) -> Result<(), Error> {
        self.inner
            .commit_offset(group_id, topic, partition, next_offset)
            .await
    }

    async fn earliest_offset(&self, topic: &str, partition: Partition) -> Result<Offset, Error> {
        self.inner.earliest_offset(topic, partition).await
    }

    async fn newest_offset(&self, topic: &str, partition: Partition) -> Result<Offset, Error> {
        self.inner.newest_offset(topic, partition).await
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.close().await
    }
}

#[async_trait]
impl BrokerConnector for GatedBroker {
    async fn connect(
        &self,
        _broker_list: &[String],
        _client_id: &str,
    ) -> Result<Arc<dyn BrokerClient>, Error> {
        Ok(Arc::new(self.clone()))
    }
}
