//! Forwarding of records emitted by user logic.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    broker::{Correlation, ProducerRecord},
    codec::TopicCodec,
    error::{Error, Result},
    in_flight::{InFlightMessage, InFlightMessageGroup},
    types::{Offset, OutgoingMessage, Topic},
};

/// Handed to [`MessageProcessor::process`](crate::prelude::MessageProcessor::process)
/// to emit records.
///
/// `send` returns once the record is queued for the producer, not once the
/// broker has acknowledged it. When the producer queue is full it waits for
/// room, which holds up the calling partition.
#[async_trait]
pub trait Sender<K, V>: Send
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn send(&mut self, message: OutgoingMessage<K, V>) -> Result<()>;
}

/// Sender used for a single `process` call.
///
/// Remembers every queued record in call order so the partition processor
/// can turn them into the call's [`InFlightMessageGroup`]. The first failure
/// sticks: later sends return it again and so does
/// [`into_in_flight_group`](Self::into_in_flight_group).
pub(crate) struct OutgoingMessageSender<'a, K, V> {
    codecs: &'a HashMap<Topic, TopicCodec<K, V>>,
    producer: &'a mpsc::Sender<ProducerRecord>,
    input_topic: &'a str,
    sequence: u64,
    submissions: Vec<InFlightMessage>,
    failure: Option<Error>,
}

impl<'a, K, V> OutgoingMessageSender<'a, K, V> {
    pub(crate) fn new(
        codecs: &'a HashMap<Topic, TopicCodec<K, V>>,
        producer: &'a mpsc::Sender<ProducerRecord>,
        input_topic: &'a str,
        sequence: u64,
    ) -> Self {
        Self {
            codecs,
            producer,
            input_topic,
            sequence,
            submissions: vec![],
            failure: None,
        }
    }

    pub(crate) fn into_in_flight_group(self, offset: Offset) -> Result<InFlightMessageGroup> {
        if let Some(err) = self.failure {
            return Err(err);
        }
        Ok(InFlightMessageGroup::new(
            self.sequence,
            offset,
            self.submissions,
        ))
    }

    fn encode(&self, message: &OutgoingMessage<K, V>) -> Result<ProducerRecord> {
        let codec = self
            .codecs
            .get(&message.topic)
            .ok_or_else(|| Error::MissingCodec(message.topic.clone()))?;

        Ok(ProducerRecord {
            topic: message.topic.clone(),
            partition: message.partition,
            key: codec.key.serialize(&message.key)?,
            value: codec.value.serialize(&message.value)?,
            correlation: Correlation {
                topic: self.input_topic.to_owned(),
                sequence: self.sequence,
                slot: self.submissions.len(),
            },
        })
    }

    async fn submit(&mut self, message: OutgoingMessage<K, V>) -> Result<()> {
        let record = self.encode(&message)?;
        tracing::trace!(
            "Sending record to topic {} partition {} for group {}",
            record.topic,
            record.partition,
            self.sequence
        );
        self.producer
            .send(record)
            .await
            .map_err(|_| Error::ProducerClosed)?;
        self.submissions
            .push(InFlightMessage::new(message.topic, message.partition));
        Ok(())
    }
}

#[async_trait]
impl<'a, K, V> Sender<K, V> for OutgoingMessageSender<'a, K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn send(&mut self, message: OutgoingMessage<K, V>) -> Result<()> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if let Err(err) = self.submit(message).await {
            tracing::error!("Could not send record: {}", err);
            self.failure = Some(err.clone());
            return Err(err);
        }
        Ok(())
    }
}
