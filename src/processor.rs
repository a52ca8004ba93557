//! Capabilities implemented by (or handed to) user processing logic.

use async_trait::async_trait;

use crate::{
    config::TopicProcessorConfig,
    sender::Sender,
    types::{ContainerId, IncomingMessage, Partition, Topic},
};

/// Where a [`MessageProcessor`] instance is running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionProcessorContext {
    pub container_id: ContainerId,
    pub partition: Partition,
    pub input_topics: Vec<Topic>,
}

/// Handle for cooperating with processors on other partitions or containers.
///
/// The engine passes it through untouched; what it offers is up to the
/// deployment.
pub trait Coordinator: Send + Sync {}

/// Coordinator that offers nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCoordinator;

impl Coordinator for NoopCoordinator {}

/// User processing logic. One instance is created per assigned partition.
///
/// `process` is called once per incoming message, in offset order. Records
/// handed to the sender before `process` returns are tracked together: the
/// incoming message's offset is only committed once all of them are
/// acknowledged by the broker.
///
/// ### Example
/// ```rust
/// use async_trait::async_trait;
/// use kasper::prelude::*;
///
/// struct Uppercase;
///
/// #[async_trait]
/// impl MessageProcessor<String, String> for Uppercase {
///     async fn process(
///         &mut self,
///         message: &IncomingMessage<String, String>,
///         sender: &mut dyn Sender<String, String>,
///         _coordinator: &dyn Coordinator,
///     ) {
///         let outgoing = OutgoingMessage::new(
///             "shouting",
///             message.partition,
///             message.key.clone(),
///             message.value.to_uppercase(),
///         );
///         if let Err(err) = sender.send(outgoing).await {
///             tracing::error!("Could not forward message: {}", err);
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait MessageProcessor<K, V>: Send
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Called once before the first message of the partition.
    async fn initialize(
        &mut self,
        _config: &TopicProcessorConfig<K, V>,
        _context: &PartitionProcessorContext,
    ) {
    }

    async fn process(
        &mut self,
        message: &IncomingMessage<K, V>,
        sender: &mut dyn Sender<K, V>,
        coordinator: &dyn Coordinator,
    );
}
