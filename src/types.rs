//! Identifiers and the typed message formats handed to user logic.

/// Name of a topic.
pub type Topic = String;
/// Index of a partition within a topic.
pub type Partition = i32;
/// Position of a record within a topic-partition.
pub type Offset = i64;
/// Index of a member of the processing group, in `0..container_count`.
pub type ContainerId = u32;

/// Decoded record delivered to a [`MessageProcessor`](crate::prelude::MessageProcessor).
#[derive(Clone, Debug, PartialEq)]
pub struct IncomingMessage<K, V> {
    pub topic: Topic,
    pub partition: Partition,
    pub offset: Offset,
    pub key: K,
    pub value: V,
    /// Milliseconds since the unix epoch, as reported by the broker.
    pub timestamp: i64,
}

/// Record emitted by user logic through a [`Sender`](crate::prelude::Sender).
///
/// `partition` is the destination partition, which need not match the
/// partition the triggering message came from.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingMessage<K, V> {
    pub topic: Topic,
    pub partition: Partition,
    pub key: K,
    pub value: V,
}

impl<K, V> OutgoingMessage<K, V> {
    pub fn new(topic: impl Into<Topic>, partition: Partition, key: K, value: V) -> Self {
        Self {
            topic: topic.into(),
            partition,
            key,
            value,
        }
    }
}
