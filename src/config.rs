//! Topic processor configuration.
//!
//! A [`TopicProcessorConfig`] is assembled through a
//! [`TopicProcessorConfigBuilder`] and validated once, before any partition
//! loop starts. Engine tuning knobs live in [`KasperConfig`].

use std::{collections::HashMap, time::Duration};

use serde_derive::{Deserialize, Serialize};

use crate::{
    codec::TopicCodec,
    error::{Error, Result},
    types::{ContainerId, Partition, Topic},
};

const DEFAULT_MARK_OFFSETS_INTERVAL_MS: u64 = 5000;
const DEFAULT_PRODUCER_BUFFER_SIZE: usize = 256;
const DEFAULT_SHUTDOWN_DRAIN_TIMEOUT_MS: u64 = 5000;

/// How many replicas must acknowledge a produced record before the broker
/// client reports it as successful.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequiredAcks {
    /// Fire and forget.
    None,
    /// Only the partition leader.
    Leader,
    /// The full in-sync replica set.
    #[default]
    All,
}

impl RequiredAcks {
    /// Value of the `acks` field in a Kafka produce request.
    pub fn as_i16(&self) -> i16 {
        match self {
            RequiredAcks::None => 0,
            RequiredAcks::Leader => 1,
            RequiredAcks::All => -1,
        }
    }
}

/// What a partition does when the broker reports that a produced record was
/// not accepted.
///
/// Either way the failed record's group is never acknowledged, so offsets for
/// its topic are not committed past it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendFailurePolicy {
    /// Stop the partition and report [`Error::SendFailed`]. A restart replays
    /// from the last committed offset.
    #[default]
    Halt,
    /// Log the failure and keep consuming. Commits for the affected topic stay
    /// behind the failed record until the partition is restarted.
    ///
    /// The failed group stays at the head of its commit queue, so nothing
    /// behind it is compacted or drained either: the queue grows by one group
    /// per consumed message until the restart.
    Stall,
}

/// Engine tuning shared by every partition of a topic processor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KasperConfig {
    pub required_acks: RequiredAcks,
    /// Capacity of the channel between a partition and its producer. A full
    /// channel stalls that partition until the producer catches up.
    pub producer_buffer_size: usize,
    pub send_failure_policy: SendFailurePolicy,
    /// How long shutdown waits for outstanding completions before releasing
    /// the producer.
    pub shutdown_drain_timeout: Duration,
}

impl Default for KasperConfig {
    fn default() -> Self {
        Self {
            required_acks: RequiredAcks::default(),
            producer_buffer_size: DEFAULT_PRODUCER_BUFFER_SIZE,
            send_failure_policy: SendFailurePolicy::default(),
            shutdown_drain_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_DRAIN_TIMEOUT_MS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TopicProcessorConfig<K, V> {
    /// Name of the processing group. Used as the consumer group id for
    /// offsets and as the prefix of client ids.
    pub topic_processor_name: String,
    pub broker_list: Vec<String>,
    pub input_topics: Vec<Topic>,
    /// Codecs for every topic read or written, input and output alike.
    pub topic_codecs: HashMap<Topic, TopicCodec<K, V>>,
    pub container_count: u32,
    pub partition_assignment: HashMap<Partition, ContainerId>,
    pub mark_offsets_interval: Duration,
    pub kasper_config: KasperConfig,
}

impl<K, V> TopicProcessorConfig<K, V> {
    pub fn group_id(&self) -> &str {
        &self.topic_processor_name
    }

    pub fn producer_client_id(&self, container_id: ContainerId) -> String {
        format!("{}-producer-{}", self.topic_processor_name, container_id)
    }

    pub fn consumer_client_id(&self, container_id: ContainerId) -> String {
        format!("{}-consumer-{}", self.topic_processor_name, container_id)
    }

    /// Partitions assigned to `container_id`, in ascending order.
    pub fn partitions_for_container(&self, container_id: ContainerId) -> Vec<Partition> {
        let mut partitions: Vec<Partition> = self
            .partition_assignment
            .iter()
            .filter(|(_, owner)| **owner == container_id)
            .map(|(partition, _)| *partition)
            .collect();
        partitions.sort_unstable();
        partitions
    }

    /// Check everything that would otherwise only fail once messages flow.
    pub fn validate(&self) -> Result<()> {
        if self.topic_processor_name.is_empty() {
            return Err(Error::InvalidConfig(
                "topic processor name must not be empty".to_string(),
            ));
        }
        if self.input_topics.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one input topic is required".to_string(),
            ));
        }
        for topic in self.input_topics.iter() {
            if !self.topic_codecs.contains_key(topic) {
                return Err(Error::MissingCodec(topic.to_owned()));
            }
        }
        if self.container_count == 0 {
            return Err(Error::InvalidConfig(
                "container count must be at least 1".to_string(),
            ));
        }
        for (partition, container_id) in self.partition_assignment.iter() {
            if *partition < 0 {
                return Err(Error::InvalidConfig(format!(
                    "partition {} is negative",
                    partition
                )));
            }
            if *container_id >= self.container_count {
                return Err(Error::InvalidConfig(format!(
                    "partition {} is assigned to container {} but there are only {} containers",
                    partition, container_id, self.container_count
                )));
            }
        }
        if self.mark_offsets_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "mark offsets interval must be positive".to_string(),
            ));
        }
        if self.kasper_config.producer_buffer_size == 0 {
            return Err(Error::InvalidConfig(
                "producer buffer size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configure a [`TopicProcessorConfig`]. To complete, use the
/// [`build`](Self::build) method, which validates the result.
///
/// ### Example
/// ```rust
/// use kasper::prelude::*;
///
/// let config = TopicProcessorConfigBuilder::<String, String>::new("hello-world")
///     .broker_list(vec!["127.0.0.1:9092".to_string()])
///     .input_topic("hello")
///     .topic_codec("hello", TopicCodec::new(StringCodec, StringCodec))
///     .container_count(1)
///     .assign(0, 0)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.partitions_for_container(0), vec![0]);
/// ```
pub struct TopicProcessorConfigBuilder<K, V> {
    config: TopicProcessorConfig<K, V>,
}

impl<K, V> TopicProcessorConfigBuilder<K, V> {
    pub fn new(topic_processor_name: impl Into<String>) -> Self {
        Self {
            config: TopicProcessorConfig {
                topic_processor_name: topic_processor_name.into(),
                broker_list: vec![],
                input_topics: vec![],
                topic_codecs: HashMap::new(),
                container_count: 1,
                partition_assignment: HashMap::new(),
                mark_offsets_interval: Duration::from_millis(DEFAULT_MARK_OFFSETS_INTERVAL_MS),
                kasper_config: KasperConfig::default(),
            },
        }
    }

    pub fn broker_list(mut self, broker_list: Vec<String>) -> Self {
        self.config.broker_list = broker_list;
        self
    }

    /// Add a topic to consume from. Topics are consumed in the order given.
    pub fn input_topic(mut self, topic: impl Into<Topic>) -> Self {
        let topic = topic.into();
        if !self.config.input_topics.contains(&topic) {
            self.config.input_topics.push(topic);
        }
        self
    }

    pub fn topic_codec(mut self, topic: impl Into<Topic>, codec: TopicCodec<K, V>) -> Self {
        self.config.topic_codecs.insert(topic.into(), codec);
        self
    }

    /// Total number of containers sharing the partitions.
    pub fn container_count(mut self, container_count: u32) -> Self {
        self.config.container_count = container_count;
        self
    }

    /// Assign a partition of the input topics to a container.
    pub fn assign(mut self, partition: Partition, container_id: ContainerId) -> Self {
        self.config
            .partition_assignment
            .insert(partition, container_id);
        self
    }

    pub fn partition_assignment(
        mut self,
        partition_assignment: HashMap<Partition, ContainerId>,
    ) -> Self {
        self.config.partition_assignment = partition_assignment;
        self
    }

    /// How often each partition commits the offsets that are safe to commit.
    ///
    /// A longer interval means fewer offset writes but more messages replayed
    /// after a crash.
    pub fn mark_offsets_interval(mut self, interval: Duration) -> Self {
        self.config.mark_offsets_interval = interval;
        self
    }

    pub fn required_acks(mut self, required_acks: RequiredAcks) -> Self {
        self.config.kasper_config.required_acks = required_acks;
        self
    }

    pub fn producer_buffer_size(mut self, producer_buffer_size: usize) -> Self {
        self.config.kasper_config.producer_buffer_size = producer_buffer_size;
        self
    }

    pub fn send_failure_policy(mut self, policy: SendFailurePolicy) -> Self {
        self.config.kasper_config.send_failure_policy = policy;
        self
    }

    pub fn shutdown_drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.kasper_config.shutdown_drain_timeout = timeout;
        self
    }

    pub fn kasper_config(mut self, kasper_config: KasperConfig) -> Self {
        self.config.kasper_config = kasper_config;
        self
    }

    pub fn build(self) -> Result<TopicProcessorConfig<K, V>> {
        self.config.validate()?;
        Ok(self.config)
    }
}
