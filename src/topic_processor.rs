//! Runs one [`PartitionProcessor`] per partition assigned to this container.

use std::sync::Arc;

use tokio::{sync::watch, task::JoinSet};
use tracing::instrument;

use crate::{
    broker::BrokerConnector,
    config::TopicProcessorConfig,
    error::{Error, Result},
    partition_processor::PartitionProcessor,
    processor::{Coordinator, MessageProcessor, NoopCoordinator, PartitionProcessorContext},
    types::{ContainerId, Partition},
};

/// Creates the user logic instance for a partition.
pub type ProcessorFactory<K, V> =
    Box<dyn Fn() -> Box<dyn MessageProcessor<K, V>> + Send + Sync>;

/// A member of a processing group.
///
/// Each partition of the input topics is statically assigned to one
/// container in the configuration. `start` spawns a task per partition owned
/// by this container; every task has its own broker client, producer and
/// consumer streams. A partition that hits a fatal error stops on its own and
/// is reported through [`join_next`](Self::join_next); the others keep going.
///
/// ### Example
/// ```rust
/// use std::sync::Arc;
///
/// use async_trait::async_trait;
/// use kasper::prelude::*;
///
/// struct Printer;
///
/// #[async_trait]
/// impl MessageProcessor<String, String> for Printer {
///     async fn process(
///         &mut self,
///         message: &IncomingMessage<String, String>,
///         _sender: &mut dyn Sender<String, String>,
///         _coordinator: &dyn Coordinator,
///     ) {
///         println!("{} => {}", message.key, message.value);
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() -> Result<()> {
/// let broker = InMemoryBroker::new();
/// broker.create_topic("hello", 1);
///
/// let config = TopicProcessorConfigBuilder::new("hello-world")
///     .input_topic("hello")
///     .topic_codec("hello", TopicCodec::new(StringCodec, StringCodec))
///     .assign(0, 0)
///     .build()?;
///
/// let mut topic_processor = TopicProcessor::new(
///     config,
///     || Box::new(Printer) as Box<dyn MessageProcessor<String, String>>,
///     0,
///     Arc::new(broker.clone()),
/// )?;
/// topic_processor.start().await?;
/// topic_processor.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct TopicProcessor<K, V> {
    config: Arc<TopicProcessorConfig<K, V>>,
    container_id: ContainerId,
    connector: Arc<dyn BrokerConnector>,
    make_processor: ProcessorFactory<K, V>,
    coordinator: Arc<dyn Coordinator>,
    shutdown: watch::Sender<bool>,
    workers: JoinSet<Result<Partition>>,
}

impl<K, V> TopicProcessor<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Validate the configuration and prepare the container. Nothing is
    /// consumed until [`start`](Self::start).
    pub fn new(
        config: TopicProcessorConfig<K, V>,
        make_processor: impl Fn() -> Box<dyn MessageProcessor<K, V>> + Send + Sync + 'static,
        container_id: ContainerId,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self> {
        config.validate()?;
        if container_id >= config.container_count {
            return Err(Error::InvalidConfig(format!(
                "container {} is outside of the {} configured containers",
                container_id, config.container_count
            )));
        }
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            container_id,
            connector,
            make_processor: Box::new(make_processor),
            coordinator: Arc::new(NoopCoordinator),
            shutdown,
            workers: JoinSet::new(),
        })
    }

    /// Hand `coordinator` to the user logic instead of the no-op one.
    pub fn with_coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn container_id(&self) -> ContainerId {
        self.container_id
    }

    /// Partitions this container owns.
    pub fn partitions(&self) -> Vec<Partition> {
        self.config.partitions_for_container(self.container_id)
    }

    /// Number of partition tasks that have not finished yet.
    pub fn running(&self) -> usize {
        self.workers.len()
    }

    /// Start every owned partition.
    ///
    /// Either all partitions start or none do: when one fails, the ones
    /// already started are shut down again and the error is returned.
    #[instrument(name = "topic-processor-start", skip(self), fields(container = self.container_id))]
    pub async fn start(&mut self) -> Result<()> {
        let partitions = self.partitions();
        if partitions.is_empty() {
            tracing::warn!(
                "Container {} | no partitions assigned to this container",
                self.container_id
            );
        }

        let mut started = Vec::with_capacity(partitions.len());
        for partition in partitions {
            match self.start_partition(partition).await {
                Ok(partition_processor) => started.push(partition_processor),
                Err(err) => {
                    tracing::error!(
                        "Container {} | could not start partition {}: {}",
                        self.container_id,
                        partition,
                        err
                    );
                    for mut partition_processor in started {
                        if let Err(shutdown_err) = partition_processor.shutdown().await {
                            tracing::warn!(
                                "Container {} | could not stop partition {}: {}",
                                self.container_id,
                                partition_processor.partition(),
                                shutdown_err
                            );
                        }
                    }
                    return Err(Error::PartitionFailed {
                        partition,
                        source: Box::new(err),
                    });
                }
            }
        }

        for partition_processor in started {
            let partition = partition_processor.partition();
            let shutdown = self.shutdown.subscribe();
            self.workers.spawn(async move {
                partition_processor
                    .run(shutdown)
                    .await
                    .map(|()| partition)
                    .map_err(|err| Error::PartitionFailed {
                        partition,
                        source: Box::new(err),
                    })
            });
        }

        tracing::info!(
            "Container {} | running {} partitions of {:?}",
            self.container_id,
            self.workers.len(),
            self.config.input_topics
        );
        Ok(())
    }

    async fn start_partition(&self, partition: Partition) -> Result<PartitionProcessor<K, V>> {
        let client = self
            .connector
            .connect(
                &self.config.broker_list,
                &self.config.consumer_client_id(self.container_id),
            )
            .await?;
        let context = PartitionProcessorContext {
            container_id: self.container_id,
            partition,
            input_topics: self.config.input_topics.clone(),
        };

        let started = PartitionProcessor::start(
            Arc::clone(&self.config),
            context,
            Arc::clone(&client),
            (self.make_processor)(),
            Arc::clone(&self.coordinator),
        )
        .await;
        if started.is_err() {
            if let Err(close_err) = client.close().await {
                tracing::warn!("Could not close broker client: {}", close_err);
            }
        }
        started
    }

    /// Wait for the next partition task to finish.
    ///
    /// Returns the partition on a clean stop, [`Error::PartitionFailed`] when
    /// the partition hit a fatal error and `None` when no task is left.
    pub async fn join_next(&mut self) -> Option<Result<Partition>> {
        let joined = self.workers.join_next().await?;
        Some(match joined {
            Ok(result) => result,
            Err(err) => Err(Error::WorkerPanicked(err.to_string())),
        })
    }

    /// Signal every partition to stop and wait for all of them.
    ///
    /// Returns the first failure, if any partition failed.
    #[instrument(name = "topic-processor-shutdown", skip(self), fields(container = self.container_id))]
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!(
            "Container {} | stopping {} partitions",
            self.container_id,
            self.workers.len()
        );
        self.shutdown.send_replace(true);

        let mut first_error = None;
        while let Some(result) = self.join_next().await {
            match result {
                Ok(partition) => tracing::debug!(
                    "Container {} | partition {} stopped",
                    self.container_id,
                    partition
                ),
                Err(err) => {
                    tracing::error!("Container {} | {}", self.container_id, err);
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
