//! # Kasper
//! Partition-parallel stream processing on top of Kafka-style brokers.
//!
//! Kasper consumes one or more input topics, hands every message to user
//! logic together with a sender for output records, and commits input offsets
//! only once every record produced while handling a message (and every message
//! before it) has been acknowledged by the broker. After a crash, processing
//! resumes from the last safe offset, so output is delivered at least once.
//!
//! ## Goals
//! - Keep per-partition ordering: messages of a partition are processed one at
//!   a time, in offset order
//! - Never commit an offset whose output could still be lost
//! - Let partitions run independently so one slow or failing partition does
//!   not stall the others
//! - Keep the broker behind a narrow trait so the engine can be tested and run
//!   in-process
//!
//! ## Table of contents
//! - [Getting started](#getting-started)
//!     - [Processing logic](#processing-logic)
//!     - [Topic processor](#topic-processor)
//!     - [State](#state)
//! - [How offsets are committed](#how-offsets-are-committed)
//!
//! ## Getting started
//! Include the following snippet in your `Cargo.toml` dependencies:
//! ```toml
//! kasper = "0.1"
//! ```
//!
//! ### Processing logic
//! Implement [`MessageProcessor`](prelude::MessageProcessor). One instance is
//! created per partition, so it may keep per-partition state without locking.
//! ```rust
//! use async_trait::async_trait;
//! use kasper::prelude::*;
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl MessageProcessor<String, String> for Greeter {
//!     async fn process(
//!         &mut self,
//!         message: &IncomingMessage<String, String>,
//!         sender: &mut dyn Sender<String, String>,
//!         _coordinator: &dyn Coordinator,
//!     ) {
//!         let greeting = OutgoingMessage::new(
//!             "greetings",
//!             message.partition,
//!             message.key.clone(),
//!             format!("Hello, {}!", message.value),
//!         );
//!         if let Err(err) = sender.send(greeting).await {
//!             tracing::error!("Could not greet {}: {}", message.value, err);
//!         }
//!     }
//! }
//! ```
//!
//! ### Topic processor
//! A [`TopicProcessor`](prelude::TopicProcessor) is one container of a
//! processing group. Partitions are assigned to containers up front in the
//! configuration, built with a
//! [`TopicProcessorConfigBuilder`](prelude::TopicProcessorConfigBuilder).
//! ```rust
//! # use async_trait::async_trait;
//! # use kasper::prelude::*;
//! # struct Greeter;
//! # #[async_trait]
//! # impl MessageProcessor<String, String> for Greeter {
//! #     async fn process(
//! #         &mut self,
//! #         _message: &IncomingMessage<String, String>,
//! #         _sender: &mut dyn Sender<String, String>,
//! #         _coordinator: &dyn Coordinator,
//! #     ) {
//! #     }
//! # }
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let broker = InMemoryBroker::new();
//! broker.create_topic("names", 2);
//! broker.create_topic("greetings", 2);
//!
//! let config = TopicProcessorConfigBuilder::new("greeter")
//!     .input_topic("names")
//!     .topic_codec("names", TopicCodec::new(StringCodec, StringCodec))
//!     .topic_codec("greetings", TopicCodec::new(StringCodec, StringCodec))
//!     .container_count(1)
//!     .assign(0, 0)
//!     .assign(1, 0)
//!     .build()?;
//!
//! let mut topic_processor = TopicProcessor::new(
//!     config,
//!     || Box::new(Greeter) as Box<dyn MessageProcessor<String, String>>,
//!     0,
//!     std::sync::Arc::new(broker.clone()),
//! )?;
//! topic_processor.start().await?;
//!
//! // ...
//!
//! topic_processor.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### State
//! Stateful logic can keep its state in a
//! [`KeyValueStore`](prelude::kv::KeyValueStore).
//! ```rust
//! use kasper::prelude::kv::{InMemoryKeyValueStore, KeyValueStore};
//!
//! # #[tokio::main]
//! # async fn main() -> kasper::prelude::Result<()> {
//! let store = InMemoryKeyValueStore::<u64>::new();
//! store.put("visits", 1u64).await?;
//! store.flush().await?;
//! assert_eq!(store.get("visits").await?, Some(1));
//! # Ok(())
//! # }
//! ```
//!
//! ## How offsets are committed
//! Every processed message becomes an in-flight group with one slot per record
//! sent while handling it. Groups queue up per input topic in consumption
//! order. Periodically, each partition commits the offset after the last group
//! of the fully acknowledged head of its queue. A message that sent nothing is
//! acknowledged immediately, but is still committed in order.

mod broker;
mod codec;
mod config;
mod error;
mod in_flight;
mod kv;
mod partition_processor;
mod processor;
mod sender;
mod topic_processor;
mod types;

pub mod prelude {
    //! Main export of various structures and methods
    //!
    //! # Processing
    //! [`TopicProcessor`] runs a [`PartitionProcessor`] per partition owned by
    //! the container. User logic implements [`MessageProcessor`] and emits
    //! records through the [`Sender`] it is handed.
    //!
    //! # Brokers
    //! The engine talks to a cluster through [`BrokerConnector`] and
    //! [`BrokerClient`]. [`InMemoryBroker`] implements both in-process. With
    //! the `kafka` feature, `KafkaConnector` connects to a real cluster.
    //!
    //! # Offset tracking
    //! The acknowledgment bookkeeping lives in [`in_flight`]. It is exposed
    //! for inspection and for custom engines; a [`TopicProcessor`] manages it
    //! on its own.
    #[cfg(feature = "kafka")]
    pub use crate::broker::kafka::{KafkaClient, KafkaConnector};
    pub use crate::broker::memory::{InMemoryBroker, StoredRecord};
    pub use crate::broker::{
        BrokerClient, BrokerConnector, Completion, ConsumedRecord, Correlation, ProducerChannels,
        ProducerConfig, ProducerRecord, RecordStream, StartOffset,
    };
    pub use crate::codec::{BytesCodec, Codec, JsonCodec, StringCodec, TopicCodec};
    pub use crate::config::{
        KasperConfig, RequiredAcks, SendFailurePolicy, TopicProcessorConfig,
        TopicProcessorConfigBuilder,
    };
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::partition_processor::{resolve_start_offset, PartitionProcessor};
    pub use crate::processor::{
        Coordinator, MessageProcessor, NoopCoordinator, PartitionProcessorContext,
    };
    pub use crate::sender::Sender;
    pub use crate::topic_processor::{ProcessorFactory, TopicProcessor};
    pub use crate::types::{
        ContainerId, IncomingMessage, Offset, OutgoingMessage, Partition, Topic,
    };

    pub use bytes;

    pub mod in_flight {
        pub use crate::in_flight::*;
    }

    pub mod kv {
        pub use crate::kv::*;
    }
}
