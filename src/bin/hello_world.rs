use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use kasper::prelude::*;

const NAMES: &str = "names";
const GREETINGS: &str = "greetings";

struct Greeter;

#[async_trait]
impl MessageProcessor<String, String> for Greeter {
    async fn initialize(
        &mut self,
        config: &TopicProcessorConfig<String, String>,
        context: &PartitionProcessorContext,
    ) {
        tracing::info!(
            "Greeter for group {} starting on partition {}",
            config.group_id(),
            context.partition
        );
    }

    async fn process(
        &mut self,
        message: &IncomingMessage<String, String>,
        sender: &mut dyn Sender<String, String>,
        _coordinator: &dyn Coordinator,
    ) {
        let greeting = OutgoingMessage::new(
            GREETINGS,
            message.partition,
            message.key.clone(),
            format!("Hello, {}!", message.value),
        );
        if let Err(err) = sender.send(greeting).await {
            tracing::error!("Could not greet {}: {:?}", message.value, err);
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), ()> {
    tracing_subscriber::fmt::init();

    let broker = InMemoryBroker::new();
    broker.create_topic(NAMES, 3);
    broker.create_topic(GREETINGS, 3);

    let config = TopicProcessorConfigBuilder::new("hello-world")
        .input_topic(NAMES)
        .topic_codec(NAMES, TopicCodec::new(StringCodec, StringCodec))
        .topic_codec(GREETINGS, TopicCodec::new(StringCodec, StringCodec))
        .container_count(1)
        .assign(0, 0)
        .assign(1, 0)
        .assign(2, 0)
        .mark_offsets_interval(Duration::from_millis(100))
        .build()
        .map_err(|err| tracing::error!("{:?}", err))?;

    let mut topic_processor = TopicProcessor::new(
        config,
        || Box::new(Greeter) as Box<dyn MessageProcessor<String, String>>,
        0,
        Arc::new(broker.clone()),
    )
    .map_err(|err| tracing::error!("{:?}", err))?;
    topic_processor
        .start()
        .await
        .map_err(|err| tracing::error!("{:?}", err))?;

    for (i, name) in ["Ada", "Grace", "Edsger", "Barbara", "Ken", "Frances"]
        .iter()
        .enumerate()
    {
        let partition = i as Partition % 3;
        broker
            .produce(NAMES, partition, name.to_string(), name.to_string())
            .map_err(|err| tracing::error!("{:?}", err))?;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    topic_processor
        .shutdown()
        .await
        .map_err(|err| tracing::error!("{:?}", err))?;

    for partition in 0..3 {
        for record in broker.records(GREETINGS, partition) {
            tracing::info!(
                "Partition {} offset {}: {}",
                partition,
                record.offset,
                String::from_utf8_lossy(&record.value)
            );
        }
        tracing::info!(
            "Partition {} committed next offset {:?}",
            partition,
            broker.committed_offset("hello-world", NAMES, partition)
        );
    }
    Ok(())
}
