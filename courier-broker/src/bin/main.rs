use std::sync::Arc;

use courier_broker::aws::{AwsBroker, AwsSettings};
use courier_broker::in_memory::InMemoryBroker;
use courier_broker::{
    handler_fn, Broker, Delivery, HandlerError, MessageHandler, Producer, PublishAttributes,
    Subscriber, SubscriberConfig,
};
use courier_config::{parse_config, Backend, BrokerArgs, Command, PublishArgs, SubscriptionArgs};
use courier_models::errors::{RuntimeError, SendableError};
use courier_utilities::startup::{self, StartupOptions};
use log::{error, info, warn};
use serde_json::Value;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let config = parse_config()?;
    startup::startup(
        "Courier",
        &StartupOptions {
            log_level: config.log_level.clone(),
            log_file: config.log_file.clone(),
        },
    )?;

    let broker = build_broker(&config.broker).await;
    match config.command {
        Command::Publish(args) => publish(broker, args).await,
        Command::Provision(args) => provision(broker, args).await,
        Command::Subscribe(args) => subscribe(broker, args).await,
    }
}

async fn build_broker(args: &BrokerArgs) -> Arc<dyn Broker> {
    match args.backend {
        Backend::Aws => {
            let settings = AwsSettings {
                region: Some(args.region.clone()),
                profile: args.profile.clone(),
                endpoint: args.endpoint.clone(),
                credentials_file: args.credentials_file.clone(),
                fake: args.fake,
            };
            Arc::new(AwsBroker::connect(&settings).await)
        }
        Backend::InMemory => {
            warn!("Using the in-memory broker; state is lost when this process exits");
            Arc::new(InMemoryBroker::new())
        }
    }
}

async fn publish(broker: Arc<dyn Broker>, args: PublishArgs) -> Result<(), SendableError> {
    let payload: Value = serde_json::from_str(&args.payload)
        .map_err(|err| RuntimeError::boxed("courier.publish.invalid_payload", err.to_string()))?;
    let producer = Producer::new(broker);

    if let [topic] = args.topics.as_slice() {
        let attributes = match (args.fifo, args.group_id) {
            (false, _) => PublishAttributes::standard(),
            (true, None) => PublishAttributes::fifo_random(),
            (true, Some(group_id)) => PublishAttributes::fifo(
                group_id,
                args
                    .deduplication_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
        };
        let message_id = producer.publish(topic, &payload, &attributes).await?;
        info!("Published message {} to {}", message_id, topic);
        return Ok(());
    }

    if args.fifo {
        return Err(RuntimeError::boxed(
            "courier.publish.fifo_fan_out",
            "FIFO publishing takes exactly one topic",
        ));
    }

    let report = producer.publish_many(&args.topics, &payload).await;
    match report.failed {
        None => Ok(()),
        Some((topic, err)) => {
            if !report.skipped.is_empty() {
                warn!("Not attempted: {}", report.skipped.join(", "));
            }
            Err(RuntimeError::boxed(
                "courier.publish.failed",
                format!("publishing to {topic} failed: {err}"),
            ))
        }
    }
}

fn subscriber_config(args: &SubscriptionArgs) -> SubscriberConfig {
    let mut config = SubscriberConfig::new(args.subscriber_id.clone())
        .with_topics(args.topic_list())
        .with_fifo(args.fifo)
        .with_dead_letter(!args.no_dead_letter)
        .with_max_receive_count(args.max_receive_count)
        .with_max_messages(args.max_messages)
        .with_require_all_bindings(args.require_all_bindings);
    if let Some(seconds) = args.visibility_timeout_seconds {
        config = config.with_visibility_timeout(seconds);
    }
    config
}

fn logging_handler(subscriber_id: String) -> impl MessageHandler<Value> {
    handler_fn(move |delivery: Delivery<Value>| {
        info!(
            "[{}] message {} (delivery {}): {}",
            subscriber_id, delivery.message_id, delivery.receive_count, delivery.payload
        );
        async { Ok::<(), HandlerError>(()) }
    })
}

async fn provision(broker: Arc<dyn Broker>, args: SubscriptionArgs) -> Result<(), SendableError> {
    let subscriber = Subscriber::<Value, _>::new(
        broker,
        subscriber_config(&args),
        logging_handler(args.subscriber_id.clone()),
    );
    let provisioned = subscriber.provision().await?;

    info!("Queue: {}", provisioned.queue.url);
    if let Some(dead_letter_queue) = &provisioned.dead_letter_queue {
        info!("Dead-letter queue: {}", dead_letter_queue.url);
    }
    for topic in &provisioned.bindings.bound {
        info!("Bound topic: {}", topic.arn);
    }
    for (topic, err) in &provisioned.bindings.failed {
        error!("Failed to bind topic {}: {}", topic, err);
    }
    Ok(())
}

async fn subscribe(broker: Arc<dyn Broker>, args: SubscriptionArgs) -> Result<(), SendableError> {
    let subscriber = Subscriber::<Value, _>::new(
        broker,
        subscriber_config(&args),
        logging_handler(args.subscriber_id.clone()),
    );
    let mut task = subscriber.spawn();

    tokio::select! {
        joined = &mut task => {
            let result = joined
                .map_err(|err| RuntimeError::boxed("courier.subscribe.join", err.to_string()))?;
            result?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|err| RuntimeError::boxed("courier.subscribe.signal", err.to_string()))?;
            info!("Shutdown signal received. Stopping subscriber {}...", args.subscriber_id);
            task.abort();
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    error!("Subscriber task join error: {}", err);
                }
            }
        }
    }
    Ok(())
}
