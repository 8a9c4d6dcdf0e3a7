use std::sync::Arc;
use std::time::Duration;

use courier_broker::in_memory::{Fault, InMemoryBroker};
use courier_broker::{
    handler_fn, Broker, Delivery, HandlerError, Producer, PublishAttributes, Subscriber,
    SubscriberConfig, SubscriberState,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    item: String,
}

fn order(id: u32, item: &str) -> Order {
    Order {
        id,
        item: item.to_string(),
    }
}

fn shared(broker: &InMemoryBroker) -> Arc<dyn Broker> {
    Arc::new(broker.clone())
}

/// Starts a subscriber that forwards deliveries to a channel and waits until
/// it is polling.
async fn start(
    broker: &InMemoryBroker,
    config: SubscriberConfig,
) -> (UnboundedReceiver<Delivery<Order>>, JoinHandle<()>) {
    let (tx, rx) = unbounded_channel();
    let handler = handler_fn(move |delivery: Delivery<Order>| {
        let _ = tx.send(delivery);
        async { Ok::<(), HandlerError>(()) }
    });
    let subscriber = Subscriber::<Order, _>::new(shared(broker), config, handler);
    let mut state = subscriber.state();
    let task = tokio::spawn(async move {
        let _ = subscriber.run().await;
    });
    state
        .wait_for(|state| *state == SubscriberState::Polling)
        .await
        .unwrap();
    (rx, task)
}

async fn next(rx: &mut UnboundedReceiver<Delivery<Order>>) -> Delivery<Order> {
    timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("delivery within the timeout")
        .expect("subscriber still running")
}

#[tokio::test(start_paused = true)]
async fn published_payload_reaches_subscriber_and_is_deleted() {
    let broker = InMemoryBroker::new();
    let (mut rx, task) =
        start(&broker, SubscriberConfig::new("billing").with_topic("orders")).await;

    Producer::new(shared(&broker))
        .publish("orders", &order(1, "book"), &PublishAttributes::standard())
        .await
        .unwrap();

    let delivery = next(&mut rx).await;
    assert_eq!(delivery.payload, order(1, "book"));
    assert_eq!(delivery.receive_count, 1);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.queue_depth("billing"), 0);
    task.abort();
}

#[tokio::test(start_paused = true)]
async fn malformed_message_is_dropped_and_consumption_continues() {
    let broker = InMemoryBroker::new();
    let (mut rx, task) =
        start(&broker, SubscriberConfig::new("billing").with_topic("orders")).await;

    broker.send_raw("billing", "{not json").unwrap();
    Producer::new(shared(&broker))
        .publish("orders", &order(2, "lamp"), &PublishAttributes::standard())
        .await
        .unwrap();

    let delivery = next(&mut rx).await;
    assert_eq!(delivery.payload, order(2, "lamp"));

    sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.queue_depth("billing"), 0);
    assert!(rx.try_recv().is_err());
    task.abort();
}

#[tokio::test(start_paused = true)]
async fn failing_handler_moves_message_to_dead_letter_queue() {
    let broker = InMemoryBroker::new();
    let (attempts_tx, mut attempts) = unbounded_channel();
    let failing = handler_fn(move |delivery: Delivery<Order>| {
        let _ = attempts_tx.send(delivery.receive_count);
        async { Err::<(), HandlerError>("downstream unavailable".into()) }
    });
    let subscriber = Subscriber::<Order, _>::new(
        shared(&broker),
        SubscriberConfig::new("billing")
            .with_topic("orders")
            .with_max_receive_count(1)
            .with_visibility_timeout(5),
        failing,
    );
    let mut state = subscriber.state();
    let task = subscriber.spawn();
    state
        .wait_for(|state| *state == SubscriberState::Polling)
        .await
        .unwrap();

    Producer::new(shared(&broker))
        .publish("orders", &order(3, "desk"), &PublishAttributes::standard())
        .await
        .unwrap();

    sleep(Duration::from_secs(60)).await;
    let mut seen = Vec::new();
    while let Ok(count) = attempts.try_recv() {
        seen.push(count);
    }
    assert_eq!(seen, vec![1]);
    assert_eq!(broker.queue_depth("billing"), 0);
    assert_eq!(broker.queue_depth("billing_dlq"), 1);
    task.abort();

    let (mut dead_letters, reader) = start(
        &broker,
        SubscriberConfig::new("billing_dlq").with_dead_letter(false),
    )
    .await;
    let delivery = next(&mut dead_letters).await;
    assert_eq!(delivery.payload, order(3, "desk"));
    assert_eq!(delivery.receive_count, 1);
    reader.abort();
}

#[tokio::test(start_paused = true)]
async fn fifo_subscriber_sees_group_in_publish_order() {
    let broker = InMemoryBroker::new();
    let (mut rx, task) = start(
        &broker,
        SubscriberConfig::new("billing")
            .with_topic("orders")
            .with_fifo(true),
    )
    .await;

    let producer = Producer::new(shared(&broker));
    for (id, item) in [(1, "a"), (2, "b")] {
        producer
            .publish(
                "orders",
                &order(id, item),
                &PublishAttributes::fifo("customer-7", format!("order-{id}")),
            )
            .await
            .unwrap();
    }

    let first = next(&mut rx).await;
    assert_eq!(first.payload, order(1, "a"));
    assert_eq!(first.message_group_id.as_deref(), Some("customer-7"));
    assert_eq!(next(&mut rx).await.payload, order(2, "b"));
    assert_eq!(broker.topic_names(), vec!["orders.fifo"]);
    task.abort();
}

#[tokio::test]
async fn fan_out_and_fan_in_reach_every_bound_queue() {
    let broker = InMemoryBroker::new();
    let ignore = || handler_fn(|_: Delivery<Order>| async { Ok::<(), HandlerError>(()) });

    Subscriber::<Order, _>::new(
        shared(&broker),
        SubscriberConfig::new("billing").with_topic("orders"),
        ignore(),
    )
    .provision()
    .await
    .unwrap();
    Subscriber::<Order, _>::new(
        shared(&broker),
        SubscriberConfig::new("audit").with_topics(["orders", "invoices"]),
        ignore(),
    )
    .provision()
    .await
    .unwrap();

    let report = Producer::new(shared(&broker))
        .publish_many(&["orders", "invoices"], &order(4, "chair"))
        .await;

    assert!(report.is_complete());
    assert_eq!(report.published.len(), 2);
    assert_eq!(broker.queue_depth("billing"), 1);
    assert_eq!(broker.queue_depth("audit"), 2);
}

#[tokio::test]
async fn fan_out_stops_at_first_failing_topic() {
    let broker = InMemoryBroker::new();
    let producer = Producer::new(shared(&broker));
    producer
        .publish("invoices", &order(0, "seed"), &PublishAttributes::standard())
        .await
        .unwrap();
    broker.inject_fault(Fault::Publish {
        topic: "invoices".into(),
    });

    let report = producer
        .publish_many(&["orders", "invoices", "refunds"], &order(5, "pen"))
        .await;

    assert!(!report.is_complete());
    assert_eq!(report.published.len(), 1);
    assert_eq!(report.published[0].0, "orders");
    assert_eq!(
        report.failed.as_ref().map(|(topic, _)| topic.as_str()),
        Some("invoices")
    );
    assert_eq!(report.skipped, vec!["refunds"]);
    assert_eq!(broker.topic_names(), vec!["invoices", "orders"]);
}

#[tokio::test(start_paused = true)]
async fn subscriber_keeps_consuming_bound_topics_when_one_binding_fails() {
    let broker = InMemoryBroker::new();
    broker.inject_fault(Fault::Subscribe {
        topic: "broken".into(),
    });
    let (mut rx, task) = start(
        &broker,
        SubscriberConfig::new("billing").with_topics(["broken", "orders"]),
    )
    .await;

    Producer::new(shared(&broker))
        .publish("orders", &order(6, "mug"), &PublishAttributes::standard())
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await.payload, order(6, "mug"));
    assert!(broker.subscriptions("broken").is_empty());
    task.abort();
}
