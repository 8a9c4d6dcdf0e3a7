use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info};

use crate::{
    arn, attributes,
    policy::{self, RedrivePolicy},
    Broker, BrokerError, QueueHandle, TopicHandle, TopicOptions, TopicRegistry,
};

/// Subscription protocol for queue endpoints.
pub const QUEUE_PROTOCOL: &str = "sqs";

/// Outcome of binding one queue to several topics.
#[derive(Debug, Default)]
pub struct BindReport {
    pub bound: Vec<TopicHandle>,
    pub failed: Vec<(String, BrokerError)>,
}

impl BindReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_topics(&self) -> Vec<String> {
        self.failed.iter().map(|(topic, _)| topic.clone()).collect()
    }
}

/// Subscribes queues to topics and writes the access and redrive policies
/// that make delivery and dead-lettering work.
#[derive(Clone)]
pub struct SubscriptionBinder {
    broker: Arc<dyn Broker>,
    topics: TopicRegistry,
}

impl SubscriptionBinder {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            topics: TopicRegistry::new(broker.clone()),
            broker,
        }
    }

    /// Binds `queue` to a single topic. The queue's policy is overwritten to
    /// grant only this topic.
    pub async fn bind(
        &self,
        queue: &QueueHandle,
        dead_letter_queue: Option<&QueueHandle>,
        topic: &TopicHandle,
        max_receive_count: u32,
    ) -> Result<(), BrokerError> {
        self.bind_granting(
            queue,
            dead_letter_queue,
            topic,
            &[topic.arn.clone()],
            max_receive_count,
        )
        .await
    }

    /// Resolves and binds every named topic. A failing topic is logged and
    /// recorded in the report; the remaining topics are still attempted.
    pub async fn bind_all(
        &self,
        queue: &QueueHandle,
        dead_letter_queue: Option<&QueueHandle>,
        topic_names: &[String],
        options: TopicOptions,
        max_receive_count: u32,
    ) -> BindReport {
        let mut report = BindReport::default();
        let mut granted: Vec<String> = Vec::new();

        for name in topic_names {
            let topic = match self.topics.ensure_topic(name, options).await {
                Ok(topic) => topic,
                Err(err) => {
                    error!("Error resolving topic {} for {}: {}", name, queue.name, err);
                    report.failed.push((name.clone(), err));
                    continue;
                }
            };

            let mut grants = granted.clone();
            grants.push(topic.arn.clone());
            match self
                .bind_granting(queue, dead_letter_queue, &topic, &grants, max_receive_count)
                .await
            {
                Ok(()) => {
                    info!("Queue {} subscribed to {}", queue.name, topic.arn);
                    granted = grants;
                    report.bound.push(topic);
                }
                Err(err) => {
                    error!("Error binding {} to topic {}: {}", queue.name, name, err);
                    report.failed.push((name.clone(), err));
                }
            }
        }

        report
    }

    async fn bind_granting(
        &self,
        queue: &QueueHandle,
        dead_letter_queue: Option<&QueueHandle>,
        topic: &TopicHandle,
        granted_topic_arns: &[String],
        max_receive_count: u32,
    ) -> Result<(), BrokerError> {
        let queue_arn = arn::queue_url_to_arn(&queue.url)?;
        self.broker
            .subscribe(&topic.arn, QUEUE_PROTOCOL, &queue_arn)
            .await?;

        let mut queue_attributes = HashMap::from([(
            attributes::POLICY.to_string(),
            policy::access_policy(&queue_arn, granted_topic_arns),
        )]);
        if let Some(dead_letter_queue) = dead_letter_queue {
            let dead_letter_arn = arn::queue_url_to_arn(&dead_letter_queue.url)?;
            queue_attributes.insert(
                attributes::REDRIVE_POLICY.to_string(),
                RedrivePolicy::new(dead_letter_arn, max_receive_count).to_json()?,
            );
        }

        self.broker
            .set_queue_attributes(&queue.url, queue_attributes)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::{Fault, InMemoryBroker};
    use crate::QueueRegistry;

    struct Fixture {
        broker: InMemoryBroker,
        binder: SubscriptionBinder,
        queue: QueueHandle,
        dead_letter: QueueHandle,
    }

    async fn fixture() -> Fixture {
        let broker = InMemoryBroker::new();
        let shared: Arc<dyn Broker> = Arc::new(broker.clone());
        let queues = QueueRegistry::new(shared.clone());
        let queue = queues.ensure_queue("billing", false).await.unwrap();
        let dead_letter = queues
            .ensure_dead_letter_queue("billing", false)
            .await
            .unwrap();
        Fixture {
            broker,
            binder: SubscriptionBinder::new(shared),
            queue,
            dead_letter,
        }
    }

    fn names(topics: &[&str]) -> Vec<String> {
        topics.iter().map(|topic| topic.to_string()).collect()
    }

    #[tokio::test]
    async fn bind_writes_policy_and_redrive() {
        let f = fixture().await;
        let topic = TopicRegistry::new(Arc::new(f.broker.clone()))
            .ensure_topic("orders", TopicOptions::default())
            .await
            .unwrap();

        f.binder
            .bind(&f.queue, Some(&f.dead_letter), &topic, 3)
            .await
            .unwrap();

        let attrs = f.broker.queue_attributes("billing").unwrap();
        assert!(policy::policy_allows(&attrs["Policy"], &topic.arn));
        let redrive = RedrivePolicy::from_json(&attrs["RedrivePolicy"]).unwrap();
        assert_eq!(
            redrive.dead_letter_target_arn,
            "arn:aws:sqs:us-east-1:000000000000:billing_dlq"
        );
        assert_eq!(redrive.max_receive_count, 3);
        assert_eq!(
            f.broker.subscriptions("orders"),
            vec!["arn:aws:sqs:us-east-1:000000000000:billing"]
        );
    }

    #[tokio::test]
    async fn binding_again_is_harmless() {
        let f = fixture().await;
        let topics = names(&["orders"]);
        for _ in 0..2 {
            let report = f
                .binder
                .bind_all(&f.queue, Some(&f.dead_letter), &topics, TopicOptions::default(), 5)
                .await;
            assert!(report.is_complete());
        }
        assert_eq!(f.broker.subscriptions("orders").len(), 1);
    }

    #[tokio::test]
    async fn bind_all_grants_every_bound_topic() {
        let f = fixture().await;
        let report = f
            .binder
            .bind_all(
                &f.queue,
                Some(&f.dead_letter),
                &names(&["orders", "refunds"]),
                TopicOptions::default(),
                5,
            )
            .await;

        assert!(report.is_complete());
        let policy_document = &f.broker.queue_attributes("billing").unwrap()["Policy"];
        for topic in &report.bound {
            assert!(policy::policy_allows(policy_document, &topic.arn));
        }
    }

    #[tokio::test]
    async fn failing_topic_does_not_stop_the_rest() {
        let f = fixture().await;
        f.broker.inject_fault(Fault::Subscribe {
            topic: "broken".into(),
        });

        let report = f
            .binder
            .bind_all(
                &f.queue,
                Some(&f.dead_letter),
                &names(&["broken", "orders"]),
                TopicOptions::default(),
                5,
            )
            .await;

        assert_eq!(report.failed_topics(), vec!["broken"]);
        assert_eq!(report.bound.len(), 1);
        assert_eq!(report.bound[0].name, "orders");
        assert_eq!(f.broker.subscriptions("orders").len(), 1);
    }

    #[tokio::test]
    async fn unrecognized_queue_url_fails_the_bind() {
        let f = fixture().await;
        let topic = TopicRegistry::new(Arc::new(f.broker.clone()))
            .ensure_topic("orders", TopicOptions::default())
            .await
            .unwrap();
        let bogus = QueueHandle {
            name: "billing".into(),
            url: "billing".into(),
        };

        let err = f.binder.bind(&bogus, None, &topic, 5).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnrecognizedQueueUrl(_)));
    }
}
