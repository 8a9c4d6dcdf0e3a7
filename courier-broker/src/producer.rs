use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info};
use serde::Serialize;

use crate::{attributes, Broker, BrokerError, PublishAttributes, PublishInput, TopicRegistry};

/// Result of publishing one payload to several topics.
#[derive(Debug, Default)]
pub struct FanOutReport {
    /// (topic, message id) in publish order.
    pub published: Vec<(String, String)>,
    /// First failure; publishing stopped here.
    pub failed: Option<(String, BrokerError)>,
    /// Topics never attempted because of the failure.
    pub skipped: Vec<String>,
}

impl FanOutReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_none()
    }
}

/// Publishes JSON payloads to topics, creating topics on first use.
#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn Broker>,
    topics: TopicRegistry,
}

impl Producer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            topics: TopicRegistry::new(broker.clone()),
            broker,
        }
    }

    /// Publishes `payload` as JSON and returns the broker's message id.
    pub async fn publish<T>(
        &self,
        topic: &str,
        payload: &T,
        publish_attributes: &PublishAttributes,
    ) -> Result<String, BrokerError>
    where
        T: Serialize + ?Sized,
    {
        let message = serde_json::to_string(payload)?;
        let topic_handle = self
            .topics
            .ensure_topic(topic, publish_attributes.topic_options())
            .await?;

        let mut input = PublishInput {
            topic_arn: topic_handle.arn,
            message,
            ..PublishInput::default()
        };

        if let Some(fifo) = &publish_attributes.fifo {
            input.message_group_id = Some(fifo.message_group_id.clone());
            input.message_attributes = HashMap::from([(
                attributes::MESSAGE_GROUP_ID.to_string(),
                fifo.message_group_id.clone(),
            )]);
            if let Some(deduplication_id) = &fifo.message_deduplication_id {
                input.message_deduplication_id = Some(deduplication_id.clone());
                input.message_attributes.insert(
                    attributes::MESSAGE_DEDUPLICATION_ID.to_string(),
                    deduplication_id.clone(),
                );
            }
        }

        let message_id = self.broker.publish(input).await?;
        debug!("Published message {} to {}", message_id, topic_handle.name);
        Ok(message_id)
    }

    /// Publishes with attributes given in the `Fifo` / `MessageGroupID` /
    /// `MessageDeduplicationID` string map form.
    pub async fn publish_with_map<T>(
        &self,
        topic: &str,
        payload: &T,
        publish_attributes: &HashMap<String, String>,
    ) -> Result<String, BrokerError>
    where
        T: Serialize + ?Sized,
    {
        let publish_attributes = PublishAttributes::from_map(publish_attributes)?;
        self.publish(topic, payload, &publish_attributes).await
    }

    /// Publishes the same payload to each topic in order, stopping at the
    /// first failure. Topics after the failing one are not attempted.
    pub async fn publish_many<T, S>(&self, topics: &[S], payload: &T) -> FanOutReport
    where
        T: Serialize + ?Sized,
        S: AsRef<str>,
    {
        let mut report = FanOutReport::default();
        let standard = PublishAttributes::standard();

        for (index, topic) in topics.iter().enumerate() {
            let topic = topic.as_ref();
            match self.publish(topic, payload, &standard).await {
                Ok(message_id) => {
                    info!("Sent message {} to {}", message_id, topic);
                    report.published.push((topic.to_string(), message_id));
                }
                Err(err) => {
                    error!("Failed to send message to {}: {}", topic, err);
                    report.failed = Some((topic.to_string(), err));
                    report.skipped = topics[index + 1..]
                        .iter()
                        .map(|skipped| skipped.as_ref().to_string())
                        .collect();
                    break;
                }
            }
        }

        report
    }
}
