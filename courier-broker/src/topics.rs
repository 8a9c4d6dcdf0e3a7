use std::sync::Arc;

use log::{debug, info};

use crate::{arn, Broker, BrokerError, TopicHandle, TopicOptions};

/// Resolves logical topic names to broker topics, creating them on demand.
///
/// Nothing is cached: every call lists the broker's topics, so concurrent
/// callers racing to create the same name converge on one resource.
#[derive(Clone)]
pub struct TopicRegistry {
    broker: Arc<dyn Broker>,
}

impl TopicRegistry {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub async fn find_topic(
        &self,
        name: &str,
        options: TopicOptions,
    ) -> Result<Option<TopicHandle>, BrokerError> {
        let resource_name = options.resource_name(name);
        let topics = self.broker.list_topics().await?;
        Ok(topics
            .into_iter()
            .find(|topic_arn| arn::resource_name(topic_arn) == resource_name)
            .map(|topic_arn| TopicHandle {
                name: resource_name.clone(),
                arn: topic_arn,
            }))
    }

    pub async fn ensure_topic(
        &self,
        name: &str,
        options: TopicOptions,
    ) -> Result<TopicHandle, BrokerError> {
        if let Some(existing) = self.find_topic(name, options).await? {
            debug!("Topic {} resolved to {}", name, existing.arn);
            return Ok(existing);
        }

        let resource_name = options.resource_name(name);
        let topic_arn = self
            .broker
            .create_topic(&resource_name, options.to_attributes())
            .await?;
        info!("Created topic {} ({})", resource_name, topic_arn);
        Ok(TopicHandle {
            name: resource_name,
            arn: topic_arn,
        })
    }
}
